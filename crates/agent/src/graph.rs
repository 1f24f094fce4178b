//! Runner for the infrastructure conversation graph.
//!
//! Routing lives in [`tars_core::flows`]; this module executes nodes, writes a
//! checkpoint after each one and stops at the approval and need-info
//! interrupts. A paused run is continued with [`ConversationGraph::resume`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use tars_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use tars_core::domain::models::schema_properties;
use tars_core::flows::{FlowContext, FlowEngine, FlowEvent, FlowTransitionError, GraphNode, HitlApprovalFlow};
use tars_core::{
    ApprovalDecision, ChatMessage, Checkpoint, ConversationState, Interrupt, ResponseModel,
    Resume, ToolCall,
};
use tars_db::repositories::{CheckpointRepository, RepositoryError};

use crate::conversation::{synthetic_tool_use_id, today};
use crate::guardrails::{GuardrailDecision, GuardrailPolicy, ToolIntent};
use crate::llm::{LlmClient, LlmError, LlmRequest, LlmResponse, JSON_PREFILL};
use crate::prompts::{PromptError, PromptLibrary};
use crate::tools::{render_output, ToolRegistry};

pub const DEFAULT_DENIAL_REASON: &str = "User did not authorize this change.";
const NO_TOOL_CALL_TO_APPROVE: &str = "No tool call found to approve.";
const LLM_MAX_TOKENS: u32 = 1024;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Flow(#[from] FlowTransitionError),
    #[error("recursion limit of {0} node executions reached without finishing")]
    RecursionLimit(u32),
    #[error("thread {thread_id} is not waiting for human input")]
    NotInterrupted { thread_id: String },
    #[error("node {node} needs a resume value")]
    MissingResume { node: GraphNode },
    #[error("approval requested but the last message carries no tool call")]
    MissingToolCall,
}

#[derive(Clone, Debug, PartialEq)]
pub enum GraphOutcome {
    Finished { state: ConversationState },
    Interrupted { interrupt: Interrupt, state: ConversationState },
}

impl GraphOutcome {
    pub fn state(&self) -> &ConversationState {
        match self {
            Self::Finished { state } | Self::Interrupted { state, .. } => state,
        }
    }
}

/// The `content` of the last AI turn, parsed when it is a response object.
pub fn final_content(state: &ConversationState) -> String {
    match state.last_ai() {
        Some(message) => ResponseModel::from_content(message.content())
            .map(|parsed| parsed.content)
            .unwrap_or_else(|| message.content().to_string()),
        None => String::new(),
    }
}

#[derive(Clone, Debug)]
pub struct GraphSettings {
    pub max_steps: u32,
    pub ttl_days: u32,
    pub utc_offset_minutes: i32,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self { max_steps: 25, ttl_days: 30, utc_offset_minutes: 0 }
    }
}

pub struct ConversationGraph {
    llm: Arc<dyn LlmClient>,
    tools: ToolRegistry,
    guardrails: GuardrailPolicy,
    prompts: Arc<PromptLibrary>,
    checkpoints: Arc<dyn CheckpointRepository>,
    audit: Arc<dyn AuditSink>,
    engine: FlowEngine<HitlApprovalFlow>,
    settings: GraphSettings,
}

impl ConversationGraph {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: ToolRegistry,
        prompts: Arc<PromptLibrary>,
        checkpoints: Arc<dyn CheckpointRepository>,
        audit: Arc<dyn AuditSink>,
        settings: GraphSettings,
    ) -> Self {
        let guardrails = GuardrailPolicy::with_tools(tools.names());
        Self {
            llm,
            tools,
            guardrails,
            prompts,
            checkpoints,
            audit,
            engine: FlowEngine::default(),
            settings,
        }
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointRepository> {
        &self.checkpoints
    }

    /// Runs from the entry node. `previous` is the thread's newest checkpoint,
    /// if any, so sequence numbers keep increasing.
    pub async fn start(
        &self,
        thread_id: &str,
        state: ConversationState,
        previous: Option<&Checkpoint>,
        audit: &AuditContext,
    ) -> Result<GraphOutcome, GraphError> {
        let sequence = previous.map(|checkpoint| checkpoint.sequence + 1).unwrap_or(0);
        self.run(thread_id, state, self.engine.entry(), None, sequence, audit).await
    }

    pub async fn resume(
        &self,
        checkpoint: &Checkpoint,
        resume: Resume,
        audit: &AuditContext,
    ) -> Result<GraphOutcome, GraphError> {
        let node = checkpoint
            .next
            .filter(GraphNode::is_interrupt)
            .ok_or_else(|| GraphError::NotInterrupted { thread_id: checkpoint.thread_id.clone() })?;
        self.run(
            &checkpoint.thread_id,
            checkpoint.state.clone(),
            node,
            Some(resume),
            checkpoint.sequence + 1,
            audit,
        )
        .await
    }

    async fn run(
        &self,
        thread_id: &str,
        mut state: ConversationState,
        mut node: GraphNode,
        mut resume: Option<Resume>,
        mut sequence: i64,
        audit: &AuditContext,
    ) -> Result<GraphOutcome, GraphError> {
        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps > self.settings.max_steps {
                warn!(
                    event_name = "graph.recursion_limit",
                    thread_id,
                    correlation_id = %audit.correlation_id,
                    max_steps = self.settings.max_steps,
                    "graph run aborted"
                );
                return Err(GraphError::RecursionLimit(self.settings.max_steps));
            }

            info!(
                event_name = "graph.node",
                thread_id,
                correlation_id = %audit.correlation_id,
                node = node.as_str(),
                step = steps,
                "executing graph node"
            );
            self.execute(node, &mut state, resume.take(), audit).await?;

            let event = FlowEvent::for_node(node);
            let context = FlowContext::from_state(&state);
            let outcome =
                self.engine.apply_with_audit(&node, &event, &context, self.audit.as_ref(), audit)?;

            match outcome.to {
                None => {
                    self.save(thread_id, sequence, node, None, &state, None).await?;
                    info!(event_name = "graph.finished", thread_id, correlation_id = %audit.correlation_id, steps);
                    return Ok(GraphOutcome::Finished { state });
                }
                Some(next) if next.is_interrupt() => {
                    let interrupt = interrupt_for(next, &state)?;
                    self.save(thread_id, sequence, node, Some(next), &state, Some(interrupt.clone()))
                        .await?;
                    info!(
                        event_name = "graph.interrupted",
                        thread_id,
                        correlation_id = %audit.correlation_id,
                        interrupt_type = interrupt.kind(),
                    );
                    if let Interrupt::ApprovalRequest { tool_name, .. } = &interrupt {
                        self.audit.emit(
                            AuditEvent::new(audit, "approval.requested", AuditCategory::Approval, AuditOutcome::Success)
                                .with_metadata("tool_name", tool_name.clone()),
                        );
                    }
                    return Ok(GraphOutcome::Interrupted { interrupt, state });
                }
                Some(next) => {
                    self.save(thread_id, sequence, node, Some(next), &state, None).await?;
                    sequence += 1;
                    node = next;
                }
            }
        }
    }

    async fn save(
        &self,
        thread_id: &str,
        sequence: i64,
        node: GraphNode,
        next: Option<GraphNode>,
        state: &ConversationState,
        interrupt: Option<Interrupt>,
    ) -> Result<(), GraphError> {
        let checkpoint = Checkpoint::new(
            thread_id,
            sequence,
            node,
            next,
            state.clone(),
            interrupt,
            self.settings.ttl_days,
            Utc::now(),
        );
        self.checkpoints.save(&checkpoint).await?;
        Ok(())
    }

    async fn execute(
        &self,
        node: GraphNode,
        state: &mut ConversationState,
        resume: Option<Resume>,
        audit: &AuditContext,
    ) -> Result<(), GraphError> {
        match node {
            GraphNode::GetMemories => {
                debug!(event_name = "graph.memories", messages = state.messages.len());
                Ok(())
            }
            GraphNode::LlmCall => self.llm_call(state).await,
            GraphNode::ToolHandler => {
                self.tool_handler(state, audit).await;
                Ok(())
            }
            GraphNode::NeedInfo => {
                let resume = resume.ok_or(GraphError::MissingResume { node })?;
                state.push(ChatMessage::human(resume_text(resume)));
                Ok(())
            }
            GraphNode::Approval => {
                let resume = resume.ok_or(GraphError::MissingResume { node })?;
                self.apply_approval(state, resume, audit);
                Ok(())
            }
        }
    }

    async fn llm_call(&self, state: &mut ConversationState) -> Result<(), GraphError> {
        let schema = serde_json::to_string_pretty(&schema_properties::<ResponseModel>())
            .unwrap_or_else(|_| "{}".to_string());
        let mut messages = Vec::with_capacity(state.messages.len() + 2);
        messages.push(ChatMessage::system(
            self.prompts.architecture_system(&today(self.settings.utc_offset_minutes))?,
        ));
        messages.extend(state.messages.iter().cloned());
        messages.push(ChatMessage::system(
            self.prompts.architecture_contract(&self.tools.catalog_text(), &schema)?,
        ));

        let request = LlmRequest::new(messages)
            .with_tools(self.tools.specs())
            .with_prefill(JSON_PREFILL)
            .with_max_tokens(LLM_MAX_TOKENS)
            .with_temperature(0.0);
        let response = self.llm.complete(request).await?;
        state.push(parse_response(response, JSON_PREFILL));
        Ok(())
    }

    fn apply_approval(&self, state: &mut ConversationState, resume: Resume, audit: &AuditContext) {
        let Some(call) = state.pending_tool_call().cloned() else {
            state.push(ChatMessage::human(NO_TOOL_CALL_TO_APPROVE));
            state.approved = Some(false);
            return;
        };
        let decision = approval_decision(resume);

        let outcome = if decision.approved { AuditOutcome::Success } else { AuditOutcome::Rejected };
        self.audit.emit(
            AuditEvent::new(audit, "approval.decided", AuditCategory::Approval, outcome)
                .with_metadata("tool_name", call.name.clone())
                .with_metadata("edited", decision.edited_args.is_some().to_string()),
        );

        if !decision.approved {
            if let Some(ChatMessage::Ai { tool_calls, .. }) = state.last_ai_mut() {
                tool_calls.clear();
            }
            let reason = decision
                .reason
                .filter(|reason| !reason.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DENIAL_REASON.to_string());
            state.push(ChatMessage::human(format!(
                "Approval denied for {} with args {}. Reason: {reason}. Please propose an alternative or ask for clarification.",
                call.name, call.args
            )));
            state.approved = Some(false);
            return;
        }

        if let Some(edited) = decision.edited_args {
            if let Some(ChatMessage::Ai { content, tool_calls }) = state.last_ai_mut() {
                if let Some(last) = tool_calls.last_mut() {
                    last.args = edited;
                    *content = patch_content(content, last);
                }
            }
        }
        state.approved = Some(true);
    }

    async fn tool_handler(&self, state: &mut ConversationState, audit: &AuditContext) {
        let Some(call) = state.pending_tool_call().cloned() else {
            return;
        };
        let operation_type = state
            .last_ai()
            .and_then(|message| ResponseModel::from_content(message.content()))
            .and_then(|parsed| parsed.operation_type);

        let intent = ToolIntent { tool_name: &call.name, operation_type, approved: state.approved };
        let (output, outcome) = match self.guardrails.evaluate(&intent) {
            GuardrailDecision::Deny { reason_code, user_message } => {
                warn!(event_name = "graph.tool_denied", tool = %call.name, reason_code);
                (format!("Tool '{}' failed: {user_message}", call.name), AuditOutcome::Rejected)
            }
            GuardrailDecision::Allow => match self.tools.get(&call.name) {
                Some(tool) => match tool.execute(call.args.clone()).await {
                    Ok(value) => (render_output(&value), AuditOutcome::Success),
                    Err(error) => {
                        warn!(event_name = "graph.tool_failed", tool = %call.name, error = %error);
                        (format!("Tool '{}' failed: {error}", call.name), AuditOutcome::Failed)
                    }
                },
                None => (format!("Tool '{}' failed: unknown tool", call.name), AuditOutcome::Failed),
            },
        };

        self.audit.emit(
            AuditEvent::new(audit, "tool.executed", AuditCategory::Tool, outcome)
                .with_metadata("tool_name", call.name.clone())
                .with_metadata(
                    "operation_type",
                    operation_type.map(|operation| operation.as_str()).unwrap_or("unknown"),
                ),
        );
        state.push(ChatMessage::tool(output, call.id));
        state.approved = None;
    }
}

fn interrupt_for(node: GraphNode, state: &ConversationState) -> Result<Interrupt, GraphError> {
    match node {
        GraphNode::Approval => state
            .pending_tool_call()
            .map(|call| Interrupt::approval_request(call.name.clone(), call.args.clone()))
            .ok_or(GraphError::MissingToolCall),
        _ => Ok(Interrupt::NeedInfo { message: final_content(state) }),
    }
}

fn resume_text(resume: Resume) -> String {
    match resume {
        Resume::Text(text) => text,
        Resume::Structured(value) => value.to_string(),
        Resume::Approval(decision) => serde_json::to_string(&decision).unwrap_or_default(),
    }
}

fn approval_decision(resume: Resume) -> ApprovalDecision {
    match resume {
        Resume::Approval(decision) => decision,
        Resume::Structured(value) => serde_json::from_value(value)
            .unwrap_or_else(|_| ApprovalDecision::deny(DEFAULT_DENIAL_REASON)),
        Resume::Text(text) => {
            let normalized = text.trim().to_lowercase();
            if matches!(normalized.as_str(), "yes" | "y" | "approve" | "approved" | "ok") {
                ApprovalDecision::approve()
            } else {
                ApprovalDecision::deny(text)
            }
        }
    }
}

/// Turns a raw model reply into the AI message stored in the state.
///
/// Native tool calls win; otherwise a call described in the JSON is
/// synthesized. The JSON content is rewritten so `tool_to_call` and
/// `tool_args` match the selected call.
pub fn parse_response(response: LlmResponse, prefill: &str) -> ChatMessage {
    let mut content = response.content.trim().to_string();
    if !content.starts_with(prefill) {
        content = format!("{prefill}{content}");
    }
    if let Some(end) = content.rfind('}') {
        content.truncate(end + 1);
    }

    let parsed = ResponseModel::from_content(&content);
    let mut tool_calls = response.tool_calls;
    if tool_calls.is_empty() {
        if let Some(name) = parsed
            .as_ref()
            .and_then(|parsed| parsed.tool_to_call.clone())
            .filter(|name| !name.trim().is_empty())
        {
            let args = parsed.as_ref().and_then(|parsed| parsed.tool_args.clone()).unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall::new(synthetic_tool_use_id(Utc::now()), name, args));
        }
    }

    if let Some(selected) = tool_calls.last() {
        content = patch_content(&content, selected);
    }
    ChatMessage::ai(content, tool_calls)
}

fn patch_content(content: &str, call: &ToolCall) -> String {
    match serde_json::from_str::<Value>(content) {
        Ok(Value::Object(mut object)) => {
            object.insert("tool_to_call".to_string(), Value::String(call.name.clone()));
            object.insert("tool_args".to_string(), call.args.clone());
            Value::Object(object).to_string()
        }
        _ => content.to_string(),
    }
}

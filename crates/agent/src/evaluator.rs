//! Decides whether the assistant answers a thread message and which
//! sub-agent handles it.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use tars_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use tars_core::domain::requests::{AgentInvocation, EvaluationRequest};
use tars_core::domain::thread::render_story;
use tars_core::{ChatMessage, JudgeResponse, SubAgent, SubAgentChoice, ThreadMessage};
use tars_db::repositories::{CheckpointRepository, RepositoryError};
use tars_slack::{SlackApiError, ThreadHistoryFetcher};

use crate::conversation::was_bot_mentioned;
use crate::llm::{complete_structured, LlmClient, LlmError, LlmRequest};
use crate::prompts::{PromptError, PromptLibrary};
use crate::runtime::{AgentDispatcher, DispatchError};

pub const MEDIA_CHANNEL: &str = "slack";
pub const MENTIONED_AT_INDEX: &str = "The bot was mentioned in the main message of the thread.";

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Slack(#[from] SlackApiError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvaluationOutcome {
    NotLastMessage,
    MessageNotFound,
    NoAnswerNeeded { reasoning: String },
    Routed { agent: SubAgent, reasoning: String },
}

impl EvaluationOutcome {
    /// Body text returned to the caller.
    pub fn status_text(&self) -> String {
        match self {
            Self::NotLastMessage => "not the last message".to_string(),
            Self::MessageNotFound => "message not found in thread".to_string(),
            Self::NoAnswerNeeded { .. } => "no answer needed".to_string(),
            Self::Routed { agent, .. } => format!("routed to {agent}"),
        }
    }
}

pub struct Evaluator {
    agent_name: String,
    history: Arc<ThreadHistoryFetcher>,
    llm: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    checkpoints: Arc<dyn CheckpointRepository>,
    dispatcher: Arc<dyn AgentDispatcher>,
    audit: Arc<dyn AuditSink>,
}

impl Evaluator {
    pub fn new(
        agent_name: String,
        history: Arc<ThreadHistoryFetcher>,
        llm: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        checkpoints: Arc<dyn CheckpointRepository>,
        dispatcher: Arc<dyn AgentDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { agent_name, history, llm, prompts, checkpoints, dispatcher, audit }
    }

    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
        correlation_id: &str,
    ) -> Result<EvaluationOutcome, EvaluationError> {
        let thread_id = request.thread_ts.as_str();
        let channel = request.channel.as_str();
        let audit = AuditContext::new(
            Some(thread_id.to_string()),
            Some(channel.to_string()),
            correlation_id,
            "evaluator",
        );

        let snapshot = self.history.fetch(channel, thread_id).await?;
        let Some(idx) = snapshot.locate(&request.ts, &request.text) else {
            info!(event_name = "evaluation.skipped", thread_id, channel, correlation_id, reason = "message_not_found");
            return Ok(EvaluationOutcome::MessageNotFound);
        };
        if !snapshot.is_last(idx) {
            info!(event_name = "evaluation.skipped", thread_id, channel, correlation_id, reason = "not_last_message");
            return Ok(EvaluationOutcome::NotLastMessage);
        }
        let story = snapshot.story();
        let message = story[idx].message.clone();

        let pending = self
            .checkpoints
            .latest(thread_id, Utc::now())
            .await?
            .filter(|checkpoint| checkpoint.interrupt.is_some());
        let (agent, reasoning) = if let Some(checkpoint) = pending {
            let kind = checkpoint.interrupt.as_ref().map(|interrupt| interrupt.kind()).unwrap_or_default();
            (SubAgent::Architecture, format!("The infrastructure agent is waiting for a reply ({kind})."))
        } else {
            let (anywhere, at_idx) = was_bot_mentioned(&story, &request.bot_tag, idx);
            let reasoning = if at_idx {
                MENTIONED_AT_INDEX.to_string()
            } else {
                let verdict = self.judge(&story, &message, anywhere).await?;
                if !verdict.should_answer {
                    info!(
                        event_name = "evaluation.no_answer",
                        thread_id,
                        channel,
                        correlation_id,
                        reasoning = %verdict.reasoning,
                    );
                    self.emit(&audit, "evaluation.declined", AuditOutcome::Rejected, None);
                    return Ok(EvaluationOutcome::NoAnswerNeeded { reasoning: verdict.reasoning });
                }
                verdict.reasoning
            };
            let choice = self.route(&story, &message, &reasoning).await?;
            (choice.sub_agent_name, choice.sub_agent_reasoning)
        };

        let channel_name = match self.history.channel_name(channel).await {
            Ok(name) => name,
            Err(error) => {
                warn!(event_name = "evaluation.channel_name_failed", channel, error = %error);
                channel.to_string()
            }
        };
        let invocation = AgentInvocation {
            channel: channel_name,
            channel_id: Some(channel.to_string()),
            thread_history: story,
            thread_ts: thread_id.to_string(),
            ts: request.ts.clone(),
            message_idx: idx,
            message,
            media_channel: MEDIA_CHANNEL.to_string(),
        };
        self.dispatcher.invoke_agent(agent, invocation, correlation_id).await?;

        info!(event_name = "evaluation.routed", thread_id, channel, correlation_id, agent = agent.as_str());
        self.emit(&audit, "evaluation.routed", AuditOutcome::Success, Some(agent));
        Ok(EvaluationOutcome::Routed { agent, reasoning })
    }

    async fn judge(
        &self,
        story: &[ThreadMessage],
        message: &str,
        mentioned_anywhere: bool,
    ) -> Result<JudgeResponse, EvaluationError> {
        let specification = mention_specification(&self.agent_name, mentioned_anywhere);
        let request = LlmRequest::new(vec![
            ChatMessage::system(self.prompts.judge_system(&self.agent_name)?),
            ChatMessage::human(self.prompts.judge_user(
                &self.agent_name,
                &specification,
                message,
                &render_story(story),
            )?),
        ])
        .with_temperature(0.0);
        Ok(complete_structured::<JudgeResponse>(self.llm.as_ref(), request).await?)
    }

    async fn route(
        &self,
        story: &[ThreadMessage],
        message: &str,
        reasoning: &str,
    ) -> Result<SubAgentChoice, EvaluationError> {
        let request = LlmRequest::new(vec![
            ChatMessage::system(self.prompts.judge_system(&self.agent_name)?),
            ChatMessage::human(self.prompts.router_user(
                &self.agent_name,
                reasoning,
                &render_story(story),
                message,
            )?),
        ])
        .with_temperature(0.0);
        Ok(complete_structured::<SubAgentChoice>(self.llm.as_ref(), request).await?)
    }

    fn emit(&self, audit: &AuditContext, event_type: &str, outcome: AuditOutcome, agent: Option<SubAgent>) {
        let mut event = AuditEvent::new(audit, event_type, AuditCategory::Evaluation, outcome);
        if let Some(agent) = agent {
            event = event.with_metadata("agent", agent.as_str());
        }
        self.audit.emit(event);
    }
}

/// Sentence telling the judge whether the bot appears anywhere in the thread.
pub fn mention_specification(agent_name: &str, mentioned: bool) -> String {
    let presence = if mentioned { "was mentioned in some message" } else { "was NOT mentioned in any message" };
    format!(
        "As you will see, the bot {presence} of the thread, so you need to evaluate the thread to decide if {agent_name} should answer the last message or not."
    )
}

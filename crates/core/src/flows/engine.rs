use thiserror::Error;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::models::ResponseModel;
use crate::flows::states::{FlowContext, FlowEvent, FlowType, GraphNode, TransitionOutcome};

pub trait FlowDefinition {
    fn flow_type(&self) -> FlowType;
    fn entry(&self) -> GraphNode;
    fn transition(
        &self,
        current: &GraphNode,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>;
}

/// The five-node infrastructure graph with approval and need-info interrupts.
#[derive(Clone, Debug, Default)]
pub struct HitlApprovalFlow;

impl FlowDefinition for HitlApprovalFlow {
    fn flow_type(&self) -> FlowType {
        FlowType::HitlApproval
    }

    fn entry(&self) -> GraphNode {
        GraphNode::GetMemories
    }

    fn transition(
        &self,
        current: &GraphNode,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        transition_hitl(current, event, context)
    }
}

pub struct FlowEngine<F> {
    flow: F,
}

impl<F> FlowEngine<F>
where
    F: FlowDefinition,
{
    pub fn new(flow: F) -> Self {
        Self { flow }
    }

    pub fn flow_type(&self) -> FlowType {
        self.flow.flow_type()
    }

    pub fn entry(&self) -> GraphNode {
        self.flow.entry()
    }

    pub fn apply(
        &self,
        current: &GraphNode,
        event: &FlowEvent,
        context: &FlowContext,
    ) -> Result<TransitionOutcome, FlowTransitionError> {
        self.flow.transition(current, event, context)
    }

    pub fn apply_with_audit<S>(
        &self,
        current: &GraphNode,
        event: &FlowEvent,
        context: &FlowContext,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, FlowTransitionError>
    where
        S: AuditSink + ?Sized,
    {
        let result = self.apply(current, event, context);
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "flow.transition_applied",
                        AuditCategory::Flow,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.map(|node| node.as_str()).unwrap_or("end"))
                    .with_metadata("event", format!("{:?}", outcome.event)),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit,
                        "flow.transition_rejected",
                        AuditCategory::Flow,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}

impl Default for FlowEngine<HitlApprovalFlow> {
    fn default() -> Self {
        Self::new(HitlApprovalFlow)
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowTransitionError {
    #[error("invalid transition from {state:?} using event {event:?}")]
    InvalidTransition { state: GraphNode, event: FlowEvent },
    #[error("approval node completed without a recorded decision")]
    ApprovalUnresolved,
}

/// Whether a proposed call must pass the approval interrupt.
///
/// The model's own flag can add the gate but never remove it: any mutating or
/// unclassified call is gated.
pub fn requires_approval(response: Option<&ResponseModel>, has_tool_calls: bool) -> bool {
    if !has_tool_calls {
        return false;
    }
    match response {
        Some(parsed) => {
            parsed.hitl_tool_approval
                || parsed.operation_type.map(|operation| operation.is_mutating()).unwrap_or(true)
        }
        None => true,
    }
}

fn transition_hitl(
    current: &GraphNode,
    event: &FlowEvent,
    context: &FlowContext,
) -> Result<TransitionOutcome, FlowTransitionError> {
    use FlowEvent::{ApprovalResolved, InfoReceived, MemoriesLoaded, ModelResponded, ToolExecuted};
    use GraphNode::{Approval, GetMemories, LlmCall, NeedInfo, ToolHandler};

    let to = match (current, event) {
        (GetMemories, MemoriesLoaded) | (NeedInfo, InfoReceived) | (ToolHandler, ToolExecuted) => {
            Some(LlmCall)
        }
        (LlmCall, ModelResponded) => {
            if context.last_message_is_human {
                Some(LlmCall)
            } else if context.need_info {
                Some(NeedInfo)
            } else if context.has_tool_calls && context.approval_required {
                Some(Approval)
            } else if context.has_tool_calls {
                Some(ToolHandler)
            } else {
                None
            }
        }
        (Approval, ApprovalResolved) => match context.approved {
            Some(true) => Some(ToolHandler),
            Some(false) => Some(LlmCall),
            None => return Err(FlowTransitionError::ApprovalUnresolved),
        },
        _ => {
            return Err(FlowTransitionError::InvalidTransition {
                state: *current,
                event: event.clone(),
            });
        }
    };

    Ok(TransitionOutcome { from: *current, to, event: event.clone() })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::audit::{AuditContext, InMemoryAuditSink};
    use crate::domain::message::{ChatMessage, ConversationState, ToolCall};
    use crate::domain::models::{OperationType, ResponseModel};
    use crate::flows::engine::{
        requires_approval, FlowDefinition, FlowEngine, FlowTransitionError, HitlApprovalFlow,
    };
    use crate::flows::states::{FlowContext, FlowEvent, FlowType, GraphNode};

    fn ai_state(response: serde_json::Value, with_call: bool) -> ConversationState {
        let calls = if with_call {
            vec![ToolCall::new("tooluse_1", "call_aws", json!({"cli_command": "aws s3 ls"}))]
        } else {
            Vec::new()
        };
        let mut state = ConversationState::with_human("help");
        state.push(ChatMessage::ai(response.to_string(), calls));
        state
    }

    fn route_after_llm(state: &ConversationState) -> Option<GraphNode> {
        FlowEngine::default()
            .apply(&GraphNode::LlmCall, &FlowEvent::ModelResponded, &FlowContext::from_state(state))
            .expect("llm_call always routes")
            .to
    }

    #[test]
    fn fixed_edges_return_to_llm_call() {
        let engine = FlowEngine::default();
        let context = FlowContext::default();

        assert_eq!(engine.entry(), GraphNode::GetMemories);
        for (node, event) in [
            (GraphNode::GetMemories, FlowEvent::MemoriesLoaded),
            (GraphNode::NeedInfo, FlowEvent::InfoReceived),
            (GraphNode::ToolHandler, FlowEvent::ToolExecuted),
        ] {
            let outcome = engine.apply(&node, &event, &context).expect("fixed edge");
            assert_eq!(outcome.to, Some(GraphNode::LlmCall));
        }
    }

    #[test]
    fn llm_routing_covers_every_branch() {
        let mut human_tail = ConversationState::with_human("first");
        human_tail.push(ChatMessage::human("second"));
        assert_eq!(route_after_llm(&human_tail), Some(GraphNode::LlmCall));

        let need_info = ai_state(json!({"content": "Which region?", "need_info": true}), false);
        assert_eq!(route_after_llm(&need_info), Some(GraphNode::NeedInfo));

        let gated = ai_state(
            json!({"content": "Creating", "operation_type": "create", "hitl_tool_approval": true}),
            true,
        );
        assert_eq!(route_after_llm(&gated), Some(GraphNode::Approval));

        let read = ai_state(json!({"content": "Listing", "operation_type": "read"}), true);
        assert_eq!(route_after_llm(&read), Some(GraphNode::ToolHandler));

        let done = ai_state(json!({"content": "All set."}), false);
        assert_eq!(route_after_llm(&done), None);
    }

    #[test]
    fn mutating_call_is_gated_even_when_model_waives_approval() {
        let waived = ai_state(
            json!({"content": "Deleting", "operation_type": "delete", "hitl_tool_approval": false}),
            true,
        );
        assert_eq!(route_after_llm(&waived), Some(GraphNode::Approval));

        let unclassified = ai_state(json!({"content": "Running"}), true);
        assert_eq!(route_after_llm(&unclassified), Some(GraphNode::Approval));

        let unparseable = ai_state(json!("not an object"), true);
        assert_eq!(route_after_llm(&unparseable), Some(GraphNode::Approval));
    }

    #[test]
    fn requires_approval_ignores_calls_that_do_not_exist() {
        let response = ResponseModel {
            operation_type: Some(OperationType::Create),
            hitl_tool_approval: true,
            ..ResponseModel::default()
        };
        assert!(!requires_approval(Some(&response), false));
        assert!(requires_approval(Some(&response), true));
    }

    #[test]
    fn approval_routes_on_decision() {
        let engine = FlowEngine::new(HitlApprovalFlow);
        let approved = FlowContext { approved: Some(true), ..FlowContext::default() };
        let denied = FlowContext { approved: Some(false), ..FlowContext::default() };

        let to_tool = engine
            .apply(&GraphNode::Approval, &FlowEvent::ApprovalResolved, &approved)
            .expect("approved");
        assert_eq!(to_tool.to, Some(GraphNode::ToolHandler));

        let back_to_model = engine
            .apply(&GraphNode::Approval, &FlowEvent::ApprovalResolved, &denied)
            .expect("denied");
        assert_eq!(back_to_model.to, Some(GraphNode::LlmCall));

        let error = engine
            .apply(&GraphNode::Approval, &FlowEvent::ApprovalResolved, &FlowContext::default())
            .expect_err("undecided");
        assert_eq!(error, FlowTransitionError::ApprovalUnresolved);
    }

    #[test]
    fn mismatched_event_is_rejected() {
        let engine = FlowEngine::default();
        let error = engine
            .apply(&GraphNode::ToolHandler, &FlowEvent::ApprovalResolved, &FlowContext::default())
            .expect_err("tool handler never resolves approvals");

        assert!(matches!(
            error,
            FlowTransitionError::InvalidTransition {
                state: GraphNode::ToolHandler,
                event: FlowEvent::ApprovalResolved
            }
        ));
        assert_eq!(HitlApprovalFlow.flow_type(), FlowType::HitlApproval);
    }

    #[test]
    fn flow_transition_emits_audit_event() {
        let engine = FlowEngine::default();
        let sink = InMemoryAuditSink::default();

        let _ = engine
            .apply_with_audit(
                &GraphNode::GetMemories,
                &FlowEvent::MemoriesLoaded,
                &FlowContext::default(),
                &sink,
                &AuditContext::new(
                    Some("1730000000.0200".to_owned()),
                    Some("infra".to_owned()),
                    "req-42",
                    "graph",
                ),
            )
            .expect("transition should succeed");

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, "req-42");
        assert_eq!(events[0].thread_id.as_deref(), Some("1730000000.0200"));
        assert_eq!(events[0].event_type, "flow.transition_applied");
        assert_eq!(events[0].metadata.get("to").map(String::as_str), Some("llm_call"));
    }
}

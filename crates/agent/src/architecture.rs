//! Infrastructure agent: turns a thread reply into a graph start or resume.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use tars_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use tars_core::domain::models::schema_properties;
use tars_core::domain::requests::{ArchitectureRequest, SendRequest};
use tars_core::{ApprovalDecision, ChatMessage, ConversationState, Interrupt, Resume, SubAgent};
use tars_db::repositories::RepositoryError;

use crate::graph::{final_content, ConversationGraph, GraphError, GraphOutcome};
use crate::llm::{complete_structured, LlmClient, LlmError, LlmRequest};
use crate::prompts::{PromptError, PromptLibrary};
use crate::runtime::AgentDispatcher;

#[derive(Debug, Error)]
pub enum ArchitectureError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("failed to interpret approval reply: {0}")]
    ApprovalParse(#[from] LlmError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// What the handler did with the message.
#[derive(Clone, Debug, PartialEq)]
pub struct ArchitectureReply {
    /// Text dispatched to the thread.
    pub content: String,
    pub interrupt: Option<Interrupt>,
}

impl ArchitectureReply {
    pub fn is_finished(&self) -> bool {
        self.interrupt.is_none()
    }
}

pub struct ArchitectureAgent {
    graph: Arc<ConversationGraph>,
    parser: Arc<dyn LlmClient>,
    prompts: Arc<PromptLibrary>,
    dispatcher: Arc<dyn AgentDispatcher>,
    audit: Arc<dyn AuditSink>,
}

impl ArchitectureAgent {
    pub fn new(
        graph: Arc<ConversationGraph>,
        parser: Arc<dyn LlmClient>,
        prompts: Arc<PromptLibrary>,
        dispatcher: Arc<dyn AgentDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { graph, parser, prompts, dispatcher, audit }
    }

    pub async fn handle(
        &self,
        request: &ArchitectureRequest,
        correlation_id: &str,
    ) -> Result<ArchitectureReply, ArchitectureError> {
        let thread_id = request.thread_id();
        let audit = AuditContext::new(
            Some(thread_id.to_string()),
            Some(request.channel.clone()),
            correlation_id,
            SubAgent::Architecture.as_str(),
        );
        let checkpoints = self.graph.checkpoints();
        let latest = checkpoints.latest(thread_id, Utc::now()).await?;

        let outcome = match latest {
            Some(checkpoint) => match checkpoint.interrupt.clone() {
                Some(Interrupt::NeedInfo { .. }) => {
                    info!(event_name = "architecture.resume", thread_id, correlation_id, interrupt_type = "need_info");
                    self.graph.resume(&checkpoint, Resume::Text(request.message.clone()), &audit).await?
                }
                Some(Interrupt::ApprovalRequest { tool_name, tool_args, .. }) => {
                    info!(event_name = "architecture.resume", thread_id, correlation_id, interrupt_type = "approval_request");
                    let decision =
                        self.parse_approval(&request.message, &tool_name, &tool_args).await?;
                    self.graph.resume(&checkpoint, Resume::Approval(decision), &audit).await?
                }
                None if !checkpoint.is_finished() => {
                    let mut state = checkpoint.state.clone();
                    state.push(ChatMessage::human(request.message.clone()));
                    self.graph.start(thread_id, state, Some(&checkpoint), &audit).await?
                }
                None => {
                    self.graph
                        .start(thread_id, ConversationState::with_human(request.message.clone()), Some(&checkpoint), &audit)
                        .await?
                }
            },
            None => {
                // Expired rows the pruner has not reached yet still hold their sequence numbers.
                let stale = checkpoints.delete_thread(thread_id).await?;
                info!(event_name = "architecture.start", thread_id, correlation_id, stale_checkpoints = stale);
                self.graph
                    .start(thread_id, ConversationState::with_human(request.message.clone()), None, &audit)
                    .await?
            }
        };

        let reply = match outcome {
            GraphOutcome::Finished { state } => {
                let content = final_content(&state);
                let removed = checkpoints.delete_thread(thread_id).await?;
                info!(event_name = "architecture.finished", thread_id, correlation_id, checkpoints_removed = removed);
                ArchitectureReply { content, interrupt: None }
            }
            GraphOutcome::Interrupted { interrupt, .. } => {
                ArchitectureReply { content: interrupt.intervention_text(), interrupt: Some(interrupt) }
            }
        };

        self.dispatch(request, &reply.content, &audit).await;
        Ok(reply)
    }

    /// Reads a free-text approval reply into a decision with the fast model.
    async fn parse_approval(
        &self,
        reply: &str,
        tool_name: &str,
        tool_args: &serde_json::Value,
    ) -> Result<ApprovalDecision, ArchitectureError> {
        let schema = serde_json::to_string_pretty(&schema_properties::<ApprovalDecision>())
            .unwrap_or_else(|_| "{}".to_string());
        let proposal = json!({"tool_name": tool_name, "tool_args": tool_args}).to_string();
        let request = LlmRequest::new(vec![
            ChatMessage::system(self.prompts.approval_system(&schema)?),
            ChatMessage::human(self.prompts.approval_user(reply, &proposal)?),
        ])
        .fast()
        .with_temperature(0.0);
        Ok(complete_structured::<ApprovalDecision>(self.parser.as_ref(), request).await?)
    }

    async fn dispatch(&self, request: &ArchitectureRequest, text: &str, audit: &AuditContext) {
        let send = SendRequest::reply(
            SubAgent::Architecture,
            request.reply_channel(),
            &request.thread_ts,
            &request.message,
            text,
        );
        let outcome = match self.dispatcher.send_reply(send, &audit.correlation_id).await {
            Ok(()) => AuditOutcome::Success,
            Err(dispatch_error) => {
                error!(
                    event_name = "architecture.dispatch_failed",
                    thread_id = request.thread_id(),
                    correlation_id = %audit.correlation_id,
                    error = %dispatch_error,
                );
                AuditOutcome::Failed
            }
        };
        self.audit.emit(
            AuditEvent::new(audit, "dispatch.reply", AuditCategory::Dispatch, outcome)
                .with_metadata("source", SubAgent::Architecture.as_str()),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;

    use tars_core::audit::InMemoryAuditSink;
    use tars_core::domain::requests::ArchitectureRequest;
    use tars_core::flows::GraphNode;
    use tars_core::{Checkpoint, ConversationState};
    use tars_db::repositories::{
        CheckpointRepository, InMemoryCheckpointRepository, SqlCheckpointRepository,
    };

    use super::ArchitectureAgent;
    use crate::graph::{ConversationGraph, GraphSettings};
    use crate::llm::fakes::ScriptedLlm;
    use crate::prompts::PromptLibrary;
    use crate::runtime::fakes::RecordingDispatcher;
    use crate::tools::fakes::RecordingTool;
    use crate::tools::ToolRegistry;

    struct Harness {
        agent: ArchitectureAgent,
        parser: Arc<ScriptedLlm>,
        tool: Arc<RecordingTool>,
        checkpoints: Arc<dyn CheckpointRepository>,
        dispatcher: Arc<RecordingDispatcher>,
    }

    fn harness(graph_replies: &[&str], parser_replies: &[&str]) -> Harness {
        harness_with(Arc::new(InMemoryCheckpointRepository::default()), graph_replies, parser_replies)
    }

    async fn sql_checkpoints() -> Arc<dyn CheckpointRepository> {
        let pool = tars_db::connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
        tars_db::migrations::run_pending(&pool).await.expect("migrations");
        Arc::new(SqlCheckpointRepository::new(pool))
    }

    fn harness_with(
        checkpoints: Arc<dyn CheckpointRepository>,
        graph_replies: &[&str],
        parser_replies: &[&str],
    ) -> Harness {
        let prompts = Arc::new(PromptLibrary::new().expect("templates"));
        let audit = Arc::new(InMemoryAuditSink::default());
        let tool = Arc::new(RecordingTool::ok("call_aws", json!("created")));
        let mut tools = ToolRegistry::default();
        tools.register_arc(tool.clone());
        let graph = Arc::new(ConversationGraph::new(
            Arc::new(ScriptedLlm::text(graph_replies)),
            tools,
            prompts.clone(),
            checkpoints.clone(),
            audit.clone(),
            GraphSettings::default(),
        ));
        let parser = Arc::new(ScriptedLlm::text(parser_replies));
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let agent = ArchitectureAgent::new(graph, parser.clone(), prompts, dispatcher.clone(), audit);
        Harness { agent, parser, tool, checkpoints, dispatcher }
    }

    fn request(message: &str) -> ArchitectureRequest {
        ArchitectureRequest {
            message: message.to_string(),
            thread_ts: "1712322429.000200".to_string(),
            channel: "infra-team".to_string(),
            channel_id: Some("C024".to_string()),
        }
    }

    #[tokio::test]
    async fn approval_round_trip_posts_request_then_result() {
        let h = harness(
            &[
                r#""content": "Creating bucket", "tool_to_call": "call_aws", "tool_args": {"cli_command": "aws s3 mb s3://tars-demo"}, "operation_type": "create", "hitl_tool_approval": true}"#,
                r#""content": "Bucket tars-demo is ready."}"#,
            ],
            &[r#""approved": true, "reason": null, "edited_args": null}"#],
        );

        let first = h.agent.handle(&request("create bucket tars-demo"), "corr-1").await.expect("first");
        assert!(!first.is_finished());
        assert!(first.content.starts_with("Human intervention required (type: approval_request):\n"));

        let second = h.agent.handle(&request("yes, go ahead"), "corr-2").await.expect("second");
        assert_eq!(second.content, "Bucket tars-demo is ready.");
        assert_eq!(h.tool.calls().len(), 1);

        let parser_prompt = &h.parser.requests()[0];
        assert!(parser_prompt.messages[1].content().contains("yes, go ahead"));

        let sent = h.dispatcher.replies();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].args.channel, "C024");
        assert_eq!(sent[1].args.thread_ts.as_deref(), Some("1712322429.000200"));
        assert_eq!(h.dispatcher.correlation_ids(), vec!["corr-1".to_string(), "corr-2".to_string()]);
        assert!(h.checkpoints.history("1712322429.000200").await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn need_info_reply_resumes_with_text() {
        let h = harness(
            &[
                r#""content": "Which region?", "need_info": true}"#,
                r#""content": "Queue created in us-east-1."}"#,
            ],
            &[],
        );

        let first = h.agent.handle(&request("create a queue"), "corr-1").await.expect("first");
        assert_eq!(first.content, "Human intervention required (type: need_info):\nWhich region?");

        let second = h.agent.handle(&request("us-east-1"), "corr-2").await.expect("second");
        assert_eq!(second.content, "Queue created in us-east-1.");
        assert!(h.parser.requests().is_empty());
    }

    #[tokio::test]
    async fn unparseable_approval_keeps_the_thread_paused() {
        let h = harness(
            &[r#""content": "Deleting", "tool_to_call": "call_aws", "tool_args": {"cli_command": "aws s3 rb s3://old"}, "operation_type": "delete"}"#],
            &["I am not sure"],
        );
        h.agent.handle(&request("delete bucket old"), "corr-1").await.expect("first");

        let result = h.agent.handle(&request("hmm"), "corr-2").await;
        assert!(result.is_err());
        let latest = h
            .checkpoints
            .latest("1712322429.000200", chrono::Utc::now())
            .await
            .expect("latest")
            .expect("still paused");
        assert!(latest.interrupt.is_some());
        assert!(h.tool.calls().is_empty());
    }

    #[tokio::test]
    async fn expired_thread_restarts_fresh_on_the_sql_store() {
        let checkpoints = sql_checkpoints().await;
        let created = Utc::now() - Duration::days(31);
        let stale = Checkpoint::new(
            "1712322429.000200",
            0,
            GraphNode::GetMemories,
            Some(GraphNode::LlmCall),
            ConversationState::with_human("an old request"),
            None,
            30,
            created,
        );
        checkpoints.save(&stale).await.expect("save stale");

        let h = harness_with(checkpoints, &[r#""content": "Listing buckets now."}"#], &[]);
        let reply = h.agent.handle(&request("list my buckets"), "corr-1").await.expect("restart");

        assert_eq!(reply.content, "Listing buckets now.");
        assert!(h.checkpoints.history("1712322429.000200").await.expect("history").is_empty());
    }

    #[tokio::test]
    async fn need_info_resumes_on_the_sql_store() {
        let checkpoints = sql_checkpoints().await;
        let h = harness_with(
            checkpoints,
            &[
                r#""content": "Which region?", "need_info": true}"#,
                r#""content": "Queue created in eu-west-1."}"#,
            ],
            &[],
        );

        let first = h.agent.handle(&request("create a queue"), "corr-1").await.expect("first");
        assert!(!first.is_finished());
        let paused = h
            .checkpoints
            .latest("1712322429.000200", Utc::now())
            .await
            .expect("latest")
            .expect("paused checkpoint");
        assert_eq!(paused.next, Some(GraphNode::NeedInfo));

        let second = h.agent.handle(&request("eu-west-1"), "corr-2").await.expect("second");
        assert_eq!(second.content, "Queue created in eu-west-1.");
        assert!(h.checkpoints.history("1712322429.000200").await.expect("history").is_empty());
    }
}

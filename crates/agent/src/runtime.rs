use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use tars_core::audit::AuditSink;
use tars_core::config::AgentsConfig;
use tars_core::config::CheckpointConfig;
use tars_core::domain::requests::{AgentInvocation, SendRequest};
use tars_core::SubAgent;
use tars_db::repositories::{
    CheckpointRepository, ConversationLogRepository, SessionHistoryRepository,
};
use tars_slack::ThreadHistoryFetcher;

use crate::architecture::ArchitectureAgent;
use crate::evaluator::Evaluator;
use crate::graph::{ConversationGraph, GraphSettings};
use crate::llm::LlmClient;
use crate::prompts::{PromptError, PromptLibrary};
use crate::qa::{EmployeeDirectory, QaAgent, QaSettings};
use crate::tools::ToolRegistry;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatch target `{0}` is not configured")]
    NotConfigured(&'static str),
    #[error("dispatch transport failed: {0}")]
    Transport(String),
    #[error("dispatch target answered HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("dispatch worker is not running")]
    Closed,
}

/// Hand-off between the evaluator, the agents and the sender.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn invoke_agent(
        &self,
        agent: SubAgent,
        invocation: AgentInvocation,
        correlation_id: &str,
    ) -> Result<(), DispatchError>;

    async fn send_reply(&self, request: SendRequest, correlation_id: &str) -> Result<(), DispatchError>;
}

/// Everything the agents share, wired once at startup.
pub struct RuntimeDeps {
    pub llm: Arc<dyn LlmClient>,
    pub history: Arc<ThreadHistoryFetcher>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub conversation_logs: Arc<dyn ConversationLogRepository>,
    pub sessions: Arc<dyn SessionHistoryRepository>,
    pub audit: Arc<dyn AuditSink>,
    pub dispatcher: Arc<dyn AgentDispatcher>,
    /// Tools offered to the infrastructure agent, already narrowed to the allowlist.
    pub architecture_tools: ToolRegistry,
    pub qa_tools: ToolRegistry,
}

pub struct AgentRuntime {
    pub evaluator: Evaluator,
    pub architecture: ArchitectureAgent,
    pub qa: QaAgent,
}

impl AgentRuntime {
    pub fn build(
        agents: &AgentsConfig,
        checkpoint: &CheckpointConfig,
        deps: RuntimeDeps,
    ) -> Result<Self, PromptError> {
        let prompts = Arc::new(PromptLibrary::new()?);
        let graph = Arc::new(ConversationGraph::new(
            deps.llm.clone(),
            deps.architecture_tools,
            prompts.clone(),
            deps.checkpoints.clone(),
            deps.audit.clone(),
            GraphSettings {
                max_steps: checkpoint.max_steps,
                ttl_days: checkpoint.ttl_days,
                utc_offset_minutes: agents.utc_offset_minutes,
            },
        ));

        let evaluator = Evaluator::new(
            agents.name.clone(),
            deps.history,
            deps.llm.clone(),
            prompts.clone(),
            deps.checkpoints,
            deps.dispatcher.clone(),
            deps.audit.clone(),
        );
        let architecture = ArchitectureAgent::new(
            graph,
            deps.llm.clone(),
            prompts.clone(),
            deps.dispatcher.clone(),
            deps.audit,
        );
        let directory = match &agents.employees_path {
            Some(path) => EmployeeDirectory::load_or_empty(path),
            None => EmployeeDirectory::default(),
        };
        let qa = QaAgent::new(
            deps.llm,
            prompts,
            deps.qa_tools,
            directory,
            deps.sessions,
            deps.conversation_logs,
            deps.dispatcher,
            QaSettings {
                recursion_limit: agents.qa_recursion_limit,
                utc_offset_minutes: agents.utc_offset_minutes,
            },
        );

        Ok(Self { evaluator, architecture, qa })
    }
}

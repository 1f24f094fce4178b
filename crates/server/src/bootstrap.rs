use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use secrecy::ExposeSecret;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tars_agent::prompts::PromptError;
use tars_agent::qa::QA_TOOL_ALLOWLIST;
use tars_agent::web_search::WebSearchTool;
use tars_agent::{build_llm_client, AgentRuntime, DispatchError, LlmError, RuntimeDeps};
use tars_core::config::{AppConfig, ConfigError, LoadOptions};
use tars_db::repositories::{
    CheckpointRepository, SqlCheckpointRepository, SqlConversationLogRepository,
    SqlEvaluationQueueRepository, SqlSessionHistoryRepository,
};
use tars_db::{connect_from_config, migrations, DbPool};
use tars_mcp::{resolve_aws_api_server, McpToolset, ServerCommand};
use tars_slack::events::{EventDispatcher, MessageEventHandler};
use tars_slack::{SignatureVerifier, SlackApi, SlackApiError, SlackWebClient, ThreadHistoryFetcher};

use crate::audit::TracingAuditSink;
use crate::dispatch::{spawn_worker, Dispatcher};
use crate::health::HealthState;
use crate::routes::{router, AppState};
use crate::services::AppServices;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub router: Router,
    pub services: Arc<AppServices>,
    pub checkpoints: Arc<dyn CheckpointRepository>,
    pub dispatch_worker: Option<JoinHandle<()>>,
    pub toolsets: Vec<McpToolset>,
}

impl Application {
    pub async fn shutdown(self) {
        if let Some(worker) = self.dispatch_worker {
            worker.abort();
        }
        for toolset in &self.toolsets {
            toolset.shutdown().await;
        }
        self.db_pool.close().await;
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("slack setup failed: {0}")]
    Slack(#[from] SlackApiError),
    #[error("llm setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("dispatcher setup failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("prompt templates failed to load: {0}")]
    Prompt(#[from] PromptError),
    #[error("tool setup failed: {0}")]
    Tools(#[source] anyhow::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", correlation_id = "bootstrap", "starting application bootstrap");
    config.validate()?;

    let db_pool = connect_from_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database ready"
    );

    let checkpoints: Arc<dyn CheckpointRepository> =
        Arc::new(SqlCheckpointRepository::new(db_pool.clone()));
    let queue = Arc::new(SqlEvaluationQueueRepository::new(db_pool.clone()));
    let audit = Arc::new(TracingAuditSink);

    let slack: Arc<dyn SlackApi> = Arc::new(SlackWebClient::new(
        config.slack.api_base_url.clone(),
        config.slack.bot_token.expose_secret(),
    )?);
    let bot_user_id = match &config.slack.bot_user_id {
        Some(id) => id.clone(),
        None => slack.auth_test().await?.user_id,
    };
    info!(
        event_name = "system.bootstrap.slack_identity",
        correlation_id = "bootstrap",
        bot_user_id = %bot_user_id,
        "slack bot identity resolved"
    );

    let llm = build_llm_client(&config.llm)?;

    let aws_api = resolve_aws_api_server(&config.mcp);
    info!(
        event_name = "system.bootstrap.aws_api_server",
        correlation_id = "bootstrap",
        source = aws_api.source.as_str(),
        command = %aws_api.command,
        "aws api mcp server resolved"
    );
    let architecture_toolset =
        McpToolset::connect(&[aws_api.command], Some(&config.agents.architecture_tools)).await;

    let qa_servers: Vec<ServerCommand> =
        config.mcp.qa_servers.iter().map(ServerCommand::from_config).collect();
    let qa_allowlist: Vec<String> = QA_TOOL_ALLOWLIST.iter().map(|name| name.to_string()).collect();
    let qa_toolset = McpToolset::connect(&qa_servers, Some(&qa_allowlist)).await;
    let mut qa_tools = qa_toolset.registry.clone();
    match WebSearchTool::from_config(&config.web_search).map_err(BootstrapError::Tools)? {
        Some(search) => qa_tools.register(search),
        None => warn!(
            event_name = "system.bootstrap.web_search_disabled",
            correlation_id = "bootstrap",
            "web search api key missing, research agent runs without web search"
        ),
    }
    info!(
        event_name = "system.bootstrap.tools_ready",
        correlation_id = "bootstrap",
        architecture_tools = architecture_toolset.registry.len(),
        qa_tools = qa_tools.len(),
        "agent tools registered"
    );

    let (dispatcher, jobs) = Dispatcher::from_config(
        &config.dispatch,
        Duration::from_secs(config.llm.timeout_secs.saturating_mul(4)),
    )?;
    let dispatcher = Arc::new(dispatcher);
    let dispatch_mode = dispatcher.mode();

    let runtime = AgentRuntime::build(
        &config.agents,
        &config.checkpoint,
        RuntimeDeps {
            llm,
            history: Arc::new(ThreadHistoryFetcher::new(slack.clone())),
            checkpoints: checkpoints.clone(),
            conversation_logs: Arc::new(SqlConversationLogRepository::new(db_pool.clone())),
            sessions: Arc::new(SqlSessionHistoryRepository::new(db_pool.clone())),
            audit: audit.clone(),
            dispatcher: dispatcher.clone(),
            architecture_tools: architecture_toolset.registry.clone(),
            qa_tools,
        },
    )?;

    let services = Arc::new(AppServices::new(
        runtime,
        slack,
        queue,
        dispatcher,
        audit,
        config.queue.evaluation_delay_secs,
    ));
    let dispatch_worker = jobs.map(|jobs| spawn_worker(jobs, Arc::downgrade(&services)));

    let mut events = EventDispatcher::new();
    events.register(MessageEventHandler::new(bot_user_id, services.clone()));
    let router = router(
        AppState {
            services: services.clone(),
            events: Arc::new(events),
            verifier: Arc::new(SignatureVerifier::new(config.slack.signing_secret.expose_secret())),
        },
        HealthState::new(db_pool.clone(), dispatch_mode),
    );

    info!(
        event_name = "system.bootstrap.complete",
        correlation_id = "bootstrap",
        dispatch_mode,
        "application bootstrap complete"
    );

    Ok(Application {
        config,
        db_pool,
        router,
        services,
        checkpoints,
        dispatch_worker,
        toolsets: vec![architecture_toolset, qa_toolset],
    })
}

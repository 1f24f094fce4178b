use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;

use tars_agent::llm::{LlmRequest, LlmResponse};
use tars_agent::{AgentRuntime, LlmClient, LlmError, RuntimeDeps, ToolRegistry};
use tars_core::audit::InMemoryAuditSink;
use tars_core::config::AppConfig;
use tars_core::domain::requests::PostMessageArgs;
use tars_db::repositories::{
    InMemoryCheckpointRepository, InMemoryConversationLogRepository,
    InMemoryEvaluationQueueRepository, InMemorySessionHistoryRepository,
};
use tars_slack::api::{AuthIdentity, ChannelInfo, PostedMessage, SlackMessage, SlackUser};
use tars_slack::events::{EventDispatcher, MessageEventHandler};
use tars_slack::{SignatureVerifier, SlackApi, SlackApiError, ThreadHistoryFetcher};

use crate::dispatch::{DispatchJob, Dispatcher};
use crate::health::HealthState;
use crate::routes::{router, AppState};
use crate::services::AppServices;

pub const SIGNING_SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
pub const BOT_USER_ID: &str = "U0TARS";

pub struct FakeSlack {
    replies: Vec<SlackMessage>,
    posted: Mutex<Vec<PostMessageArgs>>,
    fail_replies: bool,
}

impl FakeSlack {
    pub fn posted(&self) -> Vec<PostMessageArgs> {
        self.posted.lock().expect("posted lock").clone()
    }
}

#[async_trait]
impl SlackApi for FakeSlack {
    async fn auth_test(&self) -> Result<AuthIdentity, SlackApiError> {
        Ok(AuthIdentity { user_id: BOT_USER_ID.to_string(), bot_id: None, team: None })
    }

    async fn conversation_replies(
        &self,
        _channel: &str,
        _thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, SlackApiError> {
        if self.fail_replies {
            return Err(SlackApiError::Api {
                method: "conversations.replies",
                error: "ratelimited".to_string(),
            });
        }
        Ok(self.replies.clone())
    }

    async fn conversation_info(&self, channel: &str) -> Result<ChannelInfo, SlackApiError> {
        Ok(ChannelInfo {
            id: channel.to_string(),
            name: Some("infra".to_string()),
            name_normalized: Some("infra".to_string()),
        })
    }

    async fn user_info(&self, _user_id: &str) -> Result<SlackUser, SlackApiError> {
        Err(SlackApiError::Api { method: "users.info", error: "user_not_found".to_string() })
    }

    async fn post_message(&self, args: &PostMessageArgs) -> Result<PostedMessage, SlackApiError> {
        self.posted.lock().expect("posted lock").push(args.clone());
        Ok(PostedMessage { channel: args.channel.clone(), ts: "1712345999.000100".to_string() })
    }
}

/// Answers every completion with the same text.
pub struct StaticLlm(pub String);

#[async_trait]
impl LlmClient for StaticLlm {
    async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        Ok(LlmResponse { content: self.0.clone(), tool_calls: Vec::new() })
    }
}

pub struct Harness {
    pub router: Router,
    pub services: Arc<AppServices>,
    pub queue: Arc<InMemoryEvaluationQueueRepository>,
    pub slack: Arc<FakeSlack>,
    pub jobs: mpsc::UnboundedReceiver<DispatchJob>,
}

pub async fn harness(replies: Vec<Value>, llm_reply: &str) -> Harness {
    build(replies, llm_reply, false).await
}

pub async fn failing_slack_harness() -> Harness {
    build(Vec::new(), "{}", true).await
}

async fn build(replies: Vec<Value>, llm_reply: &str, fail_replies: bool) -> Harness {
    let config = AppConfig::default();
    let replies = replies
        .into_iter()
        .map(|reply| serde_json::from_value(reply).expect("slack message fixture"))
        .collect();
    let slack = Arc::new(FakeSlack { replies, posted: Mutex::new(Vec::new()), fail_replies });
    let queue = Arc::new(InMemoryEvaluationQueueRepository::default());
    let (dispatcher, jobs) = Dispatcher::in_process();
    let dispatcher = Arc::new(dispatcher);
    let audit = Arc::new(InMemoryAuditSink::default());

    let runtime = AgentRuntime::build(
        &config.agents,
        &config.checkpoint,
        RuntimeDeps {
            llm: Arc::new(StaticLlm(llm_reply.to_string())),
            history: Arc::new(ThreadHistoryFetcher::new(slack.clone())),
            checkpoints: Arc::new(InMemoryCheckpointRepository::default()),
            conversation_logs: Arc::new(InMemoryConversationLogRepository::default()),
            sessions: Arc::new(InMemorySessionHistoryRepository::default()),
            audit: audit.clone(),
            dispatcher: dispatcher.clone(),
            architecture_tools: ToolRegistry::default(),
            qa_tools: ToolRegistry::default(),
        },
    )
    .expect("runtime");

    let services = Arc::new(AppServices::new(
        runtime,
        slack.clone(),
        queue.clone(),
        dispatcher,
        audit,
        config.queue.evaluation_delay_secs,
    ));
    let mut events = EventDispatcher::new();
    events.register(MessageEventHandler::new(BOT_USER_ID, services.clone()));

    let pool = tars_db::connect_with_settings("sqlite::memory:", 1, 5).await.expect("pool");
    let router = router(
        AppState {
            services: services.clone(),
            events: Arc::new(events),
            verifier: Arc::new(SignatureVerifier::new(SIGNING_SECRET)),
        },
        HealthState::new(pool, "in_process"),
    );

    Harness { router, services, queue, slack, jobs }
}

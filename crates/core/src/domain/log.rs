use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::agent::SubAgent;

/// One answered message, keyed by `(channel_name, thread_ts, message_ts)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationLogEntry {
    pub channel_name: String,
    pub thread_ts: String,
    pub message_ts: String,
    pub agent: SubAgent,
    pub thread_local_time: String,
    pub message_local_time: String,
    pub chain: Value,
    pub tool_calls: Value,
    pub agent_response: Option<Value>,
    pub slack_response: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

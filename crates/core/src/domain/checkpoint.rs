use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::message::ConversationState;
use crate::domain::models::ApprovalDecision;
use crate::flows::GraphNode;

pub const APPROVAL_RISK_NOTE: &str = "This will create/update/delete cloud resources.";

/// Why a graph run paused for a human.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interrupt {
    ApprovalRequest { message: String, tool_name: String, tool_args: Value, risk_note: String },
    NeedInfo { message: String },
}

impl Interrupt {
    pub fn approval_request(tool_name: impl Into<String>, tool_args: Value) -> Self {
        let tool_name = tool_name.into();
        Self::ApprovalRequest {
            message: format!("Do you authorize execution of {tool_name}?"),
            tool_name,
            tool_args,
            risk_note: APPROVAL_RISK_NOTE.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApprovalRequest { .. } => "approval_request",
            Self::NeedInfo { .. } => "need_info",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::ApprovalRequest { message, .. } | Self::NeedInfo { message } => message,
        }
    }

    /// Text posted to the thread while the graph waits.
    pub fn intervention_text(&self) -> String {
        format!("Human intervention required (type: {}):\n{}", self.kind(), self.message())
    }
}

/// Value a paused graph is resumed with.
#[derive(Clone, Debug, PartialEq)]
pub enum Resume {
    Text(String),
    Structured(Value),
    Approval(ApprovalDecision),
}

/// Snapshot written after every node execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub checkpoint_id: String,
    pub sequence: i64,
    pub node: GraphNode,
    pub next: Option<GraphNode>,
    pub state: ConversationState,
    pub interrupt: Option<Interrupt>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Checkpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        thread_id: impl Into<String>,
        sequence: i64,
        node: GraphNode,
        next: Option<GraphNode>,
        state: ConversationState,
        interrupt: Option<Interrupt>,
        ttl_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: Uuid::new_v4().to_string(),
            sequence,
            node,
            next,
            state,
            interrupt,
            created_at: now,
            expires_at: now + Duration::days(i64::from(ttl_days)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.next.is_none() && self.interrupt.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

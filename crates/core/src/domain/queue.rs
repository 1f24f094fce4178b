use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::requests::EvaluationRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InFlight,
    DeadLetter,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "dead_letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown queue status `{other}`")),
        }
    }
}

/// A deferred evaluation waiting for its delivery time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvaluation {
    pub message_id: String,
    pub channel: String,
    pub request: EvaluationRequest,
    pub status: QueueStatus,
    pub attempts: u32,
    pub deliver_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingEvaluation {
    pub fn new(request: EvaluationRequest, deliver_after: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            message_id: request.message_id(),
            channel: request.channel.clone(),
            request,
            status: QueueStatus::Pending,
            attempts: 0,
            deliver_after,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

use async_trait::async_trait;
use thiserror::Error;

use tars_core::chrono::{DateTime, Utc};
use tars_core::domain::checkpoint::Checkpoint;
use tars_core::domain::log::{ConversationLogEntry, SessionMessage};
use tars_core::domain::queue::{PendingEvaluation, QueueStatus};

pub mod checkpoint;
pub mod conversation_log;
pub mod evaluation_queue;
pub mod memory;

pub use checkpoint::SqlCheckpointRepository;
pub use conversation_log::{SqlConversationLogRepository, SqlSessionHistoryRepository};
pub use evaluation_queue::SqlEvaluationQueueRepository;
pub use memory::{
    InMemoryCheckpointRepository, InMemoryConversationLogRepository,
    InMemoryEvaluationQueueRepository, InMemorySessionHistoryRepository,
};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

/// Per-thread summary used by operator tooling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub checkpoints: u32,
    pub latest_sequence: i64,
    pub next_node: Option<String>,
    pub interrupt_type: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError>;

    /// Newest unexpired checkpoint for the thread.
    async fn latest(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>, RepositoryError>;

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, RepositoryError>;

    async fn delete_thread(&self, thread_id: &str) -> Result<u64, RepositoryError>;

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    async fn list_threads(&self, now: DateTime<Utc>) -> Result<Vec<ThreadSummary>, RepositoryError>;
}

#[async_trait]
pub trait EvaluationQueueRepository: Send + Sync {
    /// Inserts or replaces the entry with the same message id.
    async fn enqueue(&self, entry: &PendingEvaluation) -> Result<(), RepositoryError>;

    /// Removes a pending entry. Returns whether one existed.
    async fn cancel(&self, message_id: &str) -> Result<bool, RepositoryError>;

    /// Marks due entries in flight, at most one per channel and never for a
    /// channel that already has an entry in flight.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PendingEvaluation>, RepositoryError>;

    async fn complete(&self, message_id: &str) -> Result<(), RepositoryError>;

    /// Reschedules at `retry_at`, or dead-letters the entry when `retry_at` is `None`.
    async fn fail(
        &self,
        message_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn list(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<PendingEvaluation>, RepositoryError>;

    /// Moves a dead-lettered entry back to pending with a fresh attempt budget.
    async fn requeue(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool, RepositoryError>;

    /// Returns entries stranded in flight by a crash to pending.
    async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait ConversationLogRepository: Send + Sync {
    async fn save(&self, entry: &ConversationLogEntry) -> Result<(), RepositoryError>;

    async fn list_for_thread(
        &self,
        channel_name: &str,
        thread_ts: &str,
    ) -> Result<Vec<ConversationLogEntry>, RepositoryError>;
}

#[async_trait]
pub trait SessionHistoryRepository: Send + Sync {
    async fn append(&self, message: &SessionMessage) -> Result<(), RepositoryError>;

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, RepositoryError>;
}

pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(tars_core::chrono::SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

pub(crate) fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    column: &str,
    value: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(value)
        .map_err(|error| RepositoryError::Decode(format!("invalid json in `{column}`: {error}")))
}

pub(crate) fn encode_json<T: serde::Serialize>(
    column: &str,
    value: &T,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Encode(format!("could not encode `{column}`: {error}")))
}

//! Delayed evaluation queue worker and the checkpoint pruner.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use tars_core::config::QueueConfig;
use tars_core::{InterfaceError, PendingEvaluation};
use tars_db::repositories::{CheckpointRepository, EvaluationQueueRepository, RepositoryError};

use crate::services::AppServices;

const MAX_BACKOFF_SECS: i64 = 60 * 60;

/// How a claimed entry finished.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    /// Rejected as invalid; retrying would not help.
    Warning(String),
    Error(String),
}

impl DeliveryResult {
    pub fn from_evaluation<T>(result: &Result<T, InterfaceError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(error @ InterfaceError::BadRequest { .. }) => Self::Warning(error.to_string()),
            Err(error) => Self::Error(error.to_string()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub warnings: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

#[derive(Clone, Debug)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub max_attempts: u32,
    pub retry_base_secs: u64,
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            retry_base_secs: config.retry_base_secs.max(1),
        }
    }
}

impl QueueSettings {
    /// `retry_base * 2^(attempts-1)`, capped at an hour.
    pub fn retry_delay(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        let base = i64::try_from(self.retry_base_secs).unwrap_or(MAX_BACKOFF_SECS);
        chrono::Duration::seconds(base.saturating_mul(1_i64 << exponent).min(MAX_BACKOFF_SECS))
    }
}

pub struct QueueWorker {
    queue: Arc<dyn EvaluationQueueRepository>,
    services: Arc<AppServices>,
    settings: QueueSettings,
}

impl QueueWorker {
    pub fn new(
        queue: Arc<dyn EvaluationQueueRepository>,
        services: Arc<AppServices>,
        settings: QueueSettings,
    ) -> Self {
        Self { queue, services, settings }
    }

    /// Claims due entries and evaluates them concurrently. Claiming hands out
    /// at most one entry per channel, so per-channel order is kept.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RepositoryError> {
        let claimed = self.queue.claim_due(now, self.settings.batch_size).await?;
        let mut report = TickReport { claimed: claimed.len(), ..TickReport::default() };

        let mut handles = Vec::with_capacity(claimed.len());
        for entry in claimed {
            let services = self.services.clone();
            handles.push(tokio::spawn(async move {
                let correlation_id = format!("queue-{}", Uuid::new_v4());
                let result = services.evaluate(&entry.request, &correlation_id).await;
                (entry, DeliveryResult::from_evaluation(&result))
            }));
        }

        for handle in handles {
            let (entry, result) = match handle.await {
                Ok(outcome) => outcome,
                Err(join_error) => {
                    error!(event_name = "queue.task.panicked", error = %join_error, "evaluation task failed");
                    continue;
                }
            };
            self.settle(&entry, result, &mut report).await?;
        }
        Ok(report)
    }

    async fn settle(
        &self,
        entry: &PendingEvaluation,
        result: DeliveryResult,
        report: &mut TickReport,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        match result {
            DeliveryResult::Success => {
                self.queue.complete(&entry.message_id).await?;
                report.succeeded += 1;
            }
            DeliveryResult::Warning(detail) => {
                warn!(
                    event_name = "queue.delivery.warning",
                    message_id = %entry.message_id,
                    thread_id = %entry.request.thread_ts,
                    channel = %entry.channel,
                    detail = %detail,
                    "evaluation rejected the request"
                );
                self.queue.complete(&entry.message_id).await?;
                report.warnings += 1;
            }
            DeliveryResult::Error(detail) if entry.attempts >= self.settings.max_attempts => {
                error!(
                    event_name = "queue.delivery.dead_letter",
                    message_id = %entry.message_id,
                    thread_id = %entry.request.thread_ts,
                    channel = %entry.channel,
                    attempts = entry.attempts,
                    error = %detail,
                    "evaluation moved to dead letter"
                );
                self.queue.fail(&entry.message_id, &detail, None, now).await?;
                report.dead_lettered += 1;
            }
            DeliveryResult::Error(detail) => {
                let retry_at = now + self.settings.retry_delay(entry.attempts);
                warn!(
                    event_name = "queue.delivery.retry",
                    message_id = %entry.message_id,
                    thread_id = %entry.request.thread_ts,
                    channel = %entry.channel,
                    attempts = entry.attempts,
                    retry_at = %retry_at.to_rfc3339(),
                    error = %detail,
                    "evaluation failed, retrying"
                );
                self.queue.fail(&entry.message_id, &detail, Some(retry_at), now).await?;
                report.retried += 1;
            }
        }
        Ok(())
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.queue.recover_in_flight(Utc::now()).await {
                Ok(0) => {}
                Ok(recovered) => info!(
                    event_name = "queue.worker.recovered",
                    recovered,
                    "returned in-flight evaluations to pending"
                ),
                Err(error) => error!(
                    event_name = "queue.worker.recover_failed",
                    error = %error,
                    "could not recover in-flight evaluations"
                ),
            }

            let mut interval = tokio::time::interval(self.settings.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(error) = self.tick(Utc::now()).await {
                    error!(event_name = "queue.worker.tick_failed", error = %error, "queue poll failed");
                }
            }
            info!(event_name = "queue.worker.stopped", "queue worker stopped");
        })
    }
}

/// Deletes expired checkpoints on a fixed interval.
pub fn spawn_checkpoint_pruner(
    checkpoints: Arc<dyn CheckpointRepository>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            match checkpoints.prune_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(pruned) => info!(event_name = "checkpoint.pruned", pruned, "expired checkpoints removed"),
                Err(error) => {
                    error!(event_name = "checkpoint.prune_failed", error = %error, "checkpoint prune failed")
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> QueueSettings {
        QueueSettings {
            poll_interval: Duration::from_millis(50),
            batch_size: 10,
            max_attempts: 3,
            retry_base_secs: 30,
        }
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let settings = settings();
        assert_eq!(settings.retry_delay(1), chrono::Duration::seconds(30));
        assert_eq!(settings.retry_delay(2), chrono::Duration::seconds(60));
        assert_eq!(settings.retry_delay(3), chrono::Duration::seconds(120));
        assert_eq!(settings.retry_delay(40), chrono::Duration::seconds(MAX_BACKOFF_SECS));
    }

    #[test]
    fn bad_requests_are_warnings_and_outages_are_errors() {
        let ok: Result<(), InterfaceError> = Ok(());
        assert_eq!(DeliveryResult::from_evaluation(&ok), DeliveryResult::Success);

        let bad: Result<(), InterfaceError> = Err(InterfaceError::BadRequest {
            message: "missing ts".to_string(),
            correlation_id: "c".to_string(),
        });
        assert!(matches!(DeliveryResult::from_evaluation(&bad), DeliveryResult::Warning(_)));

        let down: Result<(), InterfaceError> = Err(InterfaceError::ServiceUnavailable {
            message: "slack unavailable".to_string(),
            correlation_id: "c".to_string(),
        });
        assert!(matches!(DeliveryResult::from_evaluation(&down), DeliveryResult::Error(_)));
    }

    #[tokio::test]
    async fn failing_evaluations_retry_then_dead_letter() {
        use tars_core::domain::requests::EvaluationRequest;
        use tars_core::QueueStatus;

        let harness = crate::test_support::failing_slack_harness().await;
        let now = Utc::now();
        let request = EvaluationRequest {
            bot_tag: "<@U0TARS>".to_string(),
            channel: "C1".to_string(),
            ts: "1712345678.000200".to_string(),
            thread_ts: "1712345678.000100".to_string(),
            user: "U1".to_string(),
            text: "anyone?".to_string(),
        };
        harness
            .queue
            .enqueue(&PendingEvaluation::new(request, now - chrono::Duration::seconds(1), now))
            .await
            .expect("enqueue");
        let worker = QueueWorker::new(
            harness.queue.clone(),
            harness.services.clone(),
            QueueSettings { max_attempts: 2, ..settings() },
        );

        let first = worker.tick(now).await.expect("first tick");
        assert_eq!(first, TickReport { claimed: 1, retried: 1, ..TickReport::default() });
        let pending = harness.queue.list(Some(QueueStatus::Pending)).await.expect("list");
        assert_eq!(pending[0].attempts, 1);
        assert!(pending[0].last_error.as_deref().unwrap_or_default().contains("ratelimited"));

        let second = worker.tick(now + chrono::Duration::hours(2)).await.expect("second tick");
        assert_eq!(second.dead_lettered, 1);
        let dead = harness.queue.list(Some(QueueStatus::DeadLetter)).await.expect("list");
        assert_eq!(dead.len(), 1);
    }
}

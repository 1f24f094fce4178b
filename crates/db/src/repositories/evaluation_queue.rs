use sqlx::{sqlite::SqliteRow, Row};

use tars_core::chrono::{DateTime, Utc};
use tars_core::domain::queue::{PendingEvaluation, QueueStatus};

use super::{
    encode_json, encode_timestamp, parse_json, parse_timestamp, parse_u32,
    EvaluationQueueRepository, RepositoryError,
};
use crate::DbPool;

pub struct SqlEvaluationQueueRepository {
    pool: DbPool,
}

impl SqlEvaluationQueueRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

const SELECT_COLUMNS: &str = "SELECT
        message_id,
        channel,
        payload_json,
        status,
        attempts,
        deliver_after,
        last_error,
        created_at,
        updated_at
     FROM pending_evaluation";

#[async_trait::async_trait]
impl EvaluationQueueRepository for SqlEvaluationQueueRepository {
    async fn enqueue(&self, entry: &PendingEvaluation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO pending_evaluation (
                message_id,
                channel,
                payload_json,
                status,
                attempts,
                deliver_after,
                last_error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO UPDATE SET
                channel = excluded.channel,
                payload_json = excluded.payload_json,
                status = excluded.status,
                attempts = excluded.attempts,
                deliver_after = excluded.deliver_after,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
             WHERE pending_evaluation.status != 'in_flight'",
        )
        .bind(&entry.message_id)
        .bind(&entry.channel)
        .bind(encode_json("payload_json", &entry.request)?)
        .bind(entry.status.as_str())
        .bind(i64::from(entry.attempts))
        .bind(encode_timestamp(entry.deliver_after))
        .bind(&entry.last_error)
        .bind(encode_timestamp(entry.created_at))
        .bind(encode_timestamp(entry.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn cancel(&self, message_id: &str) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM pending_evaluation WHERE message_id = ? AND status = 'pending'")
                .bind(message_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PendingEvaluation>, RepositoryError> {
        let now_text = encode_timestamp(now);
        let mut tx = self.pool.begin().await?;

        // Only the head of each idle channel is a candidate.
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} AS p
             WHERE p.status = 'pending'
               AND p.deliver_after <= ?
               AND NOT EXISTS (
                   SELECT 1 FROM pending_evaluation AS busy
                   WHERE busy.channel = p.channel AND busy.status = 'in_flight'
               )
               AND NOT EXISTS (
                   SELECT 1 FROM pending_evaluation AS ahead
                   WHERE ahead.channel = p.channel
                     AND ahead.status = 'pending'
                     AND (ahead.deliver_after < p.deliver_after
                          OR (ahead.deliver_after = p.deliver_after
                              AND (ahead.created_at < p.created_at
                                   OR (ahead.created_at = p.created_at
                                       AND ahead.message_id < p.message_id))))
               )
             ORDER BY p.deliver_after ASC, p.created_at ASC
             LIMIT ?"
        ))
        .bind(&now_text)
        .bind(i64::from(limit.max(1)))
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = Vec::new();
        for row in rows {
            let mut entry = entry_from_row(row)?;

            sqlx::query(
                "UPDATE pending_evaluation
                 SET status = 'in_flight', attempts = attempts + 1, updated_at = ?
                 WHERE message_id = ? AND status = 'pending'",
            )
            .bind(&now_text)
            .bind(&entry.message_id)
            .execute(&mut *tx)
            .await?;

            entry.status = QueueStatus::InFlight;
            entry.attempts += 1;
            entry.updated_at = now;
            claimed.push(entry);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn complete(&self, message_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("DELETE FROM pending_evaluation WHERE message_id = ? AND status = 'in_flight'")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(
        &self,
        message_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        match retry_at {
            Some(retry_at) => {
                sqlx::query(
                    "UPDATE pending_evaluation
                     SET status = 'pending', deliver_after = ?, last_error = ?, updated_at = ?
                     WHERE message_id = ?",
                )
                .bind(encode_timestamp(retry_at))
                .bind(error)
                .bind(encode_timestamp(now))
                .bind(message_id)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE pending_evaluation
                     SET status = 'dead_letter', last_error = ?, updated_at = ?
                     WHERE message_id = ?",
                )
                .bind(error)
                .bind(encode_timestamp(now))
                .bind(message_id)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<PendingEvaluation>, RepositoryError> {
        let rows = if let Some(status) = status {
            sqlx::query(&format!(
                "{SELECT_COLUMNS}
                 WHERE status = ?
                 ORDER BY deliver_after ASC, created_at ASC"
            ))
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY deliver_after ASC, created_at ASC"))
                .fetch_all(&self.pool)
                .await?
        };

        rows.into_iter().map(entry_from_row).collect()
    }

    async fn requeue(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let now_text = encode_timestamp(now);
        let result = sqlx::query(
            "UPDATE pending_evaluation
             SET status = 'pending', attempts = 0, deliver_after = ?, updated_at = ?
             WHERE message_id = ? AND status = 'dead_letter'",
        )
        .bind(&now_text)
        .bind(&now_text)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE pending_evaluation
             SET status = 'pending', updated_at = ?
             WHERE status = 'in_flight'",
        )
        .bind(encode_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn entry_from_row(row: SqliteRow) -> Result<PendingEvaluation, RepositoryError> {
    let status: String = row.try_get("status")?;
    let payload_json: String = row.try_get("payload_json")?;

    Ok(PendingEvaluation {
        message_id: row.try_get("message_id")?,
        channel: row.try_get("channel")?,
        request: parse_json("payload_json", &payload_json)?,
        status: status.parse::<QueueStatus>().map_err(RepositoryError::Decode)?,
        attempts: parse_u32("attempts", row.try_get("attempts")?)?,
        deliver_after: parse_timestamp("deliver_after", row.try_get("deliver_after")?)?,
        last_error: row.try_get("last_error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use tars_core::domain::queue::{PendingEvaluation, QueueStatus};
    use tars_core::domain::requests::EvaluationRequest;

    use super::SqlEvaluationQueueRepository;
    use crate::repositories::EvaluationQueueRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn request(channel: &str, ts: &str, text: &str) -> EvaluationRequest {
        EvaluationRequest {
            bot_tag: "<@U0TARS>".to_string(),
            channel: channel.to_string(),
            ts: ts.to_string(),
            thread_ts: ts.to_string(),
            user: "U1".to_string(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_replaces_entry_with_same_message_id() {
        let pool = setup_pool().await;
        let repo = SqlEvaluationQueueRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");

        repo.enqueue(&PendingEvaluation::new(request("C1", "1.1", "first"), now, now))
            .await
            .expect("enqueue");
        repo.enqueue(&PendingEvaluation::new(
            request("C1", "1.1", "edited"),
            now + Duration::seconds(180),
            now,
        ))
        .await
        .expect("re-enqueue");

        let entries = repo.list(None).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].request.text, "edited");
        assert_eq!(entries[0].deliver_after, now + Duration::seconds(180));

        assert!(repo.cancel("C1_1.1").await.expect("cancel"));
        assert!(!repo.cancel("C1_1.1").await.expect("cancel twice"));

        pool.close().await;
    }

    #[tokio::test]
    async fn claim_due_respects_delay_and_channel_ordering() {
        let pool = setup_pool().await;
        let repo = SqlEvaluationQueueRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");

        repo.enqueue(&PendingEvaluation::new(request("C1", "1.1", "a"), now, now))
            .await
            .expect("enqueue a");
        repo.enqueue(&PendingEvaluation::new(
            request("C1", "1.2", "b"),
            now + Duration::seconds(1),
            now,
        ))
        .await
        .expect("enqueue b");
        repo.enqueue(&PendingEvaluation::new(
            request("C2", "2.1", "c"),
            now + Duration::seconds(600),
            now,
        ))
        .await
        .expect("enqueue c");

        let later = now + Duration::seconds(5);
        let claimed = repo.claim_due(later, 10).await.expect("claim");
        assert_eq!(claimed.len(), 1, "one per channel and C2 is not due");
        assert_eq!(claimed[0].message_id, "C1_1.1");
        assert_eq!(claimed[0].attempts, 1);
        assert_eq!(claimed[0].status, QueueStatus::InFlight);

        assert!(repo.claim_due(later, 10).await.expect("claim again").is_empty());

        repo.complete("C1_1.1").await.expect("complete");
        let next = repo.claim_due(later, 10).await.expect("claim next");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].message_id, "C1_1.2");

        pool.close().await;
    }

    #[tokio::test]
    async fn busy_channel_backlog_does_not_starve_other_channels() {
        let pool = setup_pool().await;
        let repo = SqlEvaluationQueueRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");

        for i in 0..10 {
            let ts = format!("1.{i}");
            repo.enqueue(&PendingEvaluation::new(
                request("C1", &ts, "backlog"),
                now + Duration::seconds(i),
                now,
            ))
            .await
            .expect("enqueue backlog");
        }
        repo.enqueue(&PendingEvaluation::new(
            request("C2", "2.1", "quiet"),
            now + Duration::seconds(20),
            now,
        ))
        .await
        .expect("enqueue quiet");

        let later = now + Duration::seconds(30);
        let claimed = repo.claim_due(later, 2).await.expect("claim");
        let ids: Vec<&str> = claimed.iter().map(|entry| entry.message_id.as_str()).collect();
        assert_eq!(ids, vec!["C1_1.0", "C2_2.1"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn re_enqueue_leaves_in_flight_entries_alone() {
        let pool = setup_pool().await;
        let repo = SqlEvaluationQueueRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");
        repo.enqueue(&PendingEvaluation::new(request("C1", "1.1", "first"), now, now))
            .await
            .expect("enqueue");
        assert_eq!(repo.claim_due(now, 1).await.expect("claim").len(), 1);

        repo.enqueue(&PendingEvaluation::new(request("C1", "1.1", "retried delivery"), now, now))
            .await
            .expect("re-enqueue");

        let entries = repo.list(None).await.expect("list");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, QueueStatus::InFlight);
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[0].request.text, "first");
        assert!(repo.claim_due(now, 1).await.expect("claim again").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn failures_retry_then_dead_letter_and_requeue() {
        let pool = setup_pool().await;
        let repo = SqlEvaluationQueueRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");
        repo.enqueue(&PendingEvaluation::new(request("C1", "1.1", "a"), now, now))
            .await
            .expect("enqueue");

        repo.claim_due(now, 1).await.expect("claim");
        let retry_at = now + Duration::seconds(30);
        repo.fail("C1_1.1", "slack timeout", Some(retry_at), now).await.expect("fail");
        assert!(repo.claim_due(now, 1).await.expect("not yet").is_empty());

        let second = repo.claim_due(retry_at, 1).await.expect("claim retry");
        assert_eq!(second[0].attempts, 2);
        assert_eq!(second[0].last_error.as_deref(), Some("slack timeout"));

        repo.fail("C1_1.1", "still failing", None, retry_at).await.expect("dead letter");
        let dead = repo.list(Some(QueueStatus::DeadLetter)).await.expect("list dead");
        assert_eq!(dead.len(), 1);

        assert!(repo.requeue("C1_1.1", retry_at).await.expect("requeue"));
        let pending = repo.list(Some(QueueStatus::Pending)).await.expect("list pending");
        assert_eq!(pending[0].attempts, 0);

        pool.close().await;
    }

    #[tokio::test]
    async fn in_flight_entries_are_recovered() {
        let pool = setup_pool().await;
        let repo = SqlEvaluationQueueRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");
        repo.enqueue(&PendingEvaluation::new(request("C1", "1.1", "a"), now, now))
            .await
            .expect("enqueue");
        repo.claim_due(now, 1).await.expect("claim");

        assert_eq!(repo.recover_in_flight(now).await.expect("recover"), 1);
        assert_eq!(repo.claim_due(now, 1).await.expect("claim").len(), 1);

        pool.close().await;
    }
}

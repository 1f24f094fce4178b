use sqlx::{sqlite::SqliteRow, Row};

use tars_core::chrono::{DateTime, Utc};
use tars_core::domain::checkpoint::{Checkpoint, Interrupt};
use tars_core::flows::GraphNode;

use super::{
    encode_json, encode_timestamp, parse_json, parse_timestamp, parse_u32, CheckpointRepository,
    RepositoryError, ThreadSummary,
};
use crate::DbPool;

pub struct SqlCheckpointRepository {
    pool: DbPool,
}

impl SqlCheckpointRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CheckpointRepository for SqlCheckpointRepository {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let interrupt_json = checkpoint
            .interrupt
            .as_ref()
            .map(|interrupt| encode_json("interrupt_json", interrupt))
            .transpose()?;

        sqlx::query(
            "INSERT INTO graph_checkpoint (
                thread_id,
                sequence,
                checkpoint_id,
                node,
                next_node,
                state_json,
                interrupt_json,
                created_at,
                expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.thread_id)
        .bind(checkpoint.sequence)
        .bind(&checkpoint.checkpoint_id)
        .bind(checkpoint.node.as_str())
        .bind(checkpoint.next.map(|node| node.as_str()))
        .bind(encode_json("state_json", &checkpoint.state)?)
        .bind(interrupt_json)
        .bind(encode_timestamp(checkpoint.created_at))
        .bind(encode_timestamp(checkpoint.expires_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                thread_id,
                sequence,
                checkpoint_id,
                node,
                next_node,
                state_json,
                interrupt_json,
                created_at,
                expires_at
             FROM graph_checkpoint
             WHERE thread_id = ? AND expires_at > ?
             ORDER BY sequence DESC
             LIMIT 1",
        )
        .bind(thread_id)
        .bind(encode_timestamp(now))
        .fetch_optional(&self.pool)
        .await?;

        row.map(checkpoint_from_row).transpose()
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                thread_id,
                sequence,
                checkpoint_id,
                node,
                next_node,
                state_json,
                interrupt_json,
                created_at,
                expires_at
             FROM graph_checkpoint
             WHERE thread_id = ?
             ORDER BY sequence ASC",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(checkpoint_from_row).collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM graph_checkpoint WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let result = sqlx::query("DELETE FROM graph_checkpoint WHERE expires_at <= ?")
            .bind(encode_timestamp(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn list_threads(&self, now: DateTime<Utc>) -> Result<Vec<ThreadSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                latest.thread_id,
                counts.checkpoints,
                latest.sequence,
                latest.next_node,
                latest.interrupt_json,
                latest.created_at,
                latest.expires_at
             FROM graph_checkpoint AS latest
             JOIN (
                SELECT thread_id, COUNT(*) AS checkpoints, MAX(sequence) AS max_sequence
                FROM graph_checkpoint
                GROUP BY thread_id
             ) AS counts
               ON counts.thread_id = latest.thread_id
              AND counts.max_sequence = latest.sequence
             WHERE latest.expires_at > ?
             ORDER BY latest.created_at DESC",
        )
        .bind(encode_timestamp(now))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(summary_from_row).collect()
    }
}

fn parse_node(column: &str, value: &str) -> Result<GraphNode, RepositoryError> {
    value.parse::<GraphNode>().map_err(|error| {
        RepositoryError::Decode(format!("invalid node in `{column}`: {error}"))
    })
}

fn checkpoint_from_row(row: SqliteRow) -> Result<Checkpoint, RepositoryError> {
    let node: String = row.try_get("node")?;
    let next_node: Option<String> = row.try_get("next_node")?;
    let state_json: String = row.try_get("state_json")?;
    let interrupt_json: Option<String> = row.try_get("interrupt_json")?;

    Ok(Checkpoint {
        thread_id: row.try_get("thread_id")?,
        sequence: row.try_get("sequence")?,
        checkpoint_id: row.try_get("checkpoint_id")?,
        node: parse_node("node", &node)?,
        next: next_node.as_deref().map(|value| parse_node("next_node", value)).transpose()?,
        state: parse_json("state_json", &state_json)?,
        interrupt: interrupt_json
            .as_deref()
            .map(|value| parse_json::<Interrupt>("interrupt_json", value))
            .transpose()?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}

fn summary_from_row(row: SqliteRow) -> Result<ThreadSummary, RepositoryError> {
    let interrupt_json: Option<String> = row.try_get("interrupt_json")?;
    let interrupt_type = interrupt_json
        .as_deref()
        .map(|value| parse_json::<Interrupt>("interrupt_json", value))
        .transpose()?
        .map(|interrupt| interrupt.kind().to_string());

    Ok(ThreadSummary {
        thread_id: row.try_get("thread_id")?,
        checkpoints: parse_u32("checkpoints", row.try_get("checkpoints")?)?,
        latest_sequence: row.try_get("sequence")?,
        next_node: row.try_get("next_node")?,
        interrupt_type,
        updated_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        expires_at: parse_timestamp("expires_at", row.try_get("expires_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use tars_core::domain::checkpoint::{Checkpoint, Interrupt};
    use tars_core::domain::message::{ChatMessage, ConversationState, ToolCall};
    use tars_core::flows::GraphNode;

    use super::SqlCheckpointRepository;
    use crate::repositories::CheckpointRepository;
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }

    fn approval_checkpoint(thread_id: &str, sequence: i64, now: DateTime<Utc>) -> Checkpoint {
        let mut state = ConversationState::with_human("create a bucket named logs");
        state.push(ChatMessage::ai(
            "{\"content\":\"Creating bucket\"}",
            vec![ToolCall::new("tooluse_1", "call_aws", json!({"cli_command": "aws s3 mb s3://logs"}))],
        ));
        Checkpoint::new(
            thread_id,
            sequence,
            GraphNode::Approval,
            Some(GraphNode::Approval),
            state,
            Some(Interrupt::approval_request("call_aws", json!({"cli_command": "aws s3 mb s3://logs"}))),
            30,
            now,
        )
    }

    #[tokio::test]
    async fn latest_returns_highest_sequence_with_interrupt() {
        let pool = setup_pool().await;
        let repo = SqlCheckpointRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");

        let first = Checkpoint::new(
            "1712.0001",
            1,
            GraphNode::GetMemories,
            Some(GraphNode::LlmCall),
            ConversationState::with_human("create a bucket named logs"),
            None,
            30,
            now,
        );
        repo.save(&first).await.expect("save first");
        repo.save(&approval_checkpoint("1712.0001", 2, now)).await.expect("save second");

        let latest = repo.latest("1712.0001", now).await.expect("latest").expect("exists");
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.next, Some(GraphNode::Approval));
        assert_eq!(latest.interrupt.as_ref().map(Interrupt::kind), Some("approval_request"));
        assert_eq!(latest.state.messages.len(), 2);

        let history = repo.history("1712.0001").await.expect("history");
        assert_eq!(history.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![1, 2]);

        let threads = repo.list_threads(now).await.expect("threads");
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].checkpoints, 2);
        assert_eq!(threads[0].interrupt_type.as_deref(), Some("approval_request"));

        pool.close().await;
    }

    #[tokio::test]
    async fn expired_checkpoints_are_hidden_and_pruned() {
        let pool = setup_pool().await;
        let repo = SqlCheckpointRepository::new(pool.clone());
        let created = parse_ts("2026-01-01T00:00:00Z");
        repo.save(&approval_checkpoint("old-thread", 1, created)).await.expect("save");

        let later = created + Duration::days(31);
        assert!(repo.latest("old-thread", later).await.expect("latest").is_none());
        assert!(repo.latest("old-thread", created).await.expect("latest").is_some());

        assert_eq!(repo.prune_expired(later).await.expect("prune"), 1);
        assert!(repo.history("old-thread").await.expect("history").is_empty());

        pool.close().await;
    }

    #[tokio::test]
    async fn delete_thread_removes_only_that_thread() {
        let pool = setup_pool().await;
        let repo = SqlCheckpointRepository::new(pool.clone());
        let now = parse_ts("2026-03-01T10:00:00Z");
        repo.save(&approval_checkpoint("a", 1, now)).await.expect("save a");
        repo.save(&approval_checkpoint("b", 1, now)).await.expect("save b");

        assert_eq!(repo.delete_thread("a").await.expect("delete"), 1);
        assert!(repo.latest("a", now).await.expect("latest").is_none());
        assert!(repo.latest("b", now).await.expect("latest").is_some());

        let duplicate = repo.save(&approval_checkpoint("b", 1, now)).await;
        assert!(duplicate.is_err(), "sequence numbers are unique per thread");

        pool.close().await;
    }
}

use sqlx::{sqlite::SqliteRow, Row};

use tars_core::domain::agent::SubAgent;
use tars_core::domain::log::{ConversationLogEntry, SessionMessage};

use super::{
    encode_json, encode_timestamp, parse_json, parse_timestamp, ConversationLogRepository,
    RepositoryError, SessionHistoryRepository,
};
use crate::DbPool;

pub struct SqlConversationLogRepository {
    pool: DbPool,
}

impl SqlConversationLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationLogRepository for SqlConversationLogRepository {
    async fn save(&self, entry: &ConversationLogEntry) -> Result<(), RepositoryError> {
        let agent_response_json = entry
            .agent_response
            .as_ref()
            .map(|value| encode_json("agent_response_json", value))
            .transpose()?;

        sqlx::query(
            "INSERT INTO agent_conversation_log (
                channel_name,
                thread_ts,
                message_ts,
                agent,
                thread_local_time,
                message_local_time,
                chain_json,
                tool_calls_json,
                agent_response_json,
                slack_response,
                created_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(channel_name, thread_ts, message_ts) DO UPDATE SET
                agent = excluded.agent,
                chain_json = excluded.chain_json,
                tool_calls_json = excluded.tool_calls_json,
                agent_response_json = excluded.agent_response_json,
                slack_response = excluded.slack_response,
                created_at = excluded.created_at",
        )
        .bind(&entry.channel_name)
        .bind(&entry.thread_ts)
        .bind(&entry.message_ts)
        .bind(entry.agent.as_str())
        .bind(&entry.thread_local_time)
        .bind(&entry.message_local_time)
        .bind(encode_json("chain_json", &entry.chain)?)
        .bind(encode_json("tool_calls_json", &entry.tool_calls)?)
        .bind(agent_response_json)
        .bind(&entry.slack_response)
        .bind(encode_timestamp(entry.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_thread(
        &self,
        channel_name: &str,
        thread_ts: &str,
    ) -> Result<Vec<ConversationLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                channel_name,
                thread_ts,
                message_ts,
                agent,
                thread_local_time,
                message_local_time,
                chain_json,
                tool_calls_json,
                agent_response_json,
                slack_response,
                created_at
             FROM agent_conversation_log
             WHERE channel_name = ? AND thread_ts = ?
             ORDER BY message_ts ASC",
        )
        .bind(channel_name)
        .bind(thread_ts)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(log_from_row).collect()
    }
}

fn log_from_row(row: SqliteRow) -> Result<ConversationLogEntry, RepositoryError> {
    let agent: String = row.try_get("agent")?;
    let chain_json: String = row.try_get("chain_json")?;
    let tool_calls_json: String = row.try_get("tool_calls_json")?;
    let agent_response_json: Option<String> = row.try_get("agent_response_json")?;

    Ok(ConversationLogEntry {
        channel_name: row.try_get("channel_name")?,
        thread_ts: row.try_get("thread_ts")?,
        message_ts: row.try_get("message_ts")?,
        agent: agent.parse::<SubAgent>().map_err(RepositoryError::Decode)?,
        thread_local_time: row.try_get("thread_local_time")?,
        message_local_time: row.try_get("message_local_time")?,
        chain: parse_json("chain_json", &chain_json)?,
        tool_calls: parse_json("tool_calls_json", &tool_calls_json)?,
        agent_response: agent_response_json
            .as_deref()
            .map(|value| parse_json("agent_response_json", value))
            .transpose()?,
        slack_response: row.try_get("slack_response")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

/// Chat history per research session, appended in order.
pub struct SqlSessionHistoryRepository {
    pool: DbPool,
}

impl SqlSessionHistoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionHistoryRepository for SqlSessionHistoryRepository {
    async fn append(&self, message: &SessionMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO session_message (session_id, role, content, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&message.session_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(encode_timestamp(message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT session_id, role, content, created_at
             FROM session_message
             WHERE session_id = ?
             ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SessionMessage {
                    session_id: row.try_get("session_id")?,
                    role: row.try_get("role")?,
                    content: row.try_get("content")?,
                    created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use tars_core::domain::agent::SubAgent;
    use tars_core::domain::log::{ConversationLogEntry, SessionMessage};

    use super::{SqlConversationLogRepository, SqlSessionHistoryRepository};
    use crate::repositories::{ConversationLogRepository, SessionHistoryRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    #[tokio::test]
    async fn log_rows_upsert_on_composite_key() {
        let pool = setup_pool().await;
        let repo = SqlConversationLogRepository::new(pool.clone());
        let mut entry = ConversationLogEntry {
            channel_name: "dev-help".to_string(),
            thread_ts: "1712.0001".to_string(),
            message_ts: "1712.0005".to_string(),
            agent: SubAgent::Qa,
            thread_local_time: "2024-04-05 10:00".to_string(),
            message_local_time: "2024-04-05 10:01:07".to_string(),
            chain: json!([{"role": "human", "content": "how?"}]),
            tool_calls: json!([]),
            agent_response: Some(json!({"summary": "do this"})),
            slack_response: "do this".to_string(),
            created_at: Utc::now(),
        };
        repo.save(&entry).await.expect("save");
        entry.slack_response = "do that".to_string();
        repo.save(&entry).await.expect("upsert");

        let rows = repo.list_for_thread("dev-help", "1712.0001").await.expect("list");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].slack_response, "do that");
        assert_eq!(rows[0].agent, SubAgent::Qa);

        pool.close().await;
    }

    #[tokio::test]
    async fn session_messages_keep_insertion_order() {
        let pool = setup_pool().await;
        let repo = SqlSessionHistoryRepository::new(pool.clone());
        for (role, content) in [("human", "question"), ("ai", "answer")] {
            repo.append(&SessionMessage {
                session_id: "CH#dev#TH#2024-04-05 10:00".to_string(),
                role: role.to_string(),
                content: content.to_string(),
                created_at: Utc::now(),
            })
            .await
            .expect("append");
        }

        let messages = repo.messages("CH#dev#TH#2024-04-05 10:00").await.expect("messages");
        assert_eq!(
            messages.iter().map(|m| m.role.as_str()).collect::<Vec<_>>(),
            vec!["human", "ai"]
        );
        assert!(repo.messages("other").await.expect("messages").is_empty());

        pool.close().await;
    }
}

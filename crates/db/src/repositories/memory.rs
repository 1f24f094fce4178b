use std::collections::{BTreeMap, HashMap, HashSet};

use tokio::sync::RwLock;

use tars_core::chrono::{DateTime, Utc};
use tars_core::domain::checkpoint::Checkpoint;
use tars_core::domain::log::{ConversationLogEntry, SessionMessage};
use tars_core::domain::queue::{PendingEvaluation, QueueStatus};

use super::{
    CheckpointRepository, ConversationLogRepository, EvaluationQueueRepository, RepositoryError,
    SessionHistoryRepository, ThreadSummary,
};

#[derive(Default)]
pub struct InMemoryCheckpointRepository {
    threads: RwLock<HashMap<String, BTreeMap<i64, Checkpoint>>>,
}

#[async_trait::async_trait]
impl CheckpointRepository for InMemoryCheckpointRepository {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), RepositoryError> {
        let mut threads = self.threads.write().await;
        let thread = threads.entry(checkpoint.thread_id.clone()).or_default();
        if thread.contains_key(&checkpoint.sequence) {
            return Err(RepositoryError::Encode(format!(
                "checkpoint {} already exists for thread {}",
                checkpoint.sequence, checkpoint.thread_id
            )));
        }
        thread.insert(checkpoint.sequence, checkpoint.clone());
        Ok(())
    }

    async fn latest(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Checkpoint>, RepositoryError> {
        let threads = self.threads.read().await;
        Ok(threads
            .get(thread_id)
            .and_then(|thread| thread.values().next_back())
            .filter(|checkpoint| !checkpoint.is_expired(now))
            .cloned())
    }

    async fn history(&self, thread_id: &str) -> Result<Vec<Checkpoint>, RepositoryError> {
        let threads = self.threads.read().await;
        Ok(threads.get(thread_id).map(|thread| thread.values().cloned().collect()).unwrap_or_default())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<u64, RepositoryError> {
        let mut threads = self.threads.write().await;
        Ok(threads.remove(thread_id).map(|thread| thread.len() as u64).unwrap_or(0))
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut threads = self.threads.write().await;
        let mut removed = 0;
        for thread in threads.values_mut() {
            let before = thread.len();
            thread.retain(|_, checkpoint| !checkpoint.is_expired(now));
            removed += (before - thread.len()) as u64;
        }
        threads.retain(|_, thread| !thread.is_empty());
        Ok(removed)
    }

    async fn list_threads(&self, now: DateTime<Utc>) -> Result<Vec<ThreadSummary>, RepositoryError> {
        let threads = self.threads.read().await;
        let mut summaries: Vec<ThreadSummary> = threads
            .iter()
            .filter_map(|(thread_id, thread)| {
                let latest = thread.values().next_back()?;
                if latest.is_expired(now) {
                    return None;
                }
                Some(ThreadSummary {
                    thread_id: thread_id.clone(),
                    checkpoints: u32::try_from(thread.len()).unwrap_or(u32::MAX),
                    latest_sequence: latest.sequence,
                    next_node: latest.next.map(|node| node.as_str().to_string()),
                    interrupt_type: latest.interrupt.as_ref().map(|i| i.kind().to_string()),
                    updated_at: latest.created_at,
                    expires_at: latest.expires_at,
                })
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}

#[derive(Default)]
pub struct InMemoryEvaluationQueueRepository {
    entries: RwLock<HashMap<String, PendingEvaluation>>,
}

#[async_trait::async_trait]
impl EvaluationQueueRepository for InMemoryEvaluationQueueRepository {
    async fn enqueue(&self, entry: &PendingEvaluation) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        if entries.get(&entry.message_id).is_some_and(|existing| existing.status == QueueStatus::InFlight) {
            return Ok(());
        }
        let created_at =
            entries.get(&entry.message_id).map(|existing| existing.created_at).unwrap_or(entry.created_at);
        let mut stored = entry.clone();
        stored.created_at = created_at;
        entries.insert(entry.message_id.clone(), stored);
        Ok(())
    }

    async fn cancel(&self, message_id: &str) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().await;
        let pending = entries
            .get(message_id)
            .map(|entry| entry.status == QueueStatus::Pending)
            .unwrap_or(false);
        if pending {
            entries.remove(message_id);
        }
        Ok(pending)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<PendingEvaluation>, RepositoryError> {
        let mut entries = self.entries.write().await;
        let busy: HashSet<String> = entries
            .values()
            .filter(|entry| entry.status == QueueStatus::InFlight)
            .map(|entry| entry.channel.clone())
            .collect();

        let mut due: Vec<PendingEvaluation> = entries
            .values()
            .filter(|entry| {
                entry.status == QueueStatus::Pending
                    && entry.deliver_after <= now
                    && !busy.contains(&entry.channel)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.deliver_after.cmp(&b.deliver_after).then_with(|| a.created_at.cmp(&b.created_at))
        });

        let mut seen = HashSet::new();
        let mut claimed = Vec::new();
        for mut entry in due {
            if claimed.len() >= limit.max(1) as usize {
                break;
            }
            if !seen.insert(entry.channel.clone()) {
                continue;
            }
            entry.status = QueueStatus::InFlight;
            entry.attempts += 1;
            entry.updated_at = now;
            entries.insert(entry.message_id.clone(), entry.clone());
            claimed.push(entry);
        }
        Ok(claimed)
    }

    async fn complete(&self, message_id: &str) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        if entries.get(message_id).map(|entry| entry.status == QueueStatus::InFlight).unwrap_or(false)
        {
            entries.remove(message_id);
        }
        Ok(())
    }

    async fn fail(
        &self,
        message_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(message_id) {
            entry.last_error = Some(error.to_string());
            entry.updated_at = now;
            match retry_at {
                Some(retry_at) => {
                    entry.status = QueueStatus::Pending;
                    entry.deliver_after = retry_at;
                }
                None => entry.status = QueueStatus::DeadLetter,
            }
        }
        Ok(())
    }

    async fn list(
        &self,
        status: Option<QueueStatus>,
    ) -> Result<Vec<PendingEvaluation>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut listed: Vec<PendingEvaluation> = entries
            .values()
            .filter(|entry| status.map(|wanted| entry.status == wanted).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| {
            a.deliver_after.cmp(&b.deliver_after).then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(listed)
    }

    async fn requeue(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(message_id) {
            Some(entry) if entry.status == QueueStatus::DeadLetter => {
                entry.status = QueueStatus::Pending;
                entry.attempts = 0;
                entry.deliver_after = now;
                entry.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_in_flight(&self, now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let mut recovered = 0;
        for entry in entries.values_mut().filter(|entry| entry.status == QueueStatus::InFlight) {
            entry.status = QueueStatus::Pending;
            entry.updated_at = now;
            recovered += 1;
        }
        Ok(recovered)
    }
}

#[derive(Default)]
pub struct InMemoryConversationLogRepository {
    entries: RwLock<Vec<ConversationLogEntry>>,
}

#[async_trait::async_trait]
impl ConversationLogRepository for InMemoryConversationLogRepository {
    async fn save(&self, entry: &ConversationLogEntry) -> Result<(), RepositoryError> {
        let mut entries = self.entries.write().await;
        entries.retain(|existing| {
            (&existing.channel_name, &existing.thread_ts, &existing.message_ts)
                != (&entry.channel_name, &entry.thread_ts, &entry.message_ts)
        });
        entries.push(entry.clone());
        Ok(())
    }

    async fn list_for_thread(
        &self,
        channel_name: &str,
        thread_ts: &str,
    ) -> Result<Vec<ConversationLogEntry>, RepositoryError> {
        let entries = self.entries.read().await;
        let mut rows: Vec<ConversationLogEntry> = entries
            .iter()
            .filter(|entry| entry.channel_name == channel_name && entry.thread_ts == thread_ts)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.message_ts.cmp(&b.message_ts));
        Ok(rows)
    }
}

#[derive(Default)]
pub struct InMemorySessionHistoryRepository {
    sessions: RwLock<HashMap<String, Vec<SessionMessage>>>,
}

#[async_trait::async_trait]
impl SessionHistoryRepository for InMemorySessionHistoryRepository {
    async fn append(&self, message: &SessionMessage) -> Result<(), RepositoryError> {
        let mut sessions = self.sessions.write().await;
        sessions.entry(message.session_id.clone()).or_default().push(message.clone());
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, RepositoryError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use tars_core::domain::checkpoint::Checkpoint;
    use tars_core::domain::message::ConversationState;
    use tars_core::domain::queue::{PendingEvaluation, QueueStatus};
    use tars_core::domain::requests::EvaluationRequest;
    use tars_core::flows::GraphNode;

    use super::{InMemoryCheckpointRepository, InMemoryEvaluationQueueRepository};
    use crate::repositories::{CheckpointRepository, EvaluationQueueRepository};

    #[tokio::test]
    async fn in_memory_checkpoints_mirror_sql_semantics() {
        let repo = InMemoryCheckpointRepository::default();
        let now = Utc::now();
        for sequence in 1..=3 {
            repo.save(&Checkpoint::new(
                "t1",
                sequence,
                GraphNode::LlmCall,
                None,
                ConversationState::with_human("hi"),
                None,
                1,
                now,
            ))
            .await
            .expect("save");
        }

        let latest = repo.latest("t1", now).await.expect("latest").expect("exists");
        assert_eq!(latest.sequence, 3);
        assert!(repo.latest("t1", now + Duration::days(2)).await.expect("latest").is_none());
        assert_eq!(repo.prune_expired(now + Duration::days(2)).await.expect("prune"), 3);
        assert!(repo.list_threads(now).await.expect("threads").is_empty());
    }

    #[tokio::test]
    async fn in_memory_queue_claims_one_per_channel() {
        let repo = InMemoryEvaluationQueueRepository::default();
        let now = Utc::now();
        for ts in ["1.1", "1.2"] {
            let request = EvaluationRequest {
                bot_tag: "<@U0>".to_string(),
                channel: "C1".to_string(),
                ts: ts.to_string(),
                thread_ts: ts.to_string(),
                user: "U1".to_string(),
                text: "hello".to_string(),
            };
            repo.enqueue(&PendingEvaluation::new(request, now, now)).await.expect("enqueue");
        }

        let claimed = repo.claim_due(now, 5).await.expect("claim");
        assert_eq!(claimed.len(), 1);
        assert!(repo.claim_due(now, 5).await.expect("claim").is_empty());

        let mut redelivered = claimed[0].clone();
        redelivered.status = QueueStatus::Pending;
        redelivered.attempts = 0;
        repo.enqueue(&redelivered).await.expect("re-enqueue");
        let in_flight = repo.list(Some(QueueStatus::InFlight)).await.expect("list");
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].attempts, 1);
    }
}

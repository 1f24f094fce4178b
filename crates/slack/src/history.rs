use std::sync::Arc;

use tracing::debug;

use tars_core::domain::thread::ThreadMessage;

use crate::api::{SlackApi, SlackApiError, SlackMessage};
use crate::users::UserNameCache;

const BOT_FALLBACK_NAME: &str = "bot";

/// A thread message with its Slack timestamp kept for locating it later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadEntry {
    pub ts: String,
    pub message: ThreadMessage,
}

/// Thread messages in order, restricted to ones with an author and text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub entries: Vec<ThreadEntry>,
}

impl ThreadSnapshot {
    pub fn story(&self) -> Vec<ThreadMessage> {
        self.entries.iter().map(|entry| entry.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the evaluated message: by `ts` first, then by exact text.
    pub fn locate(&self, ts: &str, text: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.ts == ts).or_else(|| {
            self.entries.iter().position(|entry| !text.is_empty() && entry.message.message == text)
        })
    }

    pub fn is_last(&self, idx: usize) -> bool {
        idx + 1 >= self.entries.len()
    }
}

pub struct ThreadHistoryFetcher {
    api: Arc<dyn SlackApi>,
    users: UserNameCache,
}

impl ThreadHistoryFetcher {
    pub fn new(api: Arc<dyn SlackApi>) -> Self {
        let users = UserNameCache::new(api.clone());
        Self { api, users }
    }

    pub async fn fetch(&self, channel: &str, thread_ts: &str) -> Result<ThreadSnapshot, SlackApiError> {
        let replies = self.api.conversation_replies(channel, thread_ts).await?;
        let mut entries = Vec::with_capacity(replies.len());
        for reply in replies {
            let Some(text) = reply.text.clone() else {
                continue;
            };
            let Some(from) = self.author(&reply).await else {
                continue;
            };
            entries.push(ThreadEntry { ts: reply.ts, message: ThreadMessage::new(from, text) });
        }

        debug!(
            event_name = "slack.history.fetched",
            channel,
            thread_id = thread_ts,
            messages = entries.len(),
            "thread history fetched"
        );
        Ok(ThreadSnapshot { entries })
    }

    /// `name_normalized` of the channel, used as the channel name agents see.
    pub async fn channel_name(&self, channel: &str) -> Result<String, SlackApiError> {
        let info = self.api.conversation_info(channel).await?;
        Ok(info.display_name().to_string())
    }

    async fn author(&self, reply: &SlackMessage) -> Option<String> {
        if let Some(user) = reply.user.as_deref() {
            return Some(self.users.resolve(user).await);
        }
        reply.bot_id.as_ref()?;
        Some(
            reply
                .username
                .clone()
                .or_else(|| reply.bot_profile.as_ref().and_then(|profile| profile.name.clone()))
                .unwrap_or_else(|| BOT_FALLBACK_NAME.to_string()),
        )
    }
}

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;
use tracing::warn;

use crate::api::SlackApi;

pub const USER_CACHE_CAPACITY: usize = 20;

/// Resolves Slack user ids to human-readable names, remembering recent lookups.
pub struct UserNameCache {
    api: Arc<dyn SlackApi>,
    names: Mutex<LruCache<String, String>>,
}

impl UserNameCache {
    pub fn new(api: Arc<dyn SlackApi>) -> Self {
        Self::with_capacity(api, USER_CACHE_CAPACITY)
    }

    pub fn with_capacity(api: Arc<dyn SlackApi>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { api, names: Mutex::new(LruCache::new(capacity)) }
    }

    /// Falls back to the raw id when the lookup fails; failures are not cached.
    pub async fn resolve(&self, user_id: &str) -> String {
        if let Some(name) = self.names.lock().await.get(user_id) {
            return name.clone();
        }

        match self.api.user_info(user_id).await {
            Ok(user) => {
                let name = user.preferred_name();
                self.names.lock().await.put(user_id.to_string(), name.clone());
                name
            }
            Err(error) => {
                warn!(
                    event_name = "slack.users.lookup_failed",
                    user_id,
                    error = %error,
                    "falling back to raw user id"
                );
                user_id.to_string()
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.names.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use tars_core::domain::requests::PostMessageArgs;

    use crate::api::{
        AuthIdentity, ChannelInfo, PostedMessage, SlackApi, SlackApiError, SlackMessage, SlackUser,
    };

    /// Canned Slack workspace used across this crate's tests.
    #[derive(Default)]
    pub struct FakeSlack {
        pub users: HashMap<String, SlackUser>,
        pub replies: Vec<SlackMessage>,
        pub channel: Option<ChannelInfo>,
        pub user_lookups: Mutex<Vec<String>>,
        pub posted: Mutex<Vec<PostMessageArgs>>,
    }

    impl FakeSlack {
        pub fn with_user(mut self, id: &str, display_name: &str) -> Self {
            let user = serde_json::from_value(json!({
                "id": id,
                "name": id.to_lowercase(),
                "profile": {"display_name": display_name}
            }))
            .expect("user fixture");
            self.users.insert(id.to_string(), user);
            self
        }

        pub fn lookups(&self) -> Vec<String> {
            self.user_lookups.lock().expect("lookups lock").clone()
        }
    }

    #[async_trait]
    impl SlackApi for FakeSlack {
        async fn auth_test(&self) -> Result<AuthIdentity, SlackApiError> {
            Ok(AuthIdentity { user_id: "U0TARS".to_string(), bot_id: Some("B0TARS".to_string()), team: None })
        }

        async fn conversation_replies(
            &self,
            _channel: &str,
            _thread_ts: &str,
        ) -> Result<Vec<SlackMessage>, SlackApiError> {
            Ok(self.replies.clone())
        }

        async fn conversation_info(&self, channel: &str) -> Result<ChannelInfo, SlackApiError> {
            self.channel.clone().ok_or_else(|| SlackApiError::Api {
                method: "conversations.info",
                error: format!("channel_not_found: {channel}"),
            })
        }

        async fn user_info(&self, user_id: &str) -> Result<SlackUser, SlackApiError> {
            self.user_lookups.lock().expect("lookups lock").push(user_id.to_string());
            self.users.get(user_id).cloned().ok_or_else(|| SlackApiError::Api {
                method: "users.info",
                error: "user_not_found".to_string(),
            })
        }

        async fn post_message(&self, args: &PostMessageArgs) -> Result<PostedMessage, SlackApiError> {
            self.posted.lock().expect("posted lock").push(args.clone());
            Ok(PostedMessage { channel: args.channel.clone(), ts: "9999.0001".to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::fakes::FakeSlack;
    use super::UserNameCache;

    #[tokio::test]
    async fn caches_successful_lookups_only() {
        let slack = Arc::new(FakeSlack::default().with_user("U1", "ana"));
        let cache = UserNameCache::new(slack.clone());

        assert_eq!(cache.resolve("U1").await, "ana");
        assert_eq!(cache.resolve("U1").await, "ana");
        assert_eq!(cache.resolve("U404").await, "U404");
        assert_eq!(cache.resolve("U404").await, "U404");

        assert_eq!(slack.lookups(), vec!["U1", "U404", "U404"]);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_entry() {
        let slack = Arc::new(
            FakeSlack::default().with_user("U1", "ana").with_user("U2", "bo").with_user("U3", "cy"),
        );
        let cache = UserNameCache::with_capacity(slack.clone(), 2);

        cache.resolve("U1").await;
        cache.resolve("U2").await;
        cache.resolve("U3").await;
        cache.resolve("U1").await;

        assert_eq!(slack.lookups(), vec!["U1", "U2", "U3", "U1"]);
    }
}

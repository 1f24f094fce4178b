use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tars_core::domain::requests::PostMessageArgs;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum SlackApiError {
    #[error("{method} request failed: {source}")]
    Transport {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{method} returned an undecodable body: {detail}")]
    Decode { method: &'static str, detail: String },
    #[error("{method} error: {error}")]
    Api { method: &'static str, error: String },
}

impl SlackApiError {
    /// Slack's machine-readable error code, when the API answered with one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct AuthIdentity {
    pub user_id: String,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BotProfile {
    #[serde(default)]
    pub name: Option<String>,
}

/// One message as returned by `conversations.replies`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SlackMessage {
    pub ts: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bot_profile: Option<BotProfile>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub name_normalized: Option<String>,
}

impl ChannelInfo {
    /// Name agents address the channel by, falling back to the raw id.
    pub fn display_name(&self) -> &str {
        self.name_normalized
            .as_deref()
            .or(self.name.as_deref())
            .filter(|name| !name.is_empty())
            .unwrap_or(self.id.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SlackUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub profile: UserProfile,
}

impl SlackUser {
    /// display_name, then real_name, then the handle, then the id.
    pub fn preferred_name(&self) -> String {
        [
            self.profile.display_name.as_deref(),
            self.profile.real_name.as_deref(),
            self.real_name.as_deref(),
            self.name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(self.id.as_str())
        .to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedMessage {
    pub channel: String,
    pub ts: String,
}

/// The subset of the Slack Web API the assistant relies on.
#[async_trait]
pub trait SlackApi: Send + Sync {
    async fn auth_test(&self) -> Result<AuthIdentity, SlackApiError>;

    async fn conversation_replies(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, SlackApiError>;

    async fn conversation_info(&self, channel: &str) -> Result<ChannelInfo, SlackApiError>;

    async fn user_info(&self, user_id: &str) -> Result<SlackUser, SlackApiError>;

    async fn post_message(&self, args: &PostMessageArgs) -> Result<PostedMessage, SlackApiError>;
}

pub struct SlackWebClient {
    http: Client,
    base_url: String,
    token: String,
}

impl SlackWebClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SlackApiError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|source| SlackApiError::Transport { method: "client", source })?;
        Ok(Self::with_client(http, base_url, token))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn get(&self, method: &'static str, query: &[(&str, &str)]) -> Result<Value, SlackApiError> {
        let response = self
            .http
            .get(self.endpoint(method))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|source| SlackApiError::Transport { method, source })?;
        check_envelope(method, response).await
    }

    async fn post_json(&self, method: &'static str, payload: &Value) -> Result<Value, SlackApiError> {
        let response = self
            .http
            .post(self.endpoint(method))
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|source| SlackApiError::Transport { method, source })?;
        check_envelope(method, response).await
    }
}

async fn check_envelope(
    method: &'static str,
    response: reqwest::Response,
) -> Result<Value, SlackApiError> {
    let body: Value = response
        .json()
        .await
        .map_err(|error| SlackApiError::Decode { method, detail: error.to_string() })?;

    if body.get("ok").and_then(Value::as_bool) != Some(true) {
        let error = body.get("error").and_then(Value::as_str).unwrap_or("unknown").to_string();
        return Err(SlackApiError::Api { method, error });
    }
    Ok(body)
}

fn field<T: DeserializeOwned>(method: &'static str, body: &Value, key: &str) -> Result<T, SlackApiError> {
    let value = body.get(key).cloned().ok_or_else(|| SlackApiError::Decode {
        method,
        detail: format!("missing `{key}`"),
    })?;
    serde_json::from_value(value)
        .map_err(|error| SlackApiError::Decode { method, detail: error.to_string() })
}

#[async_trait]
impl SlackApi for SlackWebClient {
    async fn auth_test(&self) -> Result<AuthIdentity, SlackApiError> {
        let body = self.post_json("auth.test", &Value::Object(Default::default())).await?;
        serde_json::from_value(body)
            .map_err(|error| SlackApiError::Decode { method: "auth.test", detail: error.to_string() })
    }

    async fn conversation_replies(
        &self,
        channel: &str,
        thread_ts: &str,
    ) -> Result<Vec<SlackMessage>, SlackApiError> {
        let mut messages: Vec<SlackMessage> = Vec::new();
        let mut cursor = String::new();
        loop {
            let mut query = vec![("channel", channel), ("ts", thread_ts), ("limit", "200")];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.as_str()));
            }
            let body = self.get("conversations.replies", &query).await?;
            let page: Vec<SlackMessage> = field("conversations.replies", &body, "messages")?;
            messages.extend(page);

            let next = body
                .pointer("/response_metadata/next_cursor")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if next.is_empty() {
                return Ok(messages);
            }
            cursor = next;
        }
    }

    async fn conversation_info(&self, channel: &str) -> Result<ChannelInfo, SlackApiError> {
        let body = self.get("conversations.info", &[("channel", channel)]).await?;
        field("conversations.info", &body, "channel")
    }

    async fn user_info(&self, user_id: &str) -> Result<SlackUser, SlackApiError> {
        let body = self.get("users.info", &[("user", user_id)]).await?;
        field("users.info", &body, "user")
    }

    async fn post_message(&self, args: &PostMessageArgs) -> Result<PostedMessage, SlackApiError> {
        let payload = serde_json::to_value(args).map_err(|error| SlackApiError::Decode {
            method: "chat.postMessage",
            detail: error.to_string(),
        })?;
        let body = self.post_json("chat.postMessage", &payload).await?;
        serde_json::from_value(body).map_err(|error| SlackApiError::Decode {
            method: "chat.postMessage",
            detail: error.to_string(),
        })
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::agent::SubAgent;
use crate::domain::thread::ThreadMessage;
use crate::errors::DomainError;

/// Unwraps `{"body": ...}` envelopes where the body may be a JSON string.
pub fn unwrap_body(payload: &Value) -> Result<Value, DomainError> {
    match payload.get("body") {
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|_| DomainError::InvalidRequest("Invalid JSON in request body".to_string())),
        Some(body) => Ok(body.clone()),
        None => match payload {
            Value::String(raw) => serde_json::from_str(raw).map_err(|_| {
                DomainError::InvalidRequest("Invalid JSON in request body".to_string())
            }),
            other => Ok(other.clone()),
        },
    }
}

fn object(payload: &Value) -> Result<&Map<String, Value>, DomainError> {
    payload
        .as_object()
        .ok_or_else(|| DomainError::InvalidRequest("request body must be a JSON object".to_string()))
}

fn missing(fields: &Map<String, Value>, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|name| fields.get(**name).map(Value::is_null).unwrap_or(true))
        .map(|name| name.to_string())
        .collect()
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name) {
        Some(Value::String(value)) => Some(value.clone()),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    }
}

fn required_string(fields: &Map<String, Value>, name: &str) -> Result<String, DomainError> {
    string_field(fields, name)
        .ok_or_else(|| DomainError::InvalidRequest(format!("'{name}' must be a string.")))
}

/// A Slack message queued for relevance evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    pub bot_tag: String,
    pub channel: String,
    pub ts: String,
    pub thread_ts: String,
    pub user: String,
    #[serde(default)]
    pub text: String,
}

impl EvaluationRequest {
    pub fn from_value(payload: &Value) -> Result<Self, DomainError> {
        let body = unwrap_body(payload)?;
        let fields = object(&body)?;
        let absent = missing(fields, &["bot_tag", "channel", "ts", "user"]);
        if !absent.is_empty() {
            return Err(DomainError::MissingArguments(absent));
        }

        let ts = required_string(fields, "ts")?;
        let thread_ts = string_field(fields, "thread_ts").unwrap_or_else(|| ts.clone());
        let text = string_field(fields, "text")
            .or_else(|| string_field(fields, "message"))
            .unwrap_or_default();

        Ok(Self {
            bot_tag: required_string(fields, "bot_tag")?,
            channel: required_string(fields, "channel")?,
            ts,
            thread_ts,
            user: required_string(fields, "user")?,
            text,
        })
    }

    pub fn message_id(&self) -> String {
        crate::domain::thread::message_id(&self.channel, &self.ts)
    }
}

/// Payload the evaluator sends to the chosen sub-agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub channel: String,
    /// Slack channel id for posting replies; `channel` carries the readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub thread_history: Vec<ThreadMessage>,
    pub thread_ts: String,
    pub ts: String,
    pub message_idx: usize,
    pub message: String,
    pub media_channel: String,
}

/// Input of the infrastructure agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchitectureRequest {
    pub message: String,
    pub thread_ts: String,
    pub channel: String,
    pub channel_id: Option<String>,
}

impl ArchitectureRequest {
    pub fn from_value(payload: &Value) -> Result<Self, DomainError> {
        let body = unwrap_body(payload)?;
        let fields = object(&body)?;
        let absent = missing(fields, &["message", "thread_ts", "channel"]);
        if !absent.is_empty() {
            return Err(DomainError::MissingArguments(absent));
        }

        let message = match fields.get("message") {
            Some(Value::String(message)) => message.clone(),
            _ => return Err(DomainError::InvalidRequest("'message' must be a string.".to_string())),
        };

        Ok(Self {
            message,
            thread_ts: required_string(fields, "thread_ts")?,
            channel: required_string(fields, "channel")?,
            channel_id: string_field(fields, "channel_id"),
        })
    }

    /// Checkpoints are keyed by the Slack thread.
    pub fn thread_id(&self) -> &str {
        &self.thread_ts
    }

    pub fn reply_channel(&self) -> &str {
        self.channel_id.as_deref().unwrap_or(&self.channel)
    }
}

/// Input of the research agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QaRequest {
    pub channel: String,
    pub channel_id: Option<String>,
    pub thread_ts: String,
    pub ts: String,
    pub thread_history: Vec<ThreadMessage>,
    pub message_idx: usize,
    pub message: String,
}

impl QaRequest {
    pub fn from_value(payload: &Value) -> Result<Self, DomainError> {
        let body = unwrap_body(payload)?;
        let fields = object(&body)?;
        let mut absent = missing(fields, &["channel", "thread_ts"]);
        let has_history = fields.get("thread_history").is_some_and(|value| !value.is_null());
        let has_message = fields.get("message").is_some_and(|value| !value.is_null());
        if !has_history && !has_message {
            absent.push("thread_history|message".to_string());
        }
        if !absent.is_empty() {
            return Err(DomainError::MissingArguments(absent));
        }

        let thread_ts = required_string(fields, "thread_ts")?;
        let message = string_field(fields, "message").unwrap_or_default();
        let thread_history = match fields.get("thread_history") {
            Some(history) if !history.is_null() => {
                serde_json::from_value::<Vec<ThreadMessage>>(history.clone()).map_err(|error| {
                    DomainError::InvalidRequest(format!("'thread_history' is malformed: {error}"))
                })?
            }
            _ => vec![ThreadMessage::new("user", message.clone())],
        };
        let message_idx = fields
            .get("message_idx")
            .and_then(Value::as_u64)
            .and_then(|index| usize::try_from(index).ok())
            .unwrap_or(0);
        let message = if message.is_empty() {
            thread_history.get(message_idx).map(|entry| entry.message.clone()).unwrap_or_default()
        } else {
            message
        };

        Ok(Self {
            channel: required_string(fields, "channel")?,
            channel_id: string_field(fields, "channel_id"),
            ts: string_field(fields, "ts").unwrap_or_else(|| thread_ts.clone()),
            thread_ts,
            thread_history,
            message_idx,
            message,
        })
    }

    pub fn reply_channel(&self) -> &str {
        self.channel_id.as_deref().unwrap_or(&self.channel)
    }
}

/// Arguments forwarded verbatim to `chat.postMessage`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostMessageArgs {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub text: String,
}

/// Outbound message handed to the sender.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub source: SubAgent,
    #[serde(default = "default_comm_channel")]
    pub comm_channel: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub human_message: Option<String>,
    #[serde(default)]
    pub ai_message: Option<String>,
    pub args: PostMessageArgs,
}

fn default_comm_channel() -> String {
    "slack".to_string()
}

impl SendRequest {
    pub fn reply(
        source: SubAgent,
        channel: &str,
        thread_ts: &str,
        human_message: &str,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            source,
            comm_channel: default_comm_channel(),
            channel: Some(channel.to_string()),
            thread_ts: Some(thread_ts.to_string()),
            human_message: Some(human_message.to_string()),
            ai_message: Some(text.clone()),
            args: PostMessageArgs {
                channel: channel.to_string(),
                thread_ts: Some(thread_ts.to_string()),
                text,
            },
        }
    }

    pub fn from_value(payload: &Value) -> Result<Self, DomainError> {
        let body = unwrap_body(payload)?;
        let fields = object(&body)?;
        match fields.get("source").and_then(Value::as_str) {
            Some(source) if source.parse::<SubAgent>().is_ok() => {}
            Some(source) => {
                return Err(DomainError::InvalidRequest(format!("Unknown event source: {source}")))
            }
            None => return Err(DomainError::MissingArguments(vec!["source".to_string()])),
        }

        serde_json::from_value(body.clone())
            .map_err(|error| DomainError::InvalidRequest(format!("malformed send request: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ArchitectureRequest, EvaluationRequest, QaRequest, SendRequest};
    use crate::domain::agent::SubAgent;
    use crate::errors::DomainError;

    #[test]
    fn architecture_request_lists_missing_arguments_in_order() {
        let error = ArchitectureRequest::from_value(&json!({"channel": "infra"}))
            .expect_err("should fail");
        assert_eq!(error.to_string(), "missing required arguments: message, thread_ts");
    }

    #[test]
    fn architecture_request_rejects_non_string_message() {
        let error = ArchitectureRequest::from_value(&json!({
            "message": {"text": "hi"}, "thread_ts": "1.1", "channel": "infra"
        }))
        .expect_err("should fail");
        assert_eq!(error, DomainError::InvalidRequest("'message' must be a string.".to_string()));
    }

    #[test]
    fn architecture_request_accepts_string_body_envelope() {
        let request = ArchitectureRequest::from_value(&json!({
            "body": "{\"message\":\"list buckets\",\"thread_ts\":\"1.1\",\"channel\":\"infra\",\"channel_id\":\"C1\"}"
        }))
        .expect("parse");
        assert_eq!(request.thread_id(), "1.1");
        assert_eq!(request.reply_channel(), "C1");
    }

    #[test]
    fn qa_request_defaults_history_index_and_ts() {
        let request = QaRequest::from_value(&json!({
            "channel": "dev", "thread_ts": "100.1", "message": "how do I deploy a lambda?"
        }))
        .expect("parse");

        assert_eq!(request.thread_history.len(), 1);
        assert_eq!(request.message_idx, 0);
        assert_eq!(request.ts, "100.1");
        assert_eq!(request.reply_channel(), "dev");
    }

    #[test]
    fn qa_request_requires_history_or_message() {
        let error =
            QaRequest::from_value(&json!({"channel": "dev", "thread_ts": "1"})).expect_err("fail");
        assert!(matches!(error, DomainError::MissingArguments(ref names) if names == &vec!["thread_history|message".to_string()]));
    }

    #[test]
    fn evaluation_request_defaults_thread_ts() {
        let request = EvaluationRequest::from_value(&json!({
            "bot_tag": "<@U1>", "channel": "C1", "ts": "5.5", "user": "U2", "text": "hello"
        }))
        .expect("parse");
        assert_eq!(request.thread_ts, "5.5");
        assert_eq!(request.message_id(), "C1_5.5");

        let error = EvaluationRequest::from_value(&json!({"channel": "C1"})).expect_err("fail");
        assert!(matches!(error, DomainError::MissingArguments(ref names) if names.len() == 3));
    }

    #[test]
    fn send_request_validates_source() {
        let ok = SendRequest::from_value(&json!({
            "body": {"source": "QAAgent", "args": {"channel": "C1", "thread_ts": "1.1", "text": "**hi**"}}
        }))
        .expect("parse");
        assert_eq!(ok.source, SubAgent::Qa);
        assert_eq!(ok.comm_channel, "slack");

        let error = SendRequest::from_value(&json!({"source": "Other", "args": {"channel": "C", "text": "x"}}))
            .expect_err("fail");
        assert_eq!(error, DomainError::InvalidRequest("Unknown event source: Other".to_string()));
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::JsonSchema;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use tars_core::config::{LlmConfig, LlmProvider};
use tars_core::domain::models::{parse_json_object, schema_properties};
use tars_core::{ChatMessage, ToolCall};

use crate::tools::ToolSpec;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_MAX: Duration = Duration::from_secs(8);

pub const JSON_PREFILL: &str = "{";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModelTier {
    #[default]
    Primary,
    Fast,
}

#[derive(Clone, Debug, Default)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// Text the assistant turn is forced to start with.
    pub prefill: Option<String>,
    pub tier: ModelTier,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages, ..Self::default() }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_prefill(mut self, prefill: impl Into<String>) -> Self {
        self.prefill = Some(prefill.into());
        self
    }

    pub fn fast(mut self) -> Self {
        self.tier = ModelTier::Fast;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("llm returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response could not be decoded: {0}")]
    Decode(String),
    #[error("structured output did not parse: {0}")]
    StructuredOutput(String),
    #[error("llm provider is not configured: {0}")]
    NotConfigured(String),
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Asks for a JSON object matching `T` and parses the reply.
///
/// The prompt gets a trailing strict-output block listing the schema
/// properties, and the assistant turn is prefilled with `{`.
pub async fn complete_structured<T>(
    client: &dyn LlmClient,
    mut request: LlmRequest,
) -> Result<T, LlmError>
where
    T: JsonSchema + DeserializeOwned,
{
    request.messages.push(ChatMessage::system(strict_output_block(&schema_properties::<T>())));
    request.prefill = Some(JSON_PREFILL.to_string());
    let response = client.complete(request).await?;
    parse_json_object::<T>(&response.content)
        .map_err(|error| LlmError::StructuredOutput(format!("{error}: {}", response.content)))
}

pub fn strict_output_block(properties: &Value) -> String {
    let schema = serde_json::to_string_pretty(properties).unwrap_or_else(|_| properties.to_string());
    format!(
        "Respond ONLY with a single JSON object. Do not add any text before or after it.\n\
         The object must use exactly these properties:\n{schema}"
    )
}

pub fn build_llm_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    let api_key = config.api_key.as_ref().map(|key| key.expose_secret().to_string());

    let client: Arc<dyn LlmClient> = match config.provider {
        LlmProvider::Anthropic => {
            let api_key = api_key.ok_or_else(|| {
                LlmError::NotConfigured("llm.api_key is required for anthropic".to_string())
            })?;
            Arc::new(AnthropicClient {
                http,
                base_url: config.base_url.clone().unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
                api_key,
                models: ModelSettings::from_config(config),
            })
        }
        LlmProvider::OpenAi => {
            let api_key = api_key.ok_or_else(|| {
                LlmError::NotConfigured("llm.api_key is required for openai".to_string())
            })?;
            Arc::new(OpenAiCompatibleClient {
                http,
                base_url: config.base_url.clone().unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
                api_key: Some(api_key),
                models: ModelSettings::from_config(config),
            })
        }
        LlmProvider::Ollama => Arc::new(OpenAiCompatibleClient {
            http,
            base_url: config.base_url.clone().unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            api_key,
            models: ModelSettings::from_config(config),
        }),
    };
    Ok(client)
}

#[derive(Clone, Debug)]
struct ModelSettings {
    model: String,
    fast_model: String,
    max_tokens: u32,
    temperature: f32,
    max_retries: u32,
}

impl ModelSettings {
    fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            fast_model: config.fast_model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            max_retries: config.max_retries,
        }
    }

    fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Primary => &self.model,
            ModelTier::Fast => &self.fast_model,
        }
    }
}

fn retryable(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

fn backoff(attempt: u32) -> Duration {
    RETRY_BASE.saturating_mul(2u32.saturating_pow(attempt)).min(RETRY_MAX)
}

async fn post_with_retries(
    request: impl Fn() -> reqwest::RequestBuilder,
    max_retries: u32,
) -> Result<Value, LlmError> {
    let mut attempt = 0;
    loop {
        match request().send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if response.status().is_success() {
                    return response.json::<Value>().await.map_err(|error| LlmError::Decode(error.to_string()));
                }
                let body = response.text().await.unwrap_or_default();
                if attempt < max_retries && retryable(status) {
                    let delay = backoff(attempt);
                    warn!(event_name = "llm.retry", status, attempt, delay_ms = delay.as_millis() as u64, "retrying llm request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(LlmError::Status { status, body });
            }
            Err(error) if attempt < max_retries && (error.is_timeout() || error.is_connect()) => {
                let delay = backoff(attempt);
                warn!(event_name = "llm.retry", error = %error, attempt, "retrying llm request");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(LlmError::Transport(error)),
        }
    }
}

/// Anthropic Messages API.
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    models: ModelSettings,
}

impl AnthropicClient {
    fn body(&self, request: &LlmRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(self.models.model_for(request.tier)));
        body.insert("max_tokens".into(), json!(request.max_tokens.unwrap_or(self.models.max_tokens)));
        body.insert(
            "temperature".into(),
            json!(request.temperature.unwrap_or(self.models.temperature)),
        );
        let system = collect_system(&request.messages);
        if !system.is_empty() {
            body.insert("system".into(), json!(system));
        }
        let mut messages = to_anthropic_messages(&request.messages);
        if let Some(prefill) = &request.prefill {
            messages.push(json!({"role": "assistant", "content": prefill}));
        }
        body.insert("messages".into(), Value::Array(messages));
        if !request.tools.is_empty() {
            let tools = request
                .tools
                .iter()
                .map(|tool| {
                    json!({
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.input_schema,
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(tools));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = self.body(&request);
        debug!(event_name = "llm.request", provider = "anthropic", model = self.models.model_for(request.tier));
        let payload = post_with_retries(
            || {
                self.http
                    .post(&url)
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION)
                    .json(&body)
            },
            self.models.max_retries,
        )
        .await?;
        parse_anthropic_response(&payload)
    }
}

fn collect_system(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter_map(|message| match message {
            ChatMessage::System { content } if !content.trim().is_empty() => Some(content.trim()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out = Vec::new();
    for message in messages {
        match message {
            ChatMessage::System { .. } => {}
            ChatMessage::Human { content } => {
                out.push(json!({"role": "user", "content": [{"type": "text", "text": content}]}));
            }
            ChatMessage::Ai { content, tool_calls } => {
                let mut blocks = Vec::new();
                if !content.is_empty() {
                    blocks.push(json!({"type": "text", "text": content}));
                }
                for call in tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.name,
                        "input": call.args,
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({"type": "text", "text": ""}));
                }
                out.push(json!({"role": "assistant", "content": blocks}));
            }
            ChatMessage::Tool { content, tool_call_id } => {
                out.push(json!({
                    "role": "user",
                    "content": [{"type": "tool_result", "tool_use_id": tool_call_id, "content": content}],
                }));
            }
        }
    }
    out
}

fn parse_anthropic_response(payload: &Value) -> Result<LlmResponse, LlmError> {
    let blocks = payload
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Decode("response missing content".to_string()))?;
    let mut text = Vec::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(part) = block.get("text").and_then(Value::as_str) {
                    text.push(part.to_string());
                }
            }
            Some("tool_use") => tool_calls.push(ToolCall::new(
                block.get("id").and_then(Value::as_str).unwrap_or_default(),
                block.get("name").and_then(Value::as_str).unwrap_or_default(),
                block.get("input").cloned().unwrap_or_else(|| json!({})),
            )),
            _ => {}
        }
    }
    Ok(LlmResponse { content: text.join("\n"), tool_calls })
}

/// `/chat/completions` dialect spoken by OpenAI and Ollama.
///
/// The prefill is sent as a trailing assistant turn; providers that ignore
/// it still reply with a JSON object the structured parser accepts.
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    models: ModelSettings,
}

impl OpenAiCompatibleClient {
    fn body(&self, request: &LlmRequest) -> Value {
        let mut messages = to_openai_messages(&request.messages);
        if let Some(prefill) = &request.prefill {
            messages.push(json!({"role": "assistant", "content": prefill}));
        }
        let mut body = json!({
            "model": self.models.model_for(request.tier),
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(self.models.max_tokens),
            "temperature": request.temperature.unwrap_or(self.models.temperature),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.input_schema,
                            },
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = self.body(&request);
        debug!(event_name = "llm.request", provider = "openai_compatible", model = self.models.model_for(request.tier));
        let payload = post_with_retries(
            || {
                let builder = self.http.post(&url).json(&body);
                match &self.api_key {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            },
            self.models.max_retries,
        )
        .await?;
        parse_openai_response(&payload)
    }
}

fn to_openai_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| match message {
            ChatMessage::System { content } => json!({"role": "system", "content": content}),
            ChatMessage::Human { content } => json!({"role": "user", "content": content}),
            ChatMessage::Ai { content, tool_calls } if tool_calls.is_empty() => {
                json!({"role": "assistant", "content": content})
            }
            ChatMessage::Ai { content, tool_calls } => json!({
                "role": "assistant",
                "content": content,
                "tool_calls": tool_calls
                    .iter()
                    .map(|call| json!({
                        "id": call.id,
                        "type": "function",
                        "function": {"name": call.name, "arguments": call.args.to_string()},
                    }))
                    .collect::<Vec<_>>(),
            }),
            ChatMessage::Tool { content, tool_call_id } => {
                json!({"role": "tool", "tool_call_id": tool_call_id, "content": content})
            }
        })
        .collect()
}

fn parse_openai_response(payload: &Value) -> Result<LlmResponse, LlmError> {
    let message = payload
        .pointer("/choices/0/message")
        .ok_or_else(|| LlmError::Decode("response missing choices[0].message".to_string()))?;
    let content = message.get("content").and_then(Value::as_str).unwrap_or_default().to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .map(|call| {
                    let arguments = call.pointer("/function/arguments");
                    let args = match arguments {
                        Some(Value::String(raw)) => {
                            serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
                        }
                        Some(other) => other.clone(),
                        None => json!({}),
                    };
                    ToolCall::new(
                        call.get("id").and_then(Value::as_str).unwrap_or_default(),
                        call.pointer("/function/name").and_then(Value::as_str).unwrap_or_default(),
                        args,
                    )
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(LlmResponse { content, tool_calls })
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{LlmClient, LlmError, LlmRequest, LlmResponse};

    /// Replays canned responses in order and records every request.
    #[derive(Default)]
    pub struct ScriptedLlm {
        responses: Mutex<VecDeque<LlmResponse>>,
        requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedLlm {
        pub fn new(responses: impl IntoIterator<Item = LlmResponse>) -> Self {
            Self { responses: Mutex::new(responses.into_iter().collect()), requests: Mutex::default() }
        }

        pub fn text(replies: &[&str]) -> Self {
            Self::new(replies.iter().map(|reply| LlmResponse { content: reply.to_string(), tool_calls: Vec::new() }))
        }

        pub fn requests(&self) -> Vec<LlmRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
            self.requests.lock().expect("requests lock").push(request);
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .ok_or_else(|| LlmError::Decode("script exhausted".to_string()))
        }
    }
}

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use tars_core::domain::requests::EvaluationRequest;
use tars_core::domain::thread::bot_tag;

/// Top-level Events API request body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventsApiPayload {
    UrlVerification { challenge: String },
    EventCallback(SlackEnvelope),
    Unsupported { payload_type: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlackEnvelope {
    pub envelope_id: String,
    pub event: SlackEvent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlackEvent {
    Message(MessageEvent),
    Unsupported { event_type: String },
}

impl SlackEvent {
    pub fn event_type(&self) -> SlackEventType {
        match self {
            Self::Message(_) => SlackEventType::Message,
            Self::Unsupported { .. } => SlackEventType::Unsupported,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlackEventType {
    Message,
    Unsupported,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct MessageEvent {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub ts: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("event payload is not valid JSON: {0}")]
    Json(String),
    #[error("event payload is missing `{0}`")]
    MissingField(&'static str),
}

pub fn parse_payload(body: &[u8]) -> Result<EventsApiPayload, EventParseError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|error| EventParseError::Json(error.to_string()))?;
    let payload_type = payload.get("type").and_then(Value::as_str).unwrap_or_default();

    match payload_type {
        "url_verification" => {
            let challenge = payload
                .get("challenge")
                .and_then(Value::as_str)
                .ok_or(EventParseError::MissingField("challenge"))?;
            Ok(EventsApiPayload::UrlVerification { challenge: challenge.to_string() })
        }
        "event_callback" => {
            let event = payload.get("event").ok_or(EventParseError::MissingField("event"))?;
            let envelope_id =
                payload.get("event_id").and_then(Value::as_str).unwrap_or("unknown-event").to_string();
            Ok(EventsApiPayload::EventCallback(SlackEnvelope { envelope_id, event: parse_event(event)? }))
        }
        other => Ok(EventsApiPayload::Unsupported { payload_type: other.to_string() }),
    }
}

fn parse_event(event: &Value) -> Result<SlackEvent, EventParseError> {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    if event_type != "message" {
        return Ok(SlackEvent::Unsupported { event_type: event_type.to_string() });
    }
    serde_json::from_value(event.clone())
        .map(SlackEvent::Message)
        .map_err(|error| EventParseError::Json(error.to_string()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    Subtype(String),
    BotAuthored,
    MissingAuthor,
}

/// What the listener does with an incoming message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressDecision {
    /// The bot was tagged: cancel any deferred copy and evaluate right away.
    EvaluateNow(EvaluationRequest),
    /// Not tagged: (re)schedule an evaluation after the configured delay.
    Defer(EvaluationRequest),
    Ignore(IgnoreReason),
}

pub fn classify_message(event: &MessageEvent, bot_user_id: &str) -> IngressDecision {
    if let Some(subtype) = &event.subtype {
        return IngressDecision::Ignore(IgnoreReason::Subtype(subtype.clone()));
    }
    if event.bot_id.is_some() || event.user.as_deref() == Some(bot_user_id) {
        return IngressDecision::Ignore(IgnoreReason::BotAuthored);
    }
    let Some(user) = event.user.clone().filter(|user| !user.is_empty()) else {
        return IngressDecision::Ignore(IgnoreReason::MissingAuthor);
    };

    let tag = bot_tag(bot_user_id);
    let text = event.text.clone().unwrap_or_default();
    let request = EvaluationRequest {
        bot_tag: tag.clone(),
        channel: event.channel.clone(),
        ts: event.ts.clone(),
        thread_ts: event.thread_ts.clone().unwrap_or_else(|| event.ts.clone()),
        user,
        text,
    };

    if request.text.contains(&tag) {
        IngressDecision::EvaluateNow(request)
    } else {
        IngressDecision::Defer(request)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: String,
}

impl Default for EventContext {
    fn default() -> Self {
        Self { correlation_id: "unknown-correlation-id".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerResult {
    Evaluating { message_id: String },
    Deferred { message_id: String },
    Ignored,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventHandlerError {
    #[error("ingress service failure: {0}")]
    Ingress(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error(transparent)]
    Handler(#[from] EventHandlerError),
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn event_type(&self) -> SlackEventType;
    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError>;
}

#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<SlackEventType, Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H>(&mut self, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(handler.event_type(), Arc::new(handler));
    }

    pub async fn dispatch(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, DispatchError> {
        let Some(handler) = self.handlers.get(&envelope.event.event_type()) else {
            return Ok(HandlerResult::Ignored);
        };

        handler.handle(envelope, ctx).await.map_err(DispatchError::from)
    }
}

/// Side effects of an ingress decision, provided by the hosting service.
#[async_trait]
pub trait IngressService: Send + Sync {
    async fn evaluate_now(
        &self,
        request: EvaluationRequest,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError>;

    async fn defer(
        &self,
        request: EvaluationRequest,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError>;
}

#[async_trait]
impl<T> IngressService for Arc<T>
where
    T: IngressService + ?Sized,
{
    async fn evaluate_now(
        &self,
        request: EvaluationRequest,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        (**self).evaluate_now(request, ctx).await
    }

    async fn defer(
        &self,
        request: EvaluationRequest,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        (**self).defer(request, ctx).await
    }
}

pub struct MessageEventHandler<S> {
    bot_user_id: String,
    service: S,
}

impl<S> MessageEventHandler<S>
where
    S: IngressService,
{
    pub fn new(bot_user_id: impl Into<String>, service: S) -> Self {
        Self { bot_user_id: bot_user_id.into(), service }
    }
}

#[async_trait]
impl<S> EventHandler for MessageEventHandler<S>
where
    S: IngressService + 'static,
{
    fn event_type(&self) -> SlackEventType {
        SlackEventType::Message
    }

    async fn handle(
        &self,
        envelope: &SlackEnvelope,
        ctx: &EventContext,
    ) -> Result<HandlerResult, EventHandlerError> {
        let SlackEvent::Message(event) = &envelope.event else {
            return Ok(HandlerResult::Ignored);
        };

        match classify_message(event, &self.bot_user_id) {
            IngressDecision::EvaluateNow(request) => {
                let message_id = request.message_id();
                self.service.evaluate_now(request, ctx).await?;
                Ok(HandlerResult::Evaluating { message_id })
            }
            IngressDecision::Defer(request) => {
                let message_id = request.message_id();
                self.service.defer(request, ctx).await?;
                Ok(HandlerResult::Deferred { message_id })
            }
            IngressDecision::Ignore(reason) => {
                tracing::debug!(
                    event_name = "slack.ingress.ignored",
                    correlation_id = %ctx.correlation_id,
                    channel = %event.channel,
                    reason = ?reason,
                    "message ignored"
                );
                Ok(HandlerResult::Ignored)
            }
        }
    }
}

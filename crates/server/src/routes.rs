use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use tars_core::domain::requests::{ArchitectureRequest, EvaluationRequest, QaRequest, SendRequest};
use tars_core::{ApplicationError, DomainError, InterfaceError};
use tars_slack::events::{parse_payload, EventContext, EventDispatcher, EventsApiPayload, HandlerResult};
use tars_slack::SignatureVerifier;

use crate::health::{self, HealthState};
use crate::services::AppServices;

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const RETRY_HEADER: &str = "x-slack-retry-num";
pub(crate) const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<AppServices>,
    pub events: Arc<EventDispatcher>,
    pub verifier: Arc<SignatureVerifier>,
}

pub fn router(state: AppState, health: HealthState) -> Router {
    Router::new()
        .route("/slack/events", post(slack_events))
        .route("/evaluate", post(evaluate))
        .route("/agents/architecture", post(architecture))
        .route("/agents/qa", post(qa))
        .route("/send", post(send))
        .with_state(state)
        .merge(health::router(health))
        .layer(TraceLayer::new_for_http())
}

/// `InterfaceError` rendered as `{error, correlation_id}`.
pub struct ApiError(pub InterfaceError);

impl From<InterfaceError> for ApiError {
    fn from(error: InterfaceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, message.clone()),
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, self.0.user_message().to_string())
            }
            InterfaceError::Internal { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.0.user_message().to_string())
            }
        };
        (status, Json(json!({"error": message, "correlation_id": self.0.correlation_id()})))
            .into_response()
    }
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()))
}

fn parse_body(body: &Bytes, correlation_id: &str) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|_| {
        ApiError(
            ApplicationError::Domain(DomainError::InvalidRequest(
                "Invalid JSON in request body".to_string(),
            ))
            .into_interface(correlation_id),
        )
    })
}

fn bad_request(error: DomainError, correlation_id: &str) -> ApiError {
    ApiError(ApplicationError::Domain(error).into_interface(correlation_id))
}

async fn slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());

    if let Err(error) = state.verifier.verify(
        header(TIMESTAMP_HEADER),
        header(SIGNATURE_HEADER),
        &body,
        Utc::now().timestamp(),
    ) {
        warn!(
            event_name = "ingress.signature_rejected",
            correlation_id = %correlation_id,
            error = %error,
            "slack request signature rejected"
        );
        return Ok((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": error.to_string(), "correlation_id": correlation_id})),
        )
            .into_response());
    }

    let payload = parse_payload(&body)
        .map_err(|error| bad_request(DomainError::InvalidRequest(error.to_string()), &correlation_id))?;

    let envelope = match payload {
        EventsApiPayload::UrlVerification { challenge } => {
            return Ok(Json(json!({"challenge": challenge})).into_response());
        }
        EventsApiPayload::Unsupported { payload_type } => {
            info!(
                event_name = "ingress.unsupported_payload",
                correlation_id = %correlation_id,
                payload_type = %payload_type,
            );
            return Ok(StatusCode::OK.into_response());
        }
        EventsApiPayload::EventCallback(envelope) => envelope,
    };

    if let Some(retry) = header(RETRY_HEADER) {
        info!(
            event_name = "ingress.retry_ignored",
            correlation_id = %correlation_id,
            event_id = %envelope.envelope_id,
            retry_num = retry,
            "slack retry acknowledged without processing"
        );
        return Ok((StatusCode::OK, "ok").into_response());
    }

    let ctx = EventContext { correlation_id: correlation_id.clone() };
    let result = state.events.dispatch(&envelope, &ctx).await.map_err(|error| {
        ApiError(ApplicationError::Integration(error.to_string()).into_interface(&correlation_id))
    })?;

    let (outcome, message_id) = match result {
        HandlerResult::Evaluating { message_id } => ("evaluating", Some(message_id)),
        HandlerResult::Deferred { message_id } => ("deferred", Some(message_id)),
        HandlerResult::Ignored => ("ignored", None),
    };
    Ok(Json(json!({"ok": true, "outcome": outcome, "message_id": message_id})).into_response())
}

async fn evaluate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let payload = parse_body(&body, &correlation_id)?;
    let request = EvaluationRequest::from_value(&payload)
        .map_err(|error| bad_request(error, &correlation_id))?;

    let outcome = state.services.evaluate(&request, &correlation_id).await?;
    Ok((StatusCode::OK, outcome.status_text()).into_response())
}

async fn architecture(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let payload = parse_body(&body, &correlation_id)?;
    let request = ArchitectureRequest::from_value(&payload)
        .map_err(|error| bad_request(error, &correlation_id))?;

    let reply = state.services.architecture(&request, &correlation_id).await?;
    Ok(Json(json!({
        "response": reply.content,
        "finished": reply.is_finished(),
        "interrupt": reply.interrupt,
    }))
    .into_response())
}

async fn qa(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let payload = parse_body(&body, &correlation_id)?;
    let request =
        QaRequest::from_value(&payload).map_err(|error| bad_request(error, &correlation_id))?;

    let reply = state.services.qa(&request, &correlation_id).await?;
    Ok(Json(reply).into_response())
}

async fn send(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let correlation_id = correlation_id(&headers);
    let payload = parse_body(&body, &correlation_id)?;
    let request =
        SendRequest::from_value(&payload).map_err(|error| bad_request(error, &correlation_id))?;

    let posted = state.services.send(&request, &correlation_id).await?;
    Ok(Json(json!({"ok": true, "channel": posted.channel, "ts": posted.ts})).into_response())
}

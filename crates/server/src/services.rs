//! Operations behind the HTTP routes, the dispatch worker and the queue worker.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{error, info, warn};

use tars_agent::graph::GraphError;
use tars_agent::{
    AgentRuntime, ArchitectureError, ArchitectureReply, EvaluationError, EvaluationOutcome,
    QaError, QaReply,
};
use tars_core::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use tars_core::domain::requests::{
    AgentInvocation, ArchitectureRequest, EvaluationRequest, QaRequest, SendRequest,
};
use tars_core::{ApplicationError, DomainError, InterfaceError, PendingEvaluation, SubAgent};
use tars_db::repositories::EvaluationQueueRepository;
use tars_slack::api::PostedMessage;
use tars_slack::events::{EventContext, EventHandlerError, IngressService};
use tars_slack::{markdown_to_mrkdwn, SlackApi};

use crate::dispatch::{DispatchJob, Dispatcher};

pub struct AppServices {
    runtime: AgentRuntime,
    slack: Arc<dyn SlackApi>,
    queue: Arc<dyn EvaluationQueueRepository>,
    dispatcher: Arc<Dispatcher>,
    audit: Arc<dyn AuditSink>,
    evaluation_delay: Duration,
}

impl AppServices {
    pub fn new(
        runtime: AgentRuntime,
        slack: Arc<dyn SlackApi>,
        queue: Arc<dyn EvaluationQueueRepository>,
        dispatcher: Arc<Dispatcher>,
        audit: Arc<dyn AuditSink>,
        evaluation_delay_secs: u64,
    ) -> Self {
        let evaluation_delay =
            Duration::seconds(i64::try_from(evaluation_delay_secs).unwrap_or(i64::MAX / 1000));
        Self { runtime, slack, queue, dispatcher, audit, evaluation_delay }
    }

    pub fn queue(&self) -> Arc<dyn EvaluationQueueRepository> {
        self.queue.clone()
    }

    pub async fn evaluate(
        &self,
        request: &EvaluationRequest,
        correlation_id: &str,
    ) -> Result<EvaluationOutcome, InterfaceError> {
        self.runtime.evaluator.evaluate(request, correlation_id).await.map_err(|error| {
            let mapped = match &error {
                EvaluationError::Slack(_) | EvaluationError::Llm(_) | EvaluationError::Dispatch(_) => {
                    ApplicationError::Integration(error.to_string())
                }
                EvaluationError::Repository(_) => ApplicationError::Persistence(error.to_string()),
                EvaluationError::Prompt(_) => ApplicationError::Configuration(error.to_string()),
            };
            log_failure("evaluation.failed", correlation_id, &request.thread_ts, &request.channel, &error);
            mapped.into_interface(correlation_id)
        })
    }

    pub async fn architecture(
        &self,
        request: &ArchitectureRequest,
        correlation_id: &str,
    ) -> Result<ArchitectureReply, InterfaceError> {
        self.runtime.architecture.handle(request, correlation_id).await.map_err(|error| {
            let mapped = match &error {
                ArchitectureError::Graph(GraphError::Llm(_)) | ArchitectureError::ApprovalParse(_) => {
                    ApplicationError::Integration(error.to_string())
                }
                ArchitectureError::Graph(GraphError::Repository(_))
                | ArchitectureError::Repository(_) => ApplicationError::Persistence(error.to_string()),
                ArchitectureError::Graph(_) | ArchitectureError::Prompt(_) => {
                    ApplicationError::Domain(DomainError::InvariantViolation(error.to_string()))
                }
            };
            log_failure(
                "architecture.failed",
                correlation_id,
                request.thread_id(),
                &request.channel,
                &error,
            );
            into_server_error(mapped, correlation_id)
        })
    }

    pub async fn qa(&self, request: &QaRequest, correlation_id: &str) -> Result<QaReply, InterfaceError> {
        self.runtime.qa.handle(request, correlation_id).await.map_err(|error| {
            let mapped = match &error {
                QaError::Llm(_) => ApplicationError::Integration(error.to_string()),
                QaError::Repository(_) => ApplicationError::Persistence(error.to_string()),
                QaError::Prompt(_) | QaError::Directory { .. } => {
                    ApplicationError::Configuration(error.to_string())
                }
                QaError::RecursionLimit(_) => {
                    ApplicationError::Domain(DomainError::InvariantViolation(error.to_string()))
                }
            };
            log_failure("qa.failed", correlation_id, &request.thread_ts, &request.channel, &error);
            into_server_error(mapped, correlation_id)
        })
    }

    /// Converts the answer to Slack mrkdwn and posts it into the thread.
    pub async fn send(
        &self,
        request: &SendRequest,
        correlation_id: &str,
    ) -> Result<PostedMessage, InterfaceError> {
        let mut args = request.args.clone();
        args.text = markdown_to_mrkdwn(&args.text);
        let audit = AuditContext::new(
            args.thread_ts.clone(),
            Some(args.channel.clone()),
            correlation_id,
            request.source.as_str(),
        );

        match self.slack.post_message(&args).await {
            Ok(posted) => {
                info!(
                    event_name = "dispatch.sent",
                    correlation_id,
                    thread_id = args.thread_ts.as_deref().unwrap_or("unknown"),
                    channel = %args.channel,
                    source = %request.source,
                    "reply posted to slack"
                );
                self.audit.emit(
                    AuditEvent::new(&audit, "dispatch.sent", AuditCategory::Dispatch, AuditOutcome::Success)
                        .with_metadata("ts", posted.ts.clone()),
                );
                Ok(posted)
            }
            Err(error) => {
                self.audit.emit(
                    AuditEvent::new(&audit, "dispatch.sent", AuditCategory::Dispatch, AuditOutcome::Failed)
                        .with_metadata("error", error.to_string()),
                );
                Err(ApplicationError::Integration(error.to_string()).into_interface(correlation_id))
            }
        }
    }

    /// Runs an in-process dispatch job. Failures are logged; there is no caller
    /// left to report them to.
    pub async fn run_job(&self, job: DispatchJob) {
        let target = job.target();
        let result = match job {
            DispatchJob::Evaluate { request, correlation_id } => {
                self.evaluate(&request, &correlation_id).await.map(|_| ())
            }
            DispatchJob::Invoke { agent, invocation, correlation_id } => {
                self.invoke(agent, &invocation, &correlation_id).await
            }
            DispatchJob::Send { request, correlation_id } => {
                self.send(&request, &correlation_id).await.map(|_| ())
            }
        };
        if let Err(error) = result {
            warn!(
                event_name = "dispatch.job.failed",
                correlation_id = %error.correlation_id(),
                target,
                error = %error,
                "dispatch job failed"
            );
        }
    }

    async fn invoke(
        &self,
        agent: SubAgent,
        invocation: &AgentInvocation,
        correlation_id: &str,
    ) -> Result<(), InterfaceError> {
        let payload: Value = serde_json::to_value(invocation).map_err(|error| {
            ApplicationError::Domain(DomainError::InvalidRequest(error.to_string()))
                .into_interface(correlation_id)
        })?;
        let bad_request =
            |error: DomainError| ApplicationError::Domain(error).into_interface(correlation_id);

        match agent {
            SubAgent::Architecture => {
                let request = ArchitectureRequest::from_value(&payload).map_err(bad_request)?;
                self.architecture(&request, correlation_id).await.map(|_| ())
            }
            SubAgent::Qa => {
                let request = QaRequest::from_value(&payload).map_err(bad_request)?;
                self.qa(&request, correlation_id).await.map(|_| ())
            }
        }
    }
}

#[async_trait]
impl IngressService for AppServices {
    async fn evaluate_now(
        &self,
        request: EvaluationRequest,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        let message_id = request.message_id();
        let cancelled = self
            .queue
            .cancel(&message_id)
            .await
            .map_err(|error| EventHandlerError::Ingress(error.to_string()))?;
        info!(
            event_name = "ingress.evaluate_now",
            correlation_id = %ctx.correlation_id,
            thread_id = %request.thread_ts,
            channel = %request.channel,
            message_id = %message_id,
            cancelled_pending = cancelled,
            "bot mentioned, evaluating immediately"
        );
        self.dispatcher
            .evaluate(request, &ctx.correlation_id)
            .await
            .map_err(|error| EventHandlerError::Ingress(error.to_string()))
    }

    async fn defer(
        &self,
        request: EvaluationRequest,
        ctx: &EventContext,
    ) -> Result<(), EventHandlerError> {
        let now = Utc::now();
        let entry = PendingEvaluation::new(request, now + self.evaluation_delay, now);
        self.queue
            .enqueue(&entry)
            .await
            .map_err(|error| EventHandlerError::Ingress(error.to_string()))?;
        info!(
            event_name = "ingress.deferred",
            correlation_id = %ctx.correlation_id,
            thread_id = %entry.request.thread_ts,
            channel = %entry.channel,
            message_id = %entry.message_id,
            deliver_after = %entry.deliver_after.to_rfc3339(),
            "evaluation scheduled"
        );
        Ok(())
    }
}

fn into_server_error(error: ApplicationError, correlation_id: &str) -> InterfaceError {
    match error {
        ApplicationError::Domain(DomainError::InvariantViolation(message)) => {
            InterfaceError::Internal { message, correlation_id: correlation_id.to_string() }
        }
        other => other.into_interface(correlation_id),
    }
}

fn log_failure(
    event_name: &'static str,
    correlation_id: &str,
    thread_id: &str,
    channel: &str,
    error: &dyn std::error::Error,
) {
    error!(event_name, correlation_id, thread_id, channel, error = %error, "request failed");
}

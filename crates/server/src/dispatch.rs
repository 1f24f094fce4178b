//! Fan-out to the evaluator, the sub-agents and the Slack sender.
//!
//! `in_process` pushes jobs onto a channel drained by [`spawn_worker`], which
//! calls the same services the HTTP routes call. `http` POSTs the JSON bodies
//! to the configured endpoints.

use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tars_agent::{AgentDispatcher, DispatchError};
use tars_core::config::{DispatchConfig, DispatchMode};
use tars_core::domain::requests::{AgentInvocation, EvaluationRequest, SendRequest};
use tars_core::SubAgent;

use crate::routes::CORRELATION_HEADER;
use crate::services::AppServices;

const DOCKER_HOST: &str = "host.docker.internal";

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchJob {
    Evaluate { request: EvaluationRequest, correlation_id: String },
    Invoke { agent: SubAgent, invocation: AgentInvocation, correlation_id: String },
    Send { request: SendRequest, correlation_id: String },
}

impl DispatchJob {
    pub fn target(&self) -> &'static str {
        match self {
            Self::Evaluate { .. } => "evaluator",
            Self::Invoke { agent: SubAgent::Architecture, .. } => "architecture_agent",
            Self::Invoke { agent: SubAgent::Qa, .. } => "qa_agent",
            Self::Send { .. } => "sender",
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Evaluate { correlation_id, .. }
            | Self::Invoke { correlation_id, .. }
            | Self::Send { correlation_id, .. } => correlation_id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct HttpTargets {
    evaluator: Option<String>,
    architecture: Option<String>,
    qa: Option<String>,
    sender: Option<String>,
}

enum Transport {
    InProcess(mpsc::UnboundedSender<DispatchJob>),
    Http { client: reqwest::Client, targets: HttpTargets },
}

pub struct Dispatcher {
    transport: Transport,
}

impl Dispatcher {
    pub fn in_process() -> (Self, mpsc::UnboundedReceiver<DispatchJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { transport: Transport::InProcess(sender) }, receiver)
    }

    pub fn http(config: &DispatchConfig, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| DispatchError::Transport(error.to_string()))?;
        let target = |url: &Option<String>| {
            url.as_deref().map(|url| {
                if config.rewrite_localhost {
                    rewrite_localhost(url)
                } else {
                    url.to_string()
                }
            })
        };
        let targets = HttpTargets {
            evaluator: target(&config.evaluator_url),
            architecture: target(&config.architecture_agent_url),
            qa: target(&config.qa_agent_url),
            sender: target(&config.sender_url),
        };
        Ok(Self { transport: Transport::Http { client, targets } })
    }

    /// Builds the dispatcher for the configured mode. The receiver is only
    /// returned in `in_process` mode.
    pub fn from_config(
        config: &DispatchConfig,
        timeout: Duration,
    ) -> Result<(Self, Option<mpsc::UnboundedReceiver<DispatchJob>>), DispatchError> {
        match config.mode {
            DispatchMode::InProcess => {
                let (dispatcher, receiver) = Self::in_process();
                Ok((dispatcher, Some(receiver)))
            }
            DispatchMode::Http => Ok((Self::http(config, timeout)?, None)),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self.transport {
            Transport::InProcess(_) => "in_process",
            Transport::Http { .. } => "http",
        }
    }

    /// Starts an evaluation without waiting for its result.
    pub async fn evaluate(
        &self,
        request: EvaluationRequest,
        correlation_id: &str,
    ) -> Result<(), DispatchError> {
        self.submit(DispatchJob::Evaluate { request, correlation_id: correlation_id.to_string() }, true)
            .await
    }

    async fn submit(&self, job: DispatchJob, detached: bool) -> Result<(), DispatchError> {
        match &self.transport {
            Transport::InProcess(sender) => {
                debug!(event_name = "dispatch.job.queued", target = job.target(), "job queued");
                sender.send(job).map_err(|_| DispatchError::Closed)
            }
            Transport::Http { client, targets } => {
                let target = job.target();
                let url = match &job {
                    DispatchJob::Evaluate { .. } => targets.evaluator.clone(),
                    DispatchJob::Invoke { agent: SubAgent::Architecture, .. } => {
                        targets.architecture.clone()
                    }
                    DispatchJob::Invoke { agent: SubAgent::Qa, .. } => targets.qa.clone(),
                    DispatchJob::Send { .. } => targets.sender.clone(),
                }
                .ok_or(DispatchError::NotConfigured(target))?;
                let body = job_body(&job)?;
                let correlation_id = job.correlation_id().to_string();

                if !detached {
                    return post_json(client, &url, &body, &correlation_id).await;
                }
                let client = client.clone();
                tokio::spawn(async move {
                    if let Err(error) = post_json(&client, &url, &body, &correlation_id).await {
                        warn!(
                            event_name = "dispatch.http.failed",
                            target,
                            url = %url,
                            correlation_id = %correlation_id,
                            error = %error,
                            "dispatch request failed"
                        );
                    }
                });
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AgentDispatcher for Dispatcher {
    async fn invoke_agent(
        &self,
        agent: SubAgent,
        invocation: AgentInvocation,
        correlation_id: &str,
    ) -> Result<(), DispatchError> {
        let correlation_id = correlation_id.to_string();
        self.submit(DispatchJob::Invoke { agent, invocation, correlation_id }, true).await
    }

    async fn send_reply(&self, request: SendRequest, correlation_id: &str) -> Result<(), DispatchError> {
        let correlation_id = correlation_id.to_string();
        self.submit(DispatchJob::Send { request, correlation_id }, false).await
    }
}

fn job_body(job: &DispatchJob) -> Result<Value, DispatchError> {
    let encode = |error: serde_json::Error| DispatchError::Transport(error.to_string());
    match job {
        DispatchJob::Evaluate { request, .. } => Ok(json!({
            "bot_tag": request.bot_tag,
            "channel": request.channel,
            "ts": request.ts,
            "thread_ts": request.thread_ts,
            "user": request.user,
            "message": request.text,
        })),
        DispatchJob::Invoke { invocation, .. } => serde_json::to_value(invocation).map_err(encode),
        DispatchJob::Send { request, .. } => serde_json::to_value(request).map_err(encode),
    }
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    body: &Value,
    correlation_id: &str,
) -> Result<(), DispatchError> {
    let response = client
        .post(url)
        .header(CORRELATION_HEADER, correlation_id)
        .json(body)
        .send()
        .await
        .map_err(|error| DispatchError::Transport(error.to_string()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(DispatchError::Rejected { status: status.as_u16(), body })
}

/// Points loopback hosts at the Docker host so containers can reach each other.
pub fn rewrite_localhost(url: &str) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.to_string();
    };
    if !matches!(parsed.host_str(), Some("localhost" | "127.0.0.1")) {
        return url.to_string();
    }
    match parsed.set_host(Some(DOCKER_HOST)) {
        Ok(()) => parsed.to_string(),
        Err(_) => url.to_string(),
    }
}

/// Drains in-process jobs. Each job runs on its own task so a long agent run
/// does not hold up other threads.
pub fn spawn_worker(
    mut jobs: mpsc::UnboundedReceiver<DispatchJob>,
    services: Weak<AppServices>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let Some(services) = services.upgrade() else {
                break;
            };
            tokio::spawn(async move { services.run_job(job).await });
        }
        debug!(event_name = "dispatch.worker.stopped", "dispatch worker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tars_core::domain::requests::PostMessageArgs;

    fn evaluation_request() -> EvaluationRequest {
        EvaluationRequest {
            bot_tag: "<@U0TARS>".to_string(),
            channel: "C1".to_string(),
            ts: "1712345678.000200".to_string(),
            thread_ts: "1712345678.000100".to_string(),
            user: "U1".to_string(),
            text: "any update on the bucket?".to_string(),
        }
    }

    #[test]
    fn loopback_urls_are_rewritten_for_docker() {
        assert_eq!(
            rewrite_localhost("http://localhost:8080/evaluate"),
            "http://host.docker.internal:8080/evaluate"
        );
        assert_eq!(
            rewrite_localhost("http://127.0.0.1:9000/send"),
            "http://host.docker.internal:9000/send"
        );
        assert_eq!(rewrite_localhost("https://tars.internal/send"), "https://tars.internal/send");
    }

    #[test]
    fn only_loopback_hosts_are_rewritten() {
        assert_eq!(
            rewrite_localhost("https://svc.example/localhost-hooks"),
            "https://svc.example/localhost-hooks"
        );
        assert_eq!(
            rewrite_localhost("http://localhost.example.com/send"),
            "http://localhost.example.com/send"
        );
        assert_eq!(
            rewrite_localhost("http://svc.example/send?next=http://127.0.0.1/cb"),
            "http://svc.example/send?next=http://127.0.0.1/cb"
        );
        assert_eq!(rewrite_localhost("not a url"), "not a url");
    }

    #[test]
    fn evaluation_body_uses_message_key() {
        let body = job_body(&DispatchJob::Evaluate {
            request: evaluation_request(),
            correlation_id: "c-1".to_string(),
        })
        .expect("body");

        assert_eq!(body["message"], "any update on the bucket?");
        assert_eq!(body["thread_ts"], "1712345678.000100");
        assert!(body.get("text").is_none());
    }

    #[tokio::test]
    async fn in_process_jobs_reach_the_worker_channel() {
        let (dispatcher, mut receiver) = Dispatcher::in_process();

        dispatcher.evaluate(evaluation_request(), "c-1").await.expect("evaluate");
        dispatcher
            .send_reply(SendRequest::reply(SubAgent::Qa, "C1", "1.1", "question", "answer"), "c-2")
            .await
            .expect("send");

        let first = receiver.recv().await.expect("first job");
        assert_eq!(first.target(), "evaluator");
        assert_eq!(first.correlation_id(), "c-1");
        let second = receiver.recv().await.expect("second job");
        assert_eq!(second.correlation_id(), "c-2");
        assert!(matches!(
            second,
            DispatchJob::Send { request, .. } if request.args == PostMessageArgs {
                channel: "C1".to_string(),
                thread_ts: Some("1.1".to_string()),
                text: "answer".to_string(),
            }
        ));
    }

    #[tokio::test]
    async fn closed_worker_is_reported() {
        let (dispatcher, receiver) = Dispatcher::in_process();
        drop(receiver);

        let error = dispatcher.evaluate(evaluation_request(), "c-1").await.expect_err("closed");

        assert!(matches!(error, DispatchError::Closed));
    }

    #[tokio::test]
    async fn http_mode_requires_target_urls() {
        let config = DispatchConfig {
            mode: DispatchMode::Http,
            evaluator_url: None,
            architecture_agent_url: None,
            qa_agent_url: None,
            sender_url: None,
            rewrite_localhost: false,
        };
        let dispatcher = Dispatcher::http(&config, Duration::from_secs(1)).expect("client");

        let error = dispatcher.evaluate(evaluation_request(), "c-1").await.expect_err("missing url");

        assert!(matches!(error, DispatchError::NotConfigured("evaluator")));
    }
}

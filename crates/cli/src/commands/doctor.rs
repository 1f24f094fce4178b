use secrecy::ExposeSecret;
use serde::Serialize;
use tars_core::config::{AppConfig, LoadOptions};
use tars_db::connect_from_config;
use tars_mcp::{resolve_aws_api_server, CommandSource};

use crate::commands::CommandResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Skipped, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

const DEPENDENT_CHECKS: [&str; 4] =
    ["slack_credentials", "database_connectivity", "aws_api_mcp_server", "web_search"];

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.push(check_slack_credentials(&config));
            checks.push(check_database_connectivity(&config));
            checks.push(check_aws_api_server(&config));
            checks.push(check_web_search(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.extend(DEPENDENT_CHECKS.into_iter().map(|name| {
                DoctorCheck::skipped(name, "skipped because configuration did not load")
            }));
        }
    }

    let any_failed = checks.iter().any(|check| check.status == CheckStatus::Fail);
    let overall_status = if any_failed { CheckStatus::Fail } else { CheckStatus::Pass };
    let summary = if any_failed {
        "doctor: one or more readiness checks failed".to_string()
    } else {
        "doctor: all readiness checks passed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_slack_credentials(config: &AppConfig) -> DoctorCheck {
    let identity = match &config.slack.bot_user_id {
        Some(id) => format!("bot user `{id}` configured"),
        None => "bot user resolved through auth.test at startup".to_string(),
    };
    if config.slack.signing_secret.expose_secret().trim().is_empty() {
        return DoctorCheck::fail("slack_credentials", "signing secret is empty");
    }
    DoctorCheck::pass("slack_credentials", format!("bot token and signing secret present; {identity}"))
}

fn check_database_connectivity(config: &AppConfig) -> DoctorCheck {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return DoctorCheck::fail(
                "database_connectivity",
                format!("failed to initialize async runtime: {error}"),
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_from_config(&config.database)
            .await
            .map_err(|error| format!("failed to connect to database: {error}"))?;
        ping_pool(&pool).await?;
        pool.close().await;
        Ok::<(), String>(())
    });

    match result {
        Ok(()) => DoctorCheck::pass(
            "database_connectivity",
            format!("connected using `{}`", config.database.url),
        ),
        Err(error) => DoctorCheck::fail("database_connectivity", error),
    }
}

async fn ping_pool(pool: &tars_db::DbPool) -> Result<(), String> {
    pool.acquire().await.map(drop).map_err(|error| format!("failed to acquire connection: {error}"))
}

fn check_aws_api_server(config: &AppConfig) -> DoctorCheck {
    let resolved = resolve_aws_api_server(&config.mcp);
    let details = match resolved.source {
        CommandSource::Configured => format!("using configured binary `{}`", resolved.command),
        CommandSource::Path => format!("found on PATH: `{}`", resolved.command),
        CommandSource::Uvx => format!("not installed locally, will launch `{}`", resolved.command),
    };
    DoctorCheck::pass("aws_api_mcp_server", details)
}

fn check_web_search(config: &AppConfig) -> DoctorCheck {
    match &config.web_search.api_key {
        Some(_) => DoctorCheck::pass("web_search", format!("enabled against {}", config.web_search.base_url)),
        None => DoctorCheck::skipped("web_search", "no api key; the research agent runs without web search"),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = vec![report.summary.clone()];

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tars_core::config::{AppConfig, LoadOptions};

struct Field {
    key: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

impl Field {
    fn new(key: &'static str, env_keys: &'static [&'static str], value: impl Into<String>) -> Self {
        Self { key, env_keys, value: value.into() }
    }
}

pub fn run() -> crate::commands::CommandResult {
    use crate::commands::CommandResult;

    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let data: Vec<Value> = effective_fields(&config)
        .into_iter()
        .map(|field| {
            json!({
                "key": field.key,
                "value": field.value,
                "source": field_source(
                    field.key,
                    field.env_keys,
                    config_file_doc.as_ref(),
                    config_file_path.as_deref(),
                ),
            })
        })
        .collect();

    CommandResult::success_with_data(
        "config",
        "effective config (source precedence: env > file > default)",
        Value::Array(data),
    )
}

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let optional = |value: Option<&str>| value.unwrap_or("<unset>").to_string();

    vec![
        Field::new("database.url", &["TARS_DATABASE_URL"], &config.database.url),
        Field::new(
            "database.max_connections",
            &["TARS_DATABASE_MAX_CONNECTIONS"],
            config.database.max_connections.to_string(),
        ),
        Field::new("slack.bot_token", &["TARS_SLACK_BOT_TOKEN"], redact_token(&config.slack.bot_token)),
        Field::new(
            "slack.signing_secret",
            &["TARS_SLACK_SIGNING_SECRET"],
            redact_secret(Some(&config.slack.signing_secret)),
        ),
        Field::new(
            "slack.bot_user_id",
            &["TARS_SLACK_BOT_USER_ID"],
            optional(config.slack.bot_user_id.as_deref()),
        ),
        Field::new("llm.provider", &["TARS_LLM_PROVIDER"], format!("{:?}", config.llm.provider)),
        Field::new("llm.model", &["TARS_LLM_MODEL"], &config.llm.model),
        Field::new("llm.fast_model", &["TARS_LLM_FAST_MODEL"], &config.llm.fast_model),
        Field::new("llm.base_url", &["TARS_LLM_BASE_URL"], optional(config.llm.base_url.as_deref())),
        Field::new("llm.api_key", &["TARS_LLM_API_KEY"], redact_secret(config.llm.api_key.as_ref())),
        Field::new("server.bind_address", &["TARS_SERVER_BIND_ADDRESS"], &config.server.bind_address),
        Field::new("server.port", &["TARS_SERVER_PORT"], config.server.port.to_string()),
        Field::new("dispatch.mode", &["TARS_DISPATCH_MODE"], format!("{:?}", config.dispatch.mode)),
        Field::new(
            "dispatch.evaluator_url",
            &["TARS_DISPATCH_EVALUATOR_URL"],
            optional(config.dispatch.evaluator_url.as_deref()),
        ),
        Field::new(
            "queue.evaluation_delay_secs",
            &["TARS_QUEUE_EVALUATION_DELAY_SECS"],
            config.queue.evaluation_delay_secs.to_string(),
        ),
        Field::new(
            "queue.max_attempts",
            &["TARS_QUEUE_MAX_ATTEMPTS"],
            config.queue.max_attempts.to_string(),
        ),
        Field::new(
            "checkpoint.ttl_days",
            &["TARS_CHECKPOINT_TTL_DAYS"],
            config.checkpoint.ttl_days.to_string(),
        ),
        Field::new("agents.name", &["TARS_AGENTS_NAME"], &config.agents.name),
        Field::new(
            "agents.architecture_tools",
            &["TARS_AGENTS_ARCHITECTURE_TOOLS"],
            config.agents.architecture_tools.join(","),
        ),
        Field::new(
            "mcp.aws_api_command",
            &["TARS_MCP_AWS_API_COMMAND"],
            optional(config.mcp.aws_api_command.as_deref()),
        ),
        Field::new("mcp.aws_region", &["TARS_MCP_AWS_REGION", "AWS_REGION"], &config.mcp.aws_region),
        Field::new(
            "web_search.api_key",
            &["TARS_WEB_SEARCH_API_KEY", "TAVILY_API_KEY"],
            redact_secret(config.web_search.api_key.as_ref()),
        ),
        Field::new("logging.level", &["TARS_LOGGING_LEVEL", "TARS_LOG_LEVEL"], &config.logging.level),
        Field::new(
            "logging.format",
            &["TARS_LOGGING_FORMAT", "TARS_LOG_FORMAT"],
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("tars.toml"), PathBuf::from("config/tars.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<toml::Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<toml::Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&toml::Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if config_file_doc.is_some_and(|doc| contains_path(doc, key_path)) {
        let file_path = config_file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &toml::Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Keeps the `xoxb-` style prefix so the token kind stays visible.
fn redact_token(token: &SecretString) -> String {
    let trimmed = token.expose_secret().trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}

fn redact_secret(secret: Option<&SecretString>) -> String {
    match secret {
        Some(secret) if !secret.expose_secret().trim().is_empty() => "<redacted>".to_string(),
        Some(_) => "<empty>".to_string(),
        None => "<unset>".to_string(),
    }
}

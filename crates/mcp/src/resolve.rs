//! Launch commands for the MCP servers the agents talk to.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tars_core::config::{McpConfig, McpServerConfig};

pub const AWS_API_SERVER_NAME: &str = "aws-api";
pub const AWS_API_BINARY: &str = "aws-api-mcp-server";
pub const AWS_API_PACKAGE: &str = "awslabs.aws-api-mcp-server@latest";

/// How the AWS API server command was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandSource {
    Configured,
    Path,
    Uvx,
}

impl CommandSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Path => "path",
            Self::Uvx => "uvx",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerCommand {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl ServerCommand {
    pub fn from_config(config: &McpServerConfig) -> Self {
        Self {
            name: config.name.clone(),
            program: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }

    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).envs(&self.env).kill_on_drop(true);
        command
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub command: ServerCommand,
    pub source: CommandSource,
}

pub fn aws_api_env(config: &McpConfig) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("AWS_REGION".to_string(), config.aws_region.clone()),
        ("READ_OPERATIONS_ONLY".to_string(), config.read_operations_only.to_string()),
        ("REQUIRE_MUTATION_CONSENT".to_string(), "false".to_string()),
        ("FASTMCP_LOG_LEVEL".to_string(), "ERROR".to_string()),
    ])
}

/// Resolves the AWS API server: an existing configured path first, then the
/// binary on `PATH`, then `uvx`.
pub fn resolve_aws_api_server(config: &McpConfig) -> ResolvedCommand {
    resolve_with(config, |binary| which::which(binary).ok())
}

fn resolve_with(
    config: &McpConfig,
    lookup: impl Fn(&str) -> Option<PathBuf>,
) -> ResolvedCommand {
    let env = aws_api_env(config);
    let command = |program: String, args: Vec<String>| ServerCommand {
        name: AWS_API_SERVER_NAME.to_string(),
        program,
        args,
        env: env.clone(),
    };

    if let Some(configured) = config.aws_api_command.as_deref().map(str::trim) {
        if !configured.is_empty() && Path::new(configured).exists() {
            return ResolvedCommand {
                command: command(configured.to_string(), Vec::new()),
                source: CommandSource::Configured,
            };
        }
        if !configured.is_empty() {
            tracing::warn!(
                event_name = "mcp.resolve.configured_missing",
                path = configured,
                "configured aws api server path does not exist, falling back"
            );
        }
    }

    if let Some(path) = lookup(AWS_API_BINARY) {
        return ResolvedCommand {
            command: command(path.display().to_string(), Vec::new()),
            source: CommandSource::Path,
        };
    }

    ResolvedCommand {
        command: command("uvx".to_string(), vec![AWS_API_PACKAGE.to_string()]),
        source: CommandSource::Uvx,
    }
}

//! MCP client plumbing for the agents.
//!
//! Servers run as stdio child processes. Their tools are wrapped as
//! [`tars_agent::Tool`]s and collected into registries: the AWS API server
//! feeds the architecture agent, the documentation servers feed the QA agent.

pub mod client;
pub mod resolve;
pub mod tools;

use thiserror::Error;

pub use client::{McpClient, McpSession};
pub use resolve::{resolve_aws_api_server, CommandSource, ResolvedCommand, ServerCommand};
pub use tools::{register_session_tools, McpTool, McpToolset};

#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn mcp server `{server}`: {detail}")]
    Spawn { server: String, detail: String },
    #[error("mcp server `{server}` failed to initialize: {detail}")]
    Initialize { server: String, detail: String },
    #[error("listing tools on `{server}` failed: {detail}")]
    ListTools { server: String, detail: String },
    #[error("tool `{tool}` failed: {detail}")]
    CallTool { tool: String, detail: String },
    #[error("invalid arguments for `{tool}`: {detail}")]
    InvalidArguments { tool: String, detail: String },
    #[error("mcp server `{server}` is closed")]
    Closed { server: String },
}

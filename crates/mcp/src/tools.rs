//! Adapts MCP server tools to the agent [`Tool`] trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tars_agent::{Tool, ToolRegistry, ToolSpec};
use tracing::{info, warn};

use crate::client::{McpClient, McpSession};
use crate::resolve::ServerCommand;
use crate::McpError;

pub struct McpTool {
    session: Arc<dyn McpSession>,
    spec: ToolSpec,
}

impl McpTool {
    pub fn new(session: Arc<dyn McpSession>, spec: ToolSpec) -> Self {
        Self { session, spec }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(&self, input: Value) -> anyhow::Result<Value> {
        Ok(self.session.call_tool(&self.spec.name, input).await?)
    }
}

/// Registers every tool a session exposes, or only the allowed ones.
pub async fn register_session_tools(
    registry: &mut ToolRegistry,
    session: Arc<dyn McpSession>,
    allowlist: Option<&[String]>,
) -> Result<usize, McpError> {
    let specs = session.list_tools().await?;
    let mut registered = 0;
    for spec in specs {
        if let Some(allowed) = allowlist {
            if !allowed.iter().any(|name| name == &spec.name) {
                continue;
            }
        }
        registry.register(McpTool::new(session.clone(), spec));
        registered += 1;
    }
    Ok(registered)
}

/// Running MCP clients together with the tools they contributed.
#[derive(Default)]
pub struct McpToolset {
    pub registry: ToolRegistry,
    clients: Vec<Arc<McpClient>>,
}

impl McpToolset {
    /// Connects to each server and collects its tools. A server that fails to
    /// start is logged and skipped.
    pub async fn connect(servers: &[ServerCommand], allowlist: Option<&[String]>) -> Self {
        let mut toolset = Self::default();
        for server in servers {
            match toolset.add_server(server, allowlist).await {
                Ok(count) => info!(
                    event_name = "mcp.toolset.server_ready",
                    server = %server.name,
                    tools = count,
                    "mcp server connected"
                ),
                Err(error) => warn!(
                    event_name = "mcp.toolset.server_unavailable",
                    server = %server.name,
                    error = %error,
                    "skipping mcp server"
                ),
            }
        }
        toolset
    }

    async fn add_server(
        &mut self,
        server: &ServerCommand,
        allowlist: Option<&[String]>,
    ) -> Result<usize, McpError> {
        let client = Arc::new(McpClient::connect(server).await?);
        match register_session_tools(&mut self.registry, client.clone(), allowlist).await {
            Ok(count) => {
                self.clients.push(client);
                Ok(count)
            }
            Err(error) => {
                client.shutdown().await;
                Err(error)
            }
        }
    }

    pub fn server_count(&self) -> usize {
        self.clients.len()
    }

    pub async fn shutdown(&self) {
        for client in &self.clients {
            client.shutdown().await;
        }
    }
}

use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, CallToolResult};
use rmcp::service::{Peer, RunningService};
use rmcp::transport::TokioChildProcess;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tars_agent::ToolSpec;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::resolve::ServerCommand;
use crate::McpError;

/// A connected MCP server that can list and call tools.
#[async_trait]
pub trait McpSession: Send + Sync {
    fn server_name(&self) -> &str;
    async fn list_tools(&self) -> Result<Vec<ToolSpec>, McpError>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;
}

/// Stdio client for one MCP server child process.
pub struct McpClient {
    name: String,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl McpClient {
    pub async fn connect(command: &ServerCommand) -> Result<Self, McpError> {
        info!(
            event_name = "mcp.client.spawn",
            server = %command.name,
            command = %command,
            "starting mcp server"
        );
        let transport = TokioChildProcess::new(command.to_command()).map_err(|error| {
            McpError::Spawn { server: command.name.clone(), detail: error.to_string() }
        })?;
        let service = ().serve(transport).await.map_err(|error| McpError::Initialize {
            server: command.name.clone(),
            detail: error.to_string(),
        })?;

        Ok(Self { name: command.name.clone(), service: Mutex::new(Some(service)) })
    }

    pub async fn shutdown(&self) {
        let Some(service) = self.service.lock().await.take() else {
            return;
        };
        if let Err(error) = service.cancel().await {
            warn!(
                event_name = "mcp.client.shutdown_failed",
                server = %self.name,
                error = %error,
                "mcp server did not shut down cleanly"
            );
        }
    }

    fn closed(&self) -> McpError {
        McpError::Closed { server: self.name.clone() }
    }

    /// Clones the request handle so calls do not hold the session lock.
    async fn peer(&self) -> Result<Peer<RoleClient>, McpError> {
        let guard = self.service.lock().await;
        guard.as_ref().map(|service| service.peer().clone()).ok_or_else(|| self.closed())
    }
}

#[async_trait]
impl McpSession for McpClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, McpError> {
        let tools = self.peer().await?.list_all_tools().await.map_err(|error| McpError::ListTools {
            server: self.name.clone(),
            detail: error.to_string(),
        })?;

        debug!(event_name = "mcp.client.tools_listed", server = %self.name, count = tools.len());
        Ok(tools
            .into_iter()
            .map(|tool| {
                ToolSpec::new(
                    tool.name.to_string(),
                    tool.description.map(|text| text.to_string()).unwrap_or_default(),
                    Value::Object(tool.input_schema.as_ref().clone()),
                )
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(McpError::InvalidArguments {
                    tool: name.to_string(),
                    detail: format!("expected a JSON object, got {other}"),
                })
            }
        };

        let result = self
            .peer()
            .await?
            .call_tool(CallToolRequestParam { name: name.to_string().into(), arguments })
            .await
            .map_err(|error| McpError::CallTool {
                tool: name.to_string(),
                detail: error.to_string(),
            })?;

        tool_output(name, result)
    }
}

fn tool_output(name: &str, result: CallToolResult) -> Result<Value, McpError> {
    let text = result
        .content
        .iter()
        .filter_map(|content| content.as_text().map(|text| text.text.clone()))
        .collect::<Vec<_>>()
        .join("\n");

    if result.is_error.unwrap_or(false) {
        return Err(McpError::CallTool { tool: name.to_string(), detail: text });
    }
    if text.is_empty() {
        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
    }
    Ok(Value::String(text))
}

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};

use tars_core::config::WebSearchConfig;

use crate::tools::{Tool, ToolSpec};

pub const WEB_SEARCH_TOOL: &str = "web_search";

/// Tavily search exposed as a tool.
pub struct WebSearchTool {
    http: reqwest::Client,
    endpoint: String,
    api_key: SecretString,
    max_results: u32,
    search_depth: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

impl WebSearchTool {
    /// `None` when no API key is configured.
    pub fn from_config(config: &WebSearchConfig) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build web search http client")?;
        Ok(Some(Self {
            http,
            endpoint: format!("{}/search", config.base_url.trim_end_matches('/')),
            api_key,
            max_results: config.max_results,
            search_depth: config.search_depth.clone(),
        }))
    }

    fn request_body(&self, query: &str) -> Value {
        json!({
            "query": query,
            "max_results": self.max_results,
            "search_depth": self.search_depth,
            "topic": "general",
        })
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            WEB_SEARCH_TOOL,
            "Search the web for current information. Use it only when the question is not about AWS services.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string", "description": "Search query"}},
                "required": ["query"],
            }),
        )
    }

    async fn execute(&self, input: Value) -> Result<Value> {
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .filter(|query| !query.trim().is_empty())
            .ok_or_else(|| anyhow!("missing required argument `query`"))?;

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .json(&self.request_body(query))
            .send()
            .await
            .context("web search request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("web search returned HTTP {}: {body}", status.as_u16()));
        }
        let parsed: SearchResponse = response.json().await.context("web search response did not decode")?;
        Ok(Value::String(render_hits(&parsed.results)))
    }
}

fn render_hits(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No results found.".to_string();
    }
    hits.iter()
        .map(|hit| format!("{}\n{}\n{}", hit.title, hit.url, hit.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

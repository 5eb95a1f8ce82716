//! Search tools: `search_web` and `search_news` over a Tavily-style HTTP API.
//!
//! Both tools share one [`SearchClient`]. The endpoint takes a single POST
//! with the query and a result bound and returns a list of results, which are
//! mapped to a uniform `{title, url, content}` shape. Transport errors,
//! non-2xx statuses and undecodable bodies all become structured tool
//! failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use toolmux_core::error::ToolError;
use toolmux_core::tool::{Tool, ToolResult};
use tracing::{debug, warn};

pub const DEFAULT_SEARCH_URL: &str = "https://api.tavily.com/search";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RESULTS: u64 = 10;
const MAX_RESULTS_CAP: u64 = 20;

/// Which flavour of search a tool performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Web,
    News,
}

impl SearchMode {
    fn label(self) -> &'static str {
        match self {
            SearchMode::Web => "web search",
            SearchMode::News => "news search",
        }
    }
}

/// One normalized search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<ApiResult>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl From<ApiResult> for SearchHit {
    fn from(r: ApiResult) -> Self {
        Self {
            title: r.title.unwrap_or_default(),
            url: r.url.unwrap_or_default(),
            content: r.content.unwrap_or_default(),
        }
    }
}

/// HTTP client for the search endpoint.
pub struct SearchClient {
    api_url: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(api_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout: DEFAULT_TIMEOUT,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Run one search and return the normalized hits plus the endpoint's
    /// synthesized answer, if it produced one.
    pub async fn search(
        &self,
        tool_name: &str,
        mode: SearchMode,
        query: &str,
        max_results: u64,
    ) -> Result<(Vec<SearchHit>, Option<String>), ToolError> {
        let failed = |reason: String| ToolError::ExecutionFailed {
            tool_name: tool_name.to_string(),
            reason,
        };

        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| failed("Search API key is not configured".into()))?;

        let mut body = serde_json::json!({
            "query": query,
            "search_depth": "advanced",
            "include_answer": true,
            "include_images": false,
            "max_results": max_results,
        });
        if mode == SearchMode::News {
            body["topic"] = serde_json::json!("news");
        }

        debug!(tool = tool_name, max_results, "Sending search request");

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout {
                        tool_name: tool_name.to_string(),
                        timeout_secs: self.timeout.as_secs(),
                    }
                } else {
                    failed(format!("Error in {}: {e}", mode.label()))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "Search endpoint returned error");
            let snippet: String = error_body.chars().take(200).collect();
            return Err(failed(format!(
                "Error in {}: endpoint returned {status}: {snippet}",
                mode.label()
            )));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("Error in {}: failed to parse response: {e}", mode.label())))?;

        let hits = api_response.results.into_iter().map(SearchHit::from).collect();
        Ok((hits, api_response.answer.filter(|a| !a.is_empty())))
    }
}

/// A search tool bound to one [`SearchMode`].
pub struct SearchTool {
    mode: SearchMode,
    client: Arc<SearchClient>,
}

impl SearchTool {
    pub fn web(client: Arc<SearchClient>) -> Self {
        Self { mode: SearchMode::Web, client }
    }

    pub fn news(client: Arc<SearchClient>) -> Self {
        Self { mode: SearchMode::News, client }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        match self.mode {
            SearchMode::Web => "search_web",
            SearchMode::News => "search_news",
        }
    }

    fn description(&self) -> &str {
        match self.mode {
            SearchMode::Web => {
                "Search the web for up-to-date information. Returns results with titles, URLs, and content."
            }
            SearchMode::News => {
                "Search recent news articles. Returns results with titles, URLs, and content."
            }
        }
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default 10)",
                    "default": DEFAULT_MAX_RESULTS,
                    "minimum": 1,
                    "maximum": MAX_RESULTS_CAP
                }
            },
            "required": ["query"]
        })
    }

    fn output_schema(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "type": "object",
            "properties": {
                "answer": { "type": "string" },
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "url": { "type": "string" },
                            "content": { "type": "string" }
                        }
                    }
                }
            },
            "required": ["results"]
        }))
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let query = arguments["query"]
            .as_str()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        let max_results = match &arguments["max_results"] {
            serde_json::Value::Null => DEFAULT_MAX_RESULTS,
            v => v.as_u64().ok_or_else(|| {
                ToolError::InvalidArguments("'max_results' must be a positive integer".into())
            })?,
        }
        .clamp(1, MAX_RESULTS_CAP);

        let (hits, answer) = self
            .client
            .search(self.name(), self.mode, query, max_results)
            .await?;

        let output = if hits.is_empty() {
            format!("No results for '{query}'")
        } else {
            hits.iter()
                .enumerate()
                .map(|(i, h)| format!("{}. {} ({})\n{}", i + 1, h.title, h.url, h.content))
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        let mut data = serde_json::json!({ "results": hits });
        if let Some(answer) = answer {
            data["answer"] = serde_json::json!(answer);
        }

        Ok(ToolResult::ok(output, data))
    }
}

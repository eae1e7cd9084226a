//! MCP client for the knowledge backend.
//!
//! [`McpBackend`] implements [`KnowledgeBackend`] by calling the backend's
//! tools over MCP streamable HTTP. Every call is bounded by
//! `backend.tool_timeout_secs`.
//!
//! Tool results come back as text content that is usually, but not always,
//! a JSON object. [`normalize_tool_output`] folds every shape into an object
//! with a `status` key:
//!
//! | Content | Normalized |
//! |---------|------------|
//! | JSON object | as-is |
//! | other JSON | `{"status": "success", "result": <value>}` |
//! | plain text | `{"status": "raw", "result": "<text>"}` |

use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::StreamableHttpClientTransport;
use rmcp::{RoleClient, ServiceExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use quiknow_core::backend::KnowledgeBackend;
use quiknow_core::models::{BuildJob, JobStatus, Leaf, QueryRows};
use quiknow_core::PipelineError;

use crate::config::BackendConfig;

pub struct McpBackend {
    url: String,
    timeout: Duration,
    client: RunningService<RoleClient, ()>,
}

impl McpBackend {
    /// Open an MCP session with the backend at `config.url()`.
    pub async fn connect(config: &BackendConfig) -> Result<Self, PipelineError> {
        let url = config.url();
        let timeout = config.tool_timeout();
        debug!(%url, "connecting to knowledge backend");
        let transport = StreamableHttpClientTransport::from_uri(url.clone());
        let client = tokio::time::timeout(timeout, ().serve(transport))
            .await
            .map_err(|_| {
                PipelineError::BackendUnavailable(format!("{}: no handshake within {:?}", url, timeout))
            })?
            .map_err(|e| PipelineError::BackendUnavailable(format!("{}: {}", url, e)))?;
        Ok(Self {
            url,
            timeout,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// End the MCP session.
    pub async fn close(self) {
        if let Err(e) = self.client.cancel().await {
            debug!(error = %e, "closing backend session");
        }
    }

    /// Call `tool` with `arguments` and return its normalized output.
    ///
    /// Transport failures are [`PipelineError::BackendUnavailable`], a call
    /// that outlives `tool_timeout_secs` is [`PipelineError::Timeout`], and
    /// results flagged as errors are [`PipelineError::Tool`].
    pub async fn call(&self, tool: &str, arguments: Value) -> Result<Value, PipelineError> {
        let params: CallToolRequestParams =
            serde_json::from_value(json!({ "name": tool, "arguments": arguments })).map_err(|e| {
                PipelineError::Tool {
                    tool: tool.to_string(),
                    message: format!("invalid arguments: {}", e),
                }
            })?;

        let outcome = tokio::time::timeout(self.timeout, self.client.call_tool(params)).await;
        let result = classify_call(tool, self.timeout, outcome)?;

        let text = result
            .content
            .iter()
            .filter_map(|c| c.raw.as_text().map(|t| t.text.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        if result.is_error.unwrap_or(false) {
            return Err(PipelineError::Tool {
                tool: tool.to_string(),
                message: text,
            });
        }

        let output = match result.structured_content {
            Some(structured) if text.trim().is_empty() => normalize_json(structured),
            _ => normalize_tool_output(&text),
        };
        ensure_success(tool, &output)?;
        Ok(output)
    }
}

/// Map a bounded tool call onto the error taxonomy: an elapsed deadline is a
/// timeout, a transport error means the backend is gone.
fn classify_call<T, E: std::fmt::Display>(
    tool: &str,
    timeout: Duration,
    outcome: Result<Result<T, E>, tokio::time::error::Elapsed>,
) -> Result<T, PipelineError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineError::BackendUnavailable(format!("{}: {}", tool, e))),
        Err(_) => {
            warn!(tool, ?timeout, "tool call timed out");
            Err(PipelineError::Timeout(timeout))
        }
    }
}

/// Fold raw tool text into a JSON object with a `status` key.
pub fn normalize_tool_output(text: &str) -> Value {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(value) => normalize_json(value),
        Err(_) => json!({ "status": "raw", "result": text }),
    }
}

fn normalize_json(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "status": "success", "result": value })
    }
}

/// Objects reporting `status: "error"` (or `failed`) are tool errors.
fn ensure_success(tool: &str, output: &Value) -> Result<(), PipelineError> {
    match output.get("status").and_then(|s| s.as_str()) {
        Some("error") | Some("failed") => Err(PipelineError::Tool {
            tool: tool.to_string(),
            message: error_message(output),
        }),
        _ => Ok(()),
    }
}

fn error_message(output: &Value) -> String {
    ["message", "error", "detail", "result"]
        .iter()
        .find_map(|k| output.get(*k))
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .unwrap_or_else(|| output.to_string())
}

/// The text of a `search_documents` result.
fn result_text(output: &Value) -> String {
    match output.get("result") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Leaves of a `gather_context` result (`nodes[].leaves[]`).
pub fn parse_leaves(output: &Value) -> Vec<Leaf> {
    let nodes = output
        .get("nodes")
        .or_else(|| output.get("result").and_then(|r| r.get("nodes")))
        .and_then(|n| n.as_array());
    let Some(nodes) = nodes else {
        return Vec::new();
    };
    nodes
        .iter()
        .filter_map(|node| node.get("leaves").and_then(|l| l.as_array()))
        .flatten()
        .filter_map(|leaf| {
            let id = match leaf.get("id")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Some(Leaf {
                id,
                context: leaf
                    .get("context")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string(),
                node_type: leaf
                    .get("node_type")
                    .and_then(|t| t.as_str())
                    .unwrap_or("leaf")
                    .to_string(),
                hit: leaf.get("hit").and_then(|h| h.as_bool()).unwrap_or(false),
            })
        })
        .collect()
}

/// Rows of a `sql_tool` result, from `rows` or `result`.
pub fn parse_rows(output: &Value) -> Option<Vec<Value>> {
    ["rows", "result", "data"]
        .iter()
        .find_map(|k| output.get(*k))
        .and_then(|v| match v {
            Value::Array(rows) => Some(rows.clone()),
            Value::Object(o) => o.get("rows").and_then(|r| r.as_array()).cloned(),
            _ => None,
        })
}

#[async_trait]
impl KnowledgeBackend for McpBackend {
    async fn start_document_build(&self, path: Option<&str>) -> Result<BuildJob, PipelineError> {
        let args = match path {
            Some(p) => json!({ "file_path": p }),
            None => json!({}),
        };
        let raw = self.call("start_document_build", args).await?;
        let job_id = ["job_id", "id"]
            .iter()
            .find_map(|k| {
                raw.get(*k)
                    .or_else(|| raw.get("result").and_then(|r| r.get(*k)))
            })
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| PipelineError::Tool {
                tool: "start_document_build".to_string(),
                message: format!("response has no job id: {}", raw),
            })?;
        Ok(BuildJob { job_id, raw })
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, PipelineError> {
        let raw = self.call("get_job_status", json!({ "job_id": job_id })).await?;
        JobStatus::from_payload(job_id, raw)
    }

    async fn build_directory_tree(&self) -> Result<Value, PipelineError> {
        self.call("directory_tree_builder", json!({})).await
    }

    async fn overview(&self, keywords: &[String]) -> Result<String, PipelineError> {
        let out = self
            .call("search_documents", json!({ "mode": "overview", "keywords": keywords }))
            .await?;
        Ok(result_text(&out))
    }

    async fn expand(&self, file_ids: &[String], keywords: &[String]) -> Result<String, PipelineError> {
        let out = self
            .call(
                "search_documents",
                json!({ "mode": "expand", "ids": file_ids, "keywords": keywords }),
            )
            .await?;
        Ok(result_text(&out))
    }

    async fn gather_context(
        &self,
        node_ids: &[String],
        keywords: &[String],
    ) -> Result<Vec<Leaf>, PipelineError> {
        let out = self
            .call("gather_context", json!({ "node_ids": node_ids, "keywords": keywords }))
            .await?;
        Ok(parse_leaves(&out))
    }

    async fn run_query(&self, sql: &str) -> Result<QueryRows, PipelineError> {
        let out = match self.call("sql_tool", json!({ "sql": sql })).await {
            Ok(out) => out,
            Err(PipelineError::Tool { message, .. }) => return Err(PipelineError::QueryError(message)),
            Err(e) => return Err(e),
        };
        let rows = parse_rows(&out)
            .ok_or_else(|| PipelineError::QueryError(format!("no rows in response: {}", out)))?;
        Ok(QueryRows {
            sql: sql.to_string(),
            rows,
        })
    }
}

//! In-memory [`KnowledgeBackend`] for tests and offline runs.
//!
//! Holds a fixed tree, per-file expansions, per-node leaves, and query
//! rules matched by SQL substring. Build jobs advance one state per poll
//! (`pending` → `running` → `done`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::PipelineError;
use crate::models::{BuildJob, JobState, JobStatus, Leaf, QueryRows};

use super::KnowledgeBackend;

enum QueryOutcome {
    Rows(Vec<serde_json::Value>),
    Error(String),
    Outage(String),
}

struct QueryRule {
    needle: String,
    outcome: QueryOutcome,
    delay: Option<Duration>,
}

/// In-memory backend. All configuration methods take `&self` so a shared
/// instance can be adjusted between calls.
pub struct InMemoryBackend {
    tree: RwLock<String>,
    expansions: RwLock<HashMap<String, String>>,
    leaves: RwLock<HashMap<String, Vec<Leaf>>>,
    queries: RwLock<Vec<QueryRule>>,
    jobs: RwLock<HashMap<String, JobState>>,
    unavailable: AtomicBool,
    next_job: AtomicUsize,
    query_log: Mutex<Vec<String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(String::new()),
            expansions: RwLock::new(HashMap::new()),
            leaves: RwLock::new(HashMap::new()),
            queries: RwLock::new(Vec::new()),
            jobs: RwLock::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
            next_job: AtomicUsize::new(1),
            query_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tree(self, text: impl Into<String>) -> Self {
        *self.tree.write().unwrap() = text.into();
        self
    }

    pub fn with_expansion(self, file_id: impl Into<String>, text: impl Into<String>) -> Self {
        self.expansions
            .write()
            .unwrap()
            .insert(file_id.into(), text.into());
        self
    }

    /// Attach a leaf below `node_id`.
    pub fn with_leaf(self, node_id: impl Into<String>, leaf: Leaf) -> Self {
        self.leaves
            .write()
            .unwrap()
            .entry(node_id.into())
            .or_default()
            .push(leaf);
        self
    }

    /// Queries containing `needle` (case-insensitive) return `rows`.
    pub fn with_query_rows(self, needle: impl Into<String>, rows: Vec<serde_json::Value>) -> Self {
        self.push_rule(needle.into(), QueryOutcome::Rows(rows), None);
        self
    }

    /// Queries containing `needle` fail with a [`PipelineError::QueryError`].
    pub fn with_query_error(self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.push_rule(needle.into(), QueryOutcome::Error(message.into()), None);
        self
    }

    /// Queries containing `needle` fail as if the connection dropped.
    pub fn with_query_outage(self, needle: impl Into<String>, message: impl Into<String>) -> Self {
        self.push_rule(needle.into(), QueryOutcome::Outage(message.into()), None);
        self
    }

    /// Queries containing `needle` return `rows` after `delay`.
    pub fn with_slow_query(
        self,
        needle: impl Into<String>,
        rows: Vec<serde_json::Value>,
        delay: Duration,
    ) -> Self {
        self.push_rule(needle.into(), QueryOutcome::Rows(rows), Some(delay));
        self
    }

    fn push_rule(&self, needle: String, outcome: QueryOutcome, delay: Option<Duration>) {
        self.queries.write().unwrap().push(QueryRule {
            needle: needle.to_lowercase(),
            outcome,
            delay,
        });
    }

    /// Simulate a transport failure on every call.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// SQL statements received by [`run_query`](KnowledgeBackend::run_query), in order.
    pub fn query_log(&self) -> Vec<String> {
        self.query_log.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), PipelineError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(PipelineError::BackendUnavailable(
                "connection refused (in-memory backend offline)".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KnowledgeBackend for InMemoryBackend {
    async fn start_document_build(&self, path: Option<&str>) -> Result<BuildJob, PipelineError> {
        self.check_available()?;
        let n = self.next_job.fetch_add(1, Ordering::SeqCst);
        let job_id = format!("job-{}", n);
        self.jobs
            .write()
            .unwrap()
            .insert(job_id.clone(), JobState::Pending);
        Ok(BuildJob {
            raw: json!({"status": "success", "job_id": job_id, "file_path": path}),
            job_id,
        })
    }

    async fn job_status(&self, job_id: &str) -> Result<JobStatus, PipelineError> {
        self.check_available()?;
        let mut jobs = self.jobs.write().unwrap();
        let state = jobs.get_mut(job_id).ok_or_else(|| PipelineError::Tool {
            tool: "get_job_status".to_string(),
            message: format!("unknown job id: {}", job_id),
        })?;
        let current = *state;
        *state = match current {
            JobState::Pending => JobState::Running,
            JobState::Running | JobState::Done => JobState::Done,
            JobState::Failed => JobState::Failed,
        };
        let raw = json!({
            "job_id": job_id,
            "state": current,
            "progress": match current {
                JobState::Pending => 0.0,
                JobState::Running => 0.5,
                JobState::Done | JobState::Failed => 1.0,
            },
        });
        JobStatus::from_payload(job_id, raw)
    }

    async fn build_directory_tree(&self) -> Result<serde_json::Value, PipelineError> {
        self.check_available()?;
        let tree = self.tree.read().unwrap();
        Ok(json!({
            "status": "success",
            "files": self.expansions.read().unwrap().len(),
            "tree": *tree,
        }))
    }

    async fn overview(&self, _keywords: &[String]) -> Result<String, PipelineError> {
        self.check_available()?;
        let tree = self.tree.read().unwrap();
        if tree.is_empty() {
            return Err(PipelineError::Tool {
                tool: "search_documents".to_string(),
                message: "tree has not been built".to_string(),
            });
        }
        Ok(tree.clone())
    }

    async fn expand(&self, file_ids: &[String], _keywords: &[String]) -> Result<String, PipelineError> {
        self.check_available()?;
        let expansions = self.expansions.read().unwrap();
        let parts: Vec<&str> = file_ids
            .iter()
            .filter_map(|id| expansions.get(id).map(String::as_str))
            .collect();
        if parts.is_empty() {
            return Err(PipelineError::Tool {
                tool: "search_documents".to_string(),
                message: format!("no such files: {}", file_ids.join(",")),
            });
        }
        Ok(parts.join("\n"))
    }

    async fn gather_context(
        &self,
        node_ids: &[String],
        _keywords: &[String],
    ) -> Result<Vec<Leaf>, PipelineError> {
        self.check_available()?;
        let leaves = self.leaves.read().unwrap();
        Ok(node_ids
            .iter()
            .filter_map(|id| leaves.get(id))
            .flatten()
            .cloned()
            .collect())
    }

    async fn run_query(&self, sql: &str) -> Result<QueryRows, PipelineError> {
        self.check_available()?;
        self.query_log.lock().unwrap().push(sql.to_string());

        let lower = sql.to_lowercase();
        let (result, delay) = {
            let rules = self.queries.read().unwrap();
            match rules.iter().find(|r| lower.contains(&r.needle)) {
                Some(rule) => {
                    let result = match &rule.outcome {
                        QueryOutcome::Rows(rows) => Ok(rows.clone()),
                        QueryOutcome::Error(msg) => Err(PipelineError::QueryError(msg.clone())),
                        QueryOutcome::Outage(msg) => {
                            Err(PipelineError::BackendUnavailable(msg.clone()))
                        }
                    };
                    (result, rule.delay)
                }
                None => (
                    Err(PipelineError::QueryError(format!("no table matches: {}", sql))),
                    None,
                ),
            }
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        result.map(|rows| QueryRows {
            sql: sql.to_string(),
            rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_advance_per_poll() {
        let backend = InMemoryBackend::new();
        let job = backend.start_document_build(Some("./docs")).await.unwrap();
        let states: Vec<JobState> = vec![
            backend.job_status(&job.job_id).await.unwrap().state,
            backend.job_status(&job.job_id).await.unwrap().state,
            backend.job_status(&job.job_id).await.unwrap().state,
        ];
        assert_eq!(states, vec![JobState::Pending, JobState::Running, JobState::Done]);
    }

    #[tokio::test]
    async fn unknown_job_is_a_tool_error() {
        let backend = InMemoryBackend::new();
        let err = backend.job_status("nope").await.unwrap_err();
        assert!(matches!(err, PipelineError::Tool { .. }));
    }

    #[tokio::test]
    async fn queries_match_by_substring() {
        let backend = InMemoryBackend::new()
            .with_query_rows("from sales", vec![json!({"total": 10})])
            .with_query_error("from returns", "no such table: returns");

        let rows = backend.run_query("SELECT SUM(x) FROM sales LIMIT 200").await.unwrap();
        assert_eq!(rows.rows, vec![json!({"total": 10})]);

        let err = backend.run_query("SELECT * FROM returns").await.unwrap_err();
        assert!(matches!(err, PipelineError::QueryError(_)));
        assert_eq!(backend.query_log().len(), 2);
    }

    #[tokio::test]
    async fn offline_backend_is_unavailable() {
        let backend = InMemoryBackend::new().with_tree("root");
        backend.set_unavailable(true);
        let err = backend.overview(&[]).await.unwrap_err();
        assert!(matches!(err, PipelineError::BackendUnavailable(_)));
    }
}

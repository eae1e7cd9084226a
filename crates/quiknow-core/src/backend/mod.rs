//! Knowledge backend abstraction.
//!
//! The [`KnowledgeBackend`] trait is the only way the ask engine and the
//! report pipeline reach the external service that indexes documents,
//! tracks build jobs, clusters the directory tree, and runs structured
//! queries. The application crate implements it over MCP; tests use
//! [`memory::InMemoryBackend`].
//!
//! Implementations must be `Send + Sync` so sub-questions can be resolved
//! concurrently against one shared backend.

pub mod memory;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::models::{BuildJob, JobStatus, Leaf, QueryRows};

/// Capability interface of the knowledge backend.
///
/// # Operations
///
/// | Method | Backend tool |
/// |--------|--------------|
/// | [`start_document_build`](KnowledgeBackend::start_document_build) | `start_document_build` |
/// | [`job_status`](KnowledgeBackend::job_status) | `get_job_status` |
/// | [`build_directory_tree`](KnowledgeBackend::build_directory_tree) | `directory_tree_builder` |
/// | [`overview`](KnowledgeBackend::overview) | `search_documents` (mode `overview`) |
/// | [`expand`](KnowledgeBackend::expand) | `search_documents` (mode `expand`) |
/// | [`gather_context`](KnowledgeBackend::gather_context) | `gather_context` |
/// | [`run_query`](KnowledgeBackend::run_query) | `sql_tool` |
///
/// Transport failures are reported as [`PipelineError::BackendUnavailable`];
/// errors the backend reports for a call are [`PipelineError::Tool`], except
/// for [`run_query`](KnowledgeBackend::run_query), which reports
/// [`PipelineError::QueryError`].
#[async_trait]
pub trait KnowledgeBackend: Send + Sync {
    /// Enqueue ingestion of a file or directory (the backend default when `None`).
    async fn start_document_build(&self, path: Option<&str>) -> Result<BuildJob, PipelineError>;

    /// Current status of a build job.
    async fn job_status(&self, job_id: &str) -> Result<JobStatus, PipelineError>;

    /// Cluster indexed content into a navigable directory tree.
    async fn build_directory_tree(&self) -> Result<serde_json::Value, PipelineError>;

    /// Directory-level overview of the tree. File nodes are marked `#id`
    /// and keyword hits `[HIT]`.
    async fn overview(&self, keywords: &[String]) -> Result<String, PipelineError>;

    /// Internal structure of the given files, with content leaves hidden.
    async fn expand(&self, file_ids: &[String], keywords: &[String]) -> Result<String, PipelineError>;

    /// Content leaves below the given structure nodes.
    async fn gather_context(
        &self,
        node_ids: &[String],
        keywords: &[String],
    ) -> Result<Vec<Leaf>, PipelineError>;

    /// Execute a read-only structured query.
    async fn run_query(&self, sql: &str) -> Result<QueryRows, PipelineError>;
}

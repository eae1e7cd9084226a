//! Error taxonomy for the ask engine and report pipeline.
//!
//! Only [`PipelineError::BackendUnavailable`] and [`PipelineError::Completion`]
//! abort an ask or a report orientation. Everything scoped to one
//! sub-question is contained in that sub-answer via
//! [`PipelineError::failure_reason`].

use std::time::Duration;

use thiserror::Error;

use crate::models::{FailureReason, PartialRun};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Transport failure or per-call timeout talking to the knowledge backend.
    #[error("knowledge backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend answered, but reported an error for this tool.
    #[error("backend tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("no relevant content found")]
    RetrievalEmpty,

    #[error("query error: {0}")]
    QueryError(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("decomposition produced no sub-questions")]
    DecompositionEmpty,

    #[error("language model call failed: {0}")]
    Completion(String),

    #[error("task text is empty")]
    TaskEmpty,

    /// The run was cancelled; carries whatever was completed.
    #[error("report run cancelled")]
    Cancelled(Box<PartialRun>),
}

impl PipelineError {
    /// The reason recorded on a sub-answer that failed with this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            PipelineError::BackendUnavailable(_) => FailureReason::BackendUnavailable,
            PipelineError::Tool { .. } | PipelineError::RetrievalEmpty => {
                FailureReason::RetrievalEmpty
            }
            PipelineError::QueryError(_) => FailureReason::QueryError,
            PipelineError::Timeout(_) => FailureReason::Timeout,
            PipelineError::Completion(_)
            | PipelineError::DecompositionEmpty
            | PipelineError::TaskEmpty => FailureReason::CompletionFailed,
            PipelineError::Cancelled(_) => FailureReason::Cancelled,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::BackendUnavailable(_)
                | PipelineError::Timeout(_)
                | PipelineError::Completion(_)
        )
    }
}

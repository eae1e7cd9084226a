//! Core data models used throughout QuiKnow.
//!
//! These types represent the task, the answers, and the report that flow
//! through the ask engine and the report pipeline, plus the small records
//! returned by the knowledge backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::metrics::ContextMetrics;

/// Maximum characters kept from a table's schema or sample section.
const TABLE_SECTION_CHARS: usize = 800;

/// The user's top-level report request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task from raw user text. Blank text is rejected.
    pub fn new(text: impl Into<String>) -> Result<Self, PipelineError> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::TaskEmpty);
        }
        Ok(Self {
            text,
            created_at: Utc::now(),
        })
    }
}

/// A piece of content an answer was grounded on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// A document leaf returned by `gather_context`.
    Excerpt {
        node_id: String,
        text: String,
        hit: bool,
    },
    /// A structured data preview (CSV/Excel node).
    Table {
        node_id: String,
        schema: String,
        sample: String,
    },
    /// A read-only query that was executed, with the rows it returned.
    Query {
        sql: String,
        rows: Vec<serde_json::Value>,
    },
}

impl Evidence {
    /// Build evidence from a gathered leaf. `csv_excel` leaves become
    /// [`Evidence::Table`] with their `SCHEMA:` / `SAMPLE:` sections split out.
    pub fn from_leaf(leaf: &Leaf) -> Self {
        if leaf.node_type == "csv_excel" {
            let (schema, sample) = split_table_sections(&leaf.context);
            Evidence::Table {
                node_id: leaf.id.clone(),
                schema,
                sample,
            }
        } else {
            Evidence::Excerpt {
                node_id: leaf.id.clone(),
                text: leaf.context.clone(),
                hit: leaf.hit,
            }
        }
    }

    /// Specificity weight used to break ties between contradicting findings.
    pub fn weight(&self) -> u32 {
        match self {
            Evidence::Query { .. } => 3,
            Evidence::Excerpt { hit: true, .. } => 2,
            Evidence::Excerpt { .. } | Evidence::Table { .. } => 1,
        }
    }

    pub fn is_table(&self) -> bool {
        matches!(self, Evidence::Table { .. })
    }
}

fn split_table_sections(text: &str) -> (String, String) {
    let Some((_, rest)) = text.split_once("SCHEMA:") else {
        return (String::new(), String::new());
    };
    let (schema, sample) = match rest.split_once("SAMPLE:") {
        Some((schema, sample)) => (schema, sample),
        None => (rest, ""),
    };
    (
        truncate_chars(schema.trim(), TABLE_SECTION_CHARS),
        truncate_chars(sample.trim(), TABLE_SECTION_CHARS),
    )
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Subtree scope for the ask engine: the file nodes to search within.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeScope {
    pub file_ids: Vec<String>,
}

impl TreeScope {
    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }
}

/// A single grounded answer produced by the ask engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub question: String,
    pub text: String,
    pub evidence: Vec<Evidence>,
    pub keywords: Vec<String>,
    /// Files the answer was retrieved from; reused as the scope of
    /// document sub-questions.
    pub scope: TreeScope,
    /// Structure nodes whose leaves were gathered.
    pub structure_nodes: Vec<String>,
    /// True when nothing relevant was found and `text` is a placeholder.
    pub retrieval_empty: bool,
    pub metrics: ContextMetrics,
}

/// The orientation pass is a plain ask-engine answer to the task text.
pub type OrientationAnswer = Answer;

impl Answer {
    /// Table previews among the evidence, in retrieval order.
    pub fn tables(&self) -> impl Iterator<Item = &Evidence> {
        self.evidence.iter().filter(|e| e.is_table())
    }

    pub fn has_tables(&self) -> bool {
        self.evidence.iter().any(Evidence::is_table)
    }
}

/// How a sub-question should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Document,
    Data,
}

impl Modality {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "document" | "doc" | "text" => Some(Modality::Document),
            "data" | "sql" | "table" => Some(Modality::Data),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Document => "document",
            Modality::Data => "data",
        }
    }
}

/// One independently answerable question derived from a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuestion {
    pub ordinal: usize,
    pub text: String,
    pub modality: Modality,
}

/// Why a sub-question could not be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    QueryError,
    Timeout,
    RetrievalEmpty,
    BackendUnavailable,
    CompletionFailed,
    Cancelled,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::QueryError => "QueryError",
            FailureReason::Timeout => "Timeout",
            FailureReason::RetrievalEmpty => "RetrievalEmpty",
            FailureReason::BackendUnavailable => "BackendUnavailable",
            FailureReason::CompletionFailed => "CompletionFailed",
            FailureReason::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

/// Terminal state of a sub-answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnswerStatus {
    Ok,
    Failed { reason: FailureReason, detail: String },
}

/// Result of resolving one [`SubQuestion`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAnswer {
    /// Ordinal of the originating sub-question.
    pub ordinal: usize,
    pub question: String,
    pub modality: Modality,
    pub text: String,
    pub evidence: Vec<Evidence>,
    pub status: AnswerStatus,
}

impl SubAnswer {
    pub fn ok(sub_question: &SubQuestion, text: String, evidence: Vec<Evidence>) -> Self {
        Self {
            ordinal: sub_question.ordinal,
            question: sub_question.text.clone(),
            modality: sub_question.modality,
            text,
            evidence,
            status: AnswerStatus::Ok,
        }
    }

    pub fn failed(
        sub_question: &SubQuestion,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            ordinal: sub_question.ordinal,
            question: sub_question.text.clone(),
            modality: sub_question.modality,
            text: String::new(),
            evidence: Vec::new(),
            status: AnswerStatus::Failed {
                reason,
                detail: detail.into(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AnswerStatus::Ok
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match &self.status {
            AnswerStatus::Ok => None,
            AnswerStatus::Failed { reason, .. } => Some(*reason),
        }
    }

    /// Sum of evidence weights; higher means more specific grounding.
    pub fn evidence_weight(&self) -> u32 {
        self.evidence.iter().map(Evidence::weight).sum()
    }
}

/// Why a sub-answer is not part of the report narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExclusionReason {
    Failed { reason: FailureReason, detail: String },
    Redundant { duplicate_of: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub ordinal: usize,
    pub question: String,
    pub reason: ExclusionReason,
}

/// How a report fell short of a full synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    DecompositionEmpty { detail: String },
    AllFailed,
    SynthesisFailed { detail: String },
    Cancelled,
}

impl Degradation {
    /// Notice appended to (or embedded in) a degraded report text.
    pub fn notice(&self) -> String {
        match self {
            Degradation::DecompositionEmpty { detail } => format!(
                "Note: the task could not be decomposed into sub-questions ({}); \
                 deeper analysis was unavailable and this report contains the initial answer only.",
                detail
            ),
            Degradation::AllFailed => "Note: every sub-question failed; deeper analysis was \
                 unavailable and this report contains the initial answer only."
                .to_string(),
            Degradation::SynthesisFailed { detail } => format!(
                "Note: the findings could not be merged by the model ({}); \
                 they are listed as produced.",
                detail
            ),
            Degradation::Cancelled => "Note: the report run was cancelled; only the findings \
                 completed before cancellation are included."
                .to_string(),
        }
    }
}

/// The final synthesized output. Sub-answers are referenced by ordinal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub task: String,
    pub text: String,
    pub included: Vec<usize>,
    pub excluded: Vec<Exclusion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degradation: Option<Degradation>,
}

/// Everything produced by one report run. The run owns the orientation,
/// sub-questions, and sub-answers; the report refers to them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRun {
    pub id: Uuid,
    pub task: Task,
    pub orientation: OrientationAnswer,
    pub sub_questions: Vec<SubQuestion>,
    pub sub_answers: Vec<SubAnswer>,
    pub report: Report,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReportRun {
    pub fn sub_answer(&self, ordinal: usize) -> Option<&SubAnswer> {
        self.sub_answers.iter().find(|a| a.ordinal == ordinal)
    }
}

/// State of a run that was cancelled before it finished.
#[derive(Debug, Clone)]
pub struct PartialRun {
    pub task: Task,
    pub orientation: Option<OrientationAnswer>,
    pub sub_questions: Vec<SubQuestion>,
    pub sub_answers: Vec<SubAnswer>,
    pub started_at: DateTime<Utc>,
}

// ── Backend records ─────────────────────────────────────────────────

/// A leaf returned by the backend's `gather_context` tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    pub id: String,
    pub context: String,
    #[serde(default = "default_node_type")]
    pub node_type: String,
    #[serde(default)]
    pub hit: bool,
}

fn default_node_type() -> String {
    "leaf".to_string()
}

/// Rows returned by a structured query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRows {
    pub sql: String,
    pub rows: Vec<serde_json::Value>,
}

/// A submitted document build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub job_id: String,
    pub raw: serde_json::Value,
}

/// Lifecycle state of a backend job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    /// Parse the spellings different backend versions use.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "waiting" | "created" => Some(JobState::Pending),
            "running" | "processing" | "in_progress" | "started" => Some(JobState::Running),
            "done" | "completed" | "complete" | "success" | "succeeded" | "finished" => {
                Some(JobState::Done)
            }
            "failed" | "failure" | "error" | "cancelled" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// Status of a backend job with optional progress detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub raw: serde_json::Value,
}

impl JobStatus {
    /// Interpret a `get_job_status` payload.
    ///
    /// The state is read from `state`, `job_status`, or `status`, under
    /// `job`/`result` when the backend wraps the record, else at the top level.
    pub fn from_payload(job_id: &str, raw: serde_json::Value) -> Result<Self, PipelineError> {
        let body = ["job", "result"]
            .iter()
            .find_map(|k| raw.get(*k).filter(|v| v.is_object()))
            .unwrap_or(&raw);

        let state_str = ["state", "job_status", "status"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()));

        let state = match state_str {
            Some(s) => JobState::parse(s).ok_or_else(|| PipelineError::Tool {
                tool: "get_job_status".to_string(),
                message: format!("unknown job state '{}'", s),
            })?,
            None => {
                return Err(PipelineError::Tool {
                    tool: "get_job_status".to_string(),
                    message: "response has no job state".to_string(),
                })
            }
        };

        let progress = body
            .get("progress")
            .and_then(|v| v.as_f64())
            .map(|p| if p > 1.0 { p / 100.0 } else { p });
        let message = ["message", "detail", "error"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_str()))
            .map(|s| s.to_string());

        Ok(Self {
            job_id: job_id.to_string(),
            state,
            progress,
            message,
            raw,
        })
    }
}

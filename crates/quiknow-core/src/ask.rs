//! Ask engine: one grounded answer to one question.
//!
//! Retrieval narrows the knowledge tree in three model-guided steps:
//!
//! ```text
//! overview(keywords) ──▶ pick files ──▶ expand(files) ──▶ pick nodes ──▶ gather_context(nodes)
//!                                                                              │
//!                         optional read-only query over table previews ◀───────┤
//!                                                                              ▼
//!                                                              answer from context only
//! ```
//!
//! When a [`TreeScope`] is given the overview step is skipped and the
//! scope's files are expanded directly.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backend::KnowledgeBackend;
use crate::completion::{Completer, Prompt};
use crate::error::PipelineError;
use crate::metrics::ContextMetrics;
use crate::models::{truncate_chars, Answer, Evidence, Leaf, QueryRows, TreeScope};
use crate::parse::{extract_json_object, parse_id_list, parse_nodes_line, strip_code_fences};
use crate::sql::sanitize_sql;

/// Characters of serialized query rows shown to the model.
pub const ROWS_PROMPT_CHARS: usize = 2000;

/// Words that suggest a question needs structured data.
const DATA_KEYWORDS: &[&str] = &[
    "csv", "table", "column", "count", "sum", "average", "statistic", "表", "字段", "列", "数据",
    "统计",
];

/// Text of the placeholder answer returned when retrieval finds nothing.
pub const NO_INFORMATION: &str =
    "No relevant information was found in the knowledge base for this question.";

const KEYWORDS_SYSTEM: &str = "Extract 3-8 search keywords or short phrases from the question. \
Keep proper nouns and table names unchanged. Output them comma separated and nothing else.";

const FILE_SELECT_SYSTEM: &str = "Below is the directory tree of a knowledge base. File nodes are \
marked #id and keyword matches [HIT]. Output only the ids of the 1-5 most relevant files, comma \
separated.";

const NODE_SELECT_SYSTEM: &str = "Below is the internal structure of the selected files. Content \
leaves are hidden; CSV/Excel files carry a preview node. Choose the 1-6 smallest structure nodes \
most relevant to the question. If the question concerns the contents or statistics of a data file \
(.csv/.xls/.xlsx), include that file's own node id rather than only its preview. Output exactly \
one line: NODES: id1,id2,...";

const DATA_DECISION_SYSTEM: &str = "You are a data analysis assistant. Decide whether a read-only \
SQL query would answer the question more accurately (aggregation, filtering, statistics). If so \
output JSON {\"mode\":\"sql\",\"sql\":\"SELECT ...\"}; otherwise output JSON \
{\"mode\":\"nl\",\"answer\":\"...\"}. Only SELECT is allowed, keep LIMIT at most 200, and never \
guess columns that are not in the schema.";

const ANSWER_SYSTEM: &str = "Answer the question using only the context below. If the context is \
insufficient, say so plainly. Do not fabricate facts, names, or numbers.";

const WRITE_QUERY_SYSTEM: &str = "Write one read-only SQL SELECT statement that answers the \
question from the tables described below. Use only the listed columns. Output JSON \
{\"sql\":\"SELECT ...\"} and nothing else.";

const INTERPRET_SYSTEM: &str = "Answer the question using only the values in the returned rows \
below. Quote the exact numbers. If the rows do not answer the question, say so; do not infer \
values that are not present.";

/// Tunables for retrieval breadth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskParams {
    pub max_files: usize,
    pub max_nodes: usize,
    pub max_keywords: usize,
    /// Table previews offered to the model when planning a query.
    pub max_tables: usize,
}

impl Default for AskParams {
    fn default() -> Self {
        Self {
            max_files: 5,
            max_nodes: 6,
            max_keywords: 12,
            max_tables: 2,
        }
    }
}

/// Whether `question` mentions structured-data vocabulary.
pub fn is_data_question(question: &str) -> bool {
    let lower = question.to_lowercase();
    DATA_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn keyword_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"[\s,，。；;:：/?？!！、()（）"'“”]+"#).expect("valid regex")
    })
}

/// Split a question into candidate search keywords.
pub fn heuristic_keywords(question: &str, max: usize) -> Vec<String> {
    keyword_split_re()
        .split(question.trim())
        .filter(|w| (2..=40).contains(&w.chars().count()))
        .take(max)
        .map(str::to_string)
        .collect()
}

fn dedupe_keywords(candidates: impl IntoIterator<Item = String>, max: usize) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for k in candidates {
        let k = k.trim().to_string();
        if k.is_empty() {
            continue;
        }
        if seen.insert(k.to_lowercase()) {
            out.push(k);
        }
        if out.len() >= max {
            break;
        }
    }
    out
}

/// Describe table previews for a query-planning prompt.
pub fn describe_tables<'a>(tables: impl IntoIterator<Item = &'a Evidence>) -> serde_json::Value {
    let files: Vec<serde_json::Value> = tables
        .into_iter()
        .filter_map(|e| match e {
            Evidence::Table {
                node_id,
                schema,
                sample,
            } => Some(json!({"id": node_id, "schema": schema, "sample": sample})),
            _ => None,
        })
        .collect();
    serde_json::Value::Array(files)
}

/// Single-shot question answering over the knowledge backend.
pub struct AskEngine {
    backend: Arc<dyn KnowledgeBackend>,
    completer: Arc<dyn Completer>,
    params: AskParams,
}

impl AskEngine {
    pub fn new(
        backend: Arc<dyn KnowledgeBackend>,
        completer: Arc<dyn Completer>,
        params: AskParams,
    ) -> Self {
        Self {
            backend,
            completer,
            params,
        }
    }

    pub fn backend(&self) -> &Arc<dyn KnowledgeBackend> {
        &self.backend
    }

    pub fn completer(&self) -> &Arc<dyn Completer> {
        &self.completer
    }

    pub fn params(&self) -> &AskParams {
        &self.params
    }

    /// Search keywords for `question`: heuristic tokens followed by
    /// model-proposed ones, deduplicated case-insensitively.
    pub async fn keywords(&self, question: &str) -> Vec<String> {
        let mut candidates = heuristic_keywords(question, self.params.max_keywords);
        if question.trim().is_empty() {
            return candidates;
        }
        match self
            .completer
            .complete(&Prompt::new(KEYWORDS_SYSTEM, question.trim()))
            .await
        {
            Ok(text) => candidates.extend(
                text.replace('\n', ",")
                    .split([',', '，'])
                    .map(|t| t.trim().to_string()),
            ),
            Err(e) => debug!(error = %e, "keyword extraction failed; using heuristic keywords"),
        }
        dedupe_keywords(candidates, self.params.max_keywords)
    }

    /// Answer `question`, optionally restricted to `scope`.
    ///
    /// Empty retrieval is not an error: the answer carries
    /// `retrieval_empty = true` and a placeholder text. Backend
    /// connectivity and model failures propagate.
    pub async fn answer(
        &self,
        question: &str,
        scope: Option<&TreeScope>,
    ) -> Result<Answer, PipelineError> {
        info!(question, "answering");
        let keywords = self.keywords(question).await;
        debug!(?keywords, "search keywords");

        match self.retrieve_and_answer(question, scope, &keywords).await {
            Err(e @ (PipelineError::RetrievalEmpty | PipelineError::Tool { .. })) => {
                warn!(question, error = %e, "retrieval found nothing");
                Ok(Answer {
                    question: question.to_string(),
                    text: NO_INFORMATION.to_string(),
                    evidence: Vec::new(),
                    keywords,
                    scope: scope.cloned().unwrap_or_default(),
                    structure_nodes: Vec::new(),
                    retrieval_empty: true,
                    metrics: ContextMetrics::default(),
                })
            }
            other => other,
        }
    }

    async fn retrieve_and_answer(
        &self,
        question: &str,
        scope: Option<&TreeScope>,
        keywords: &[String],
    ) -> Result<Answer, PipelineError> {
        let file_ids = match scope.filter(|s| !s.is_empty()) {
            Some(scope) => scope.file_ids.clone(),
            None => self.select_files(question, keywords).await?,
        };
        if file_ids.is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }
        info!(?file_ids, "selected files");

        let expanded = self.backend.expand(&file_ids, keywords).await?;
        debug!(chars = expanded.chars().count(), "expanded structure");

        let node_ids = self.select_nodes(question, &expanded, &file_ids).await;
        info!(?node_ids, "selected structure nodes");

        let leaves = match self.backend.gather_context(&node_ids, keywords).await {
            Ok(leaves) => leaves,
            Err(PipelineError::BackendUnavailable(msg)) => {
                return Err(PipelineError::BackendUnavailable(msg))
            }
            Err(e) => {
                warn!(error = %e, "gather_context failed; answering from structure only");
                Vec::new()
            }
        };
        let mut evidence: Vec<Evidence> = leaves.iter().map(Evidence::from_leaf).collect();

        let data_block = match self.enrich_with_data(question, &evidence).await {
            Some((block, query)) => {
                if let Some(query) = query {
                    evidence.push(query);
                }
                block
            }
            None => String::new(),
        };

        let leaves_block = format_leaves(&leaves);
        let mut context = expanded.clone();
        if !leaves_block.is_empty() {
            context.push_str("\n\n--- LEAVES ---\n");
            context.push_str(&leaves_block);
        }
        if !data_block.is_empty() {
            context.push_str("\n\n--- SQL ---\n");
            context.push_str(&data_block);
        }

        let contexts: Vec<&str> = leaves.iter().map(|l| l.context.as_str()).collect();
        let metrics = ContextMetrics::measure(&expanded, &contexts, &data_block);

        let text = self
            .completer
            .complete(&Prompt::new(
                ANSWER_SYSTEM,
                format!("Question: {}\nContext:\n{}", question, context),
            ))
            .await?;

        Ok(Answer {
            question: question.to_string(),
            text,
            evidence,
            keywords: keywords.to_vec(),
            scope: TreeScope { file_ids },
            structure_nodes: node_ids,
            retrieval_empty: false,
            metrics,
        })
    }

    async fn select_files(
        &self,
        question: &str,
        keywords: &[String],
    ) -> Result<Vec<String>, PipelineError> {
        let tree = self.backend.overview(keywords).await?;
        if tree.trim().is_empty() {
            return Err(PipelineError::RetrievalEmpty);
        }
        debug!(chars = tree.chars().count(), "overview tree");
        let reply = self
            .completer
            .complete(&Prompt::new(
                FILE_SELECT_SYSTEM,
                format!("Question: {}\nDirectory:\n{}", question, tree),
            ))
            .await?;
        Ok(parse_id_list(&strip_code_fences(&reply), self.params.max_files))
    }

    async fn select_nodes(&self, question: &str, expanded: &str, file_ids: &[String]) -> Vec<String> {
        let picked = match self
            .completer
            .complete(&Prompt::new(
                NODE_SELECT_SYSTEM,
                format!("Question: {}\nStructure:\n{}", question, expanded),
            ))
            .await
        {
            Ok(reply) => parse_nodes_line(&reply, self.params.max_nodes),
            Err(e) => {
                warn!(error = %e, "node selection failed");
                Vec::new()
            }
        };
        if picked.is_empty() {
            file_ids.iter().take(2).cloned().collect()
        } else {
            picked
        }
    }

    /// Optional structured-data step. Returns the context block and, when a
    /// query ran, its evidence. Every failure here is logged and skipped.
    async fn enrich_with_data(
        &self,
        question: &str,
        evidence: &[Evidence],
    ) -> Option<(String, Option<Evidence>)> {
        let tables: Vec<&Evidence> = evidence
            .iter()
            .filter(|e| e.is_table())
            .take(self.params.max_tables)
            .collect();
        let files = if tables.is_empty() {
            if !is_data_question(question) {
                return None;
            }
            json!([{"id": "unknown", "schema": "(no preview available; column names may be needed)", "sample": ""}])
        } else {
            describe_tables(tables)
        };

        let payload = json!({"question": question, "files": files}).to_string();
        let reply = match self
            .completer
            .complete(&Prompt::new(DATA_DECISION_SYSTEM, payload))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "data decision failed");
                return None;
            }
        };
        let decision = extract_json_object(&reply)?;
        let mode = decision
            .get("mode")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        debug!(%mode, "data decision");

        if mode != "sql" {
            let answer = decision.get("answer").and_then(|v| v.as_str())?;
            return Some((format!("Structured analysis: {}", answer), None));
        }

        let raw_sql = decision.get("sql").and_then(|v| v.as_str()).unwrap_or_default();
        let sql = match sanitize_sql(raw_sql) {
            Ok(sql) => sql,
            Err(e) => {
                warn!(error = %e, sql = raw_sql, "query rejected");
                return None;
            }
        };
        info!(%sql, "running query");
        match self.backend.run_query(&sql).await {
            Ok(rows) => Some((
                format!("Query: {}\nRows: {}", rows.sql, rows_preview(&rows)),
                Some(Evidence::Query {
                    sql: rows.sql,
                    rows: rows.rows,
                }),
            )),
            Err(e) => {
                warn!(error = %e, %sql, "query failed");
                None
            }
        }
    }

    /// Ask the model for one SELECT over `tables` and return it sanitized.
    pub async fn write_query(
        &self,
        question: &str,
        tables: &[&Evidence],
    ) -> Result<String, PipelineError> {
        let payload = json!({
            "question": question,
            "tables": describe_tables(tables.iter().copied()),
        })
        .to_string();
        let reply = self
            .completer
            .complete(&Prompt::new(WRITE_QUERY_SYSTEM, payload))
            .await?;

        let raw = match extract_json_object(&reply) {
            Some(obj) => obj
                .get("sql")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_default(),
            None => strip_code_fences(&reply),
        };
        if raw.trim().is_empty() {
            return Err(PipelineError::QueryError(
                "model did not produce a query".to_string(),
            ));
        }
        sanitize_sql(&raw)
    }

    /// Turn query rows into a sentence grounded in the returned values.
    pub async fn interpret_rows(
        &self,
        question: &str,
        rows: &QueryRows,
    ) -> Result<String, PipelineError> {
        self.completer
            .complete(&Prompt::new(
                INTERPRET_SYSTEM,
                format!(
                    "Question: {}\nQuery: {}\nReturned rows: {}",
                    question,
                    rows.sql,
                    rows_preview(rows)
                ),
            ))
            .await
    }
}

/// Serialized rows, truncated for prompts.
pub fn rows_preview(rows: &QueryRows) -> String {
    let text = serde_json::to_string(&rows.rows).unwrap_or_default();
    truncate_chars(&text, ROWS_PROMPT_CHARS)
}

fn format_leaves(leaves: &[Leaf]) -> String {
    leaves
        .iter()
        .map(|l| {
            let hit = if l.hit { " [HIT]" } else { "" };
            format!("# Leaf {}{}\n{}", l.id, hit, l.context)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

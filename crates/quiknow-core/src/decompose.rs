//! Task decomposition into independent sub-questions.
//!
//! Sub-questions are kept coarse and flat: each must be answerable from the
//! task and the orientation answer alone, so a wrong or failed answer never
//! feeds another one.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::ask::is_data_question;
use crate::completion::{Completer, Prompt};
use crate::error::PipelineError;
use crate::models::{truncate_chars, Answer, Evidence, Modality, SubQuestion, Task};
use crate::parse::parse_sub_questions;

/// Orientation text shown to the decomposition prompt.
const ORIENTATION_PROMPT_CHARS: usize = 4000;

fn decompose_system(min: usize, max: usize) -> String {
    format!(
        "Decompose the task into between {min} and {max} independent sub-questions that \
         together cover its different aspects. Each sub-question must be answerable on its own \
         from the task and the initial answer; never refer to another sub-question or to its \
         answer. Avoid questions that a single atomic fact would answer. Tag each with modality \
         \"data\" when it needs a query over the listed tables, otherwise \"document\". Output \
         only a JSON array such as [{{\"question\": \"...\", \"modality\": \"document\"}}]."
    )
}

/// Produces bounded, flat sets of [`SubQuestion`]s.
pub struct Decomposer {
    completer: Arc<dyn Completer>,
    min_sub_questions: usize,
    max_sub_questions: usize,
}

impl Decomposer {
    pub fn new(completer: Arc<dyn Completer>, min_sub_questions: usize, max_sub_questions: usize) -> Self {
        Self {
            completer,
            min_sub_questions: min_sub_questions.max(1),
            max_sub_questions: max_sub_questions.max(min_sub_questions.max(1)),
        }
    }

    /// Decompose `task`. Returns an empty list when the model fails or
    /// proposes fewer than the minimum number of sub-questions.
    pub async fn decompose(&self, task: &Task, orientation: &Answer) -> Vec<SubQuestion> {
        match self.try_decompose(task, orientation).await {
            Ok(questions) => questions,
            Err(e) => {
                warn!(error = %e, "decomposition failed");
                Vec::new()
            }
        }
    }

    /// Like [`decompose`](Self::decompose), but reports why nothing was produced.
    pub async fn try_decompose(
        &self,
        task: &Task,
        orientation: &Answer,
    ) -> Result<Vec<SubQuestion>, PipelineError> {
        let tables: Vec<serde_json::Value> = orientation
            .tables()
            .filter_map(|e| match e {
                Evidence::Table { node_id, schema, .. } => {
                    Some(json!({"id": node_id, "schema": schema}))
                }
                _ => None,
            })
            .collect();

        let mut user = format!(
            "Task: {}\n\nInitial answer:\n{}",
            task.text,
            truncate_chars(&orientation.text, ORIENTATION_PROMPT_CHARS)
        );
        if tables.is_empty() {
            user.push_str("\n\nNo data tables were found; tag every sub-question \"document\".");
        } else {
            user.push_str(&format!("\n\nData tables: {}", serde_json::Value::Array(tables)));
        }

        let reply = self
            .completer
            .complete(&Prompt::new(
                decompose_system(self.min_sub_questions, self.max_sub_questions),
                user,
            ))
            .await?;

        let has_tables = orientation.has_tables();
        let mut seen = HashSet::new();
        let questions: Vec<SubQuestion> = parse_sub_questions(&reply)
            .into_iter()
            .filter(|d| seen.insert(d.text.to_lowercase()))
            .take(self.max_sub_questions)
            .enumerate()
            .map(|(i, draft)| {
                let modality = if has_tables {
                    draft.modality.unwrap_or_else(|| {
                        if is_data_question(&draft.text) {
                            Modality::Data
                        } else {
                            Modality::Document
                        }
                    })
                } else {
                    Modality::Document
                };
                SubQuestion {
                    ordinal: i + 1,
                    text: draft.text,
                    modality,
                }
            })
            .collect();

        if questions.len() < self.min_sub_questions {
            debug!(count = questions.len(), min = self.min_sub_questions, "too few sub-questions");
            return Err(PipelineError::DecompositionEmpty);
        }
        info!(count = questions.len(), "decomposed task");
        Ok(questions)
    }
}

//! Resolution of a single sub-question.
//!
//! [`SubAnswerer::resolve`] records query errors, empty retrieval, and model
//! failures on the returned [`SubAnswer`], so one bad sub-question cannot
//! take its siblings down with it. Only a lost backend connection is
//! returned as an error, since no sibling can succeed without it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ask::AskEngine;
use crate::error::PipelineError;
use crate::models::{Answer, Evidence, Modality, SubAnswer, SubQuestion};

/// Resolves sub-questions against the ask engine and the backend's data store.
pub struct SubAnswerer {
    engine: Arc<AskEngine>,
}

impl SubAnswerer {
    pub fn new(engine: Arc<AskEngine>) -> Self {
        Self { engine }
    }

    /// Resolve `sub_question` using the scope and tables found by `orientation`.
    ///
    /// Fails only with [`PipelineError::BackendUnavailable`].
    pub async fn resolve(
        &self,
        sub_question: &SubQuestion,
        orientation: &Answer,
    ) -> Result<SubAnswer, PipelineError> {
        debug!(ordinal = sub_question.ordinal, modality = sub_question.modality.as_str(), "resolving");
        let result = match sub_question.modality {
            Modality::Document => self.resolve_document(sub_question, orientation).await,
            Modality::Data => self.resolve_data(sub_question, orientation).await,
        };
        match result {
            Ok(answer) => {
                info!(ordinal = sub_question.ordinal, "sub-question answered");
                Ok(answer)
            }
            Err(e @ PipelineError::BackendUnavailable(_)) => {
                warn!(ordinal = sub_question.ordinal, error = %e, "backend lost while resolving");
                Err(e)
            }
            Err(e) => {
                warn!(ordinal = sub_question.ordinal, error = %e, "sub-question failed");
                Ok(SubAnswer::failed(sub_question, e.failure_reason(), e.to_string()))
            }
        }
    }

    async fn resolve_document(
        &self,
        sub_question: &SubQuestion,
        orientation: &Answer,
    ) -> Result<SubAnswer, PipelineError> {
        let answer = self
            .engine
            .answer(&sub_question.text, Some(&orientation.scope))
            .await?;
        if answer.retrieval_empty {
            return Err(PipelineError::RetrievalEmpty);
        }
        Ok(SubAnswer::ok(sub_question, answer.text, answer.evidence))
    }

    async fn resolve_data(
        &self,
        sub_question: &SubQuestion,
        orientation: &Answer,
    ) -> Result<SubAnswer, PipelineError> {
        let tables: Vec<&Evidence> = orientation
            .tables()
            .take(self.engine.params().max_tables)
            .collect();
        if tables.is_empty() {
            debug!(ordinal = sub_question.ordinal, "no tables in scope; answering from documents");
            return self.resolve_document(sub_question, orientation).await;
        }

        let sql = self.engine.write_query(&sub_question.text, &tables).await?;
        info!(ordinal = sub_question.ordinal, %sql, "running query");
        let rows = self.engine.backend().run_query(&sql).await?;
        let text = self.engine.interpret_rows(&sub_question.text, &rows).await?;

        Ok(SubAnswer::ok(
            sub_question,
            text,
            vec![Evidence::Query {
                sql: rows.sql,
                rows: rows.rows,
            }],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ask::AskParams;
    use crate::backend::memory::InMemoryBackend;
    use crate::completion::ScriptedCompleter;
    use crate::metrics::ContextMetrics;
    use crate::models::{FailureReason, Leaf, TreeScope};
    use serde_json::json;

    fn orientation_with_table() -> Answer {
        Answer {
            question: "Summarize Q1".into(),
            text: "Q1 sales are in sales.csv.".into(),
            evidence: vec![Evidence::Table {
                node_id: "t1".into(),
                schema: "region TEXT, amount REAL".into(),
                sample: "north,10".into(),
            }],
            keywords: vec![],
            scope: TreeScope { file_ids: vec!["f1".into()] },
            structure_nodes: vec![],
            retrieval_empty: false,
            metrics: ContextMetrics::default(),
        }
    }

    fn answerer(backend: InMemoryBackend, completer: ScriptedCompleter) -> SubAnswerer {
        SubAnswerer::new(Arc::new(AskEngine::new(
            Arc::new(backend),
            Arc::new(completer),
            AskParams::default(),
        )))
    }

    fn data_question(text: &str) -> SubQuestion {
        SubQuestion { ordinal: 2, text: text.into(), modality: Modality::Data }
    }

    #[tokio::test]
    async fn data_question_runs_query_and_interprets_rows() {
        let backend = InMemoryBackend::new()
            .with_query_rows("from sales", vec![json!({"region": "north", "total": 120})]);
        let completer = ScriptedCompleter::new()
            .on(
                "Write one read-only SQL",
                r#"{"sql": "SELECT region, SUM(amount) AS total FROM sales GROUP BY region"}"#,
            )
            .on("returned rows", "North totalled 120.");

        let answer = answerer(backend, completer)
            .resolve(&data_question("Totals by region"), &orientation_with_table())
            .await
            .unwrap();
        assert!(answer.is_ok());
        assert_eq!(answer.text, "North totalled 120.");
        assert_eq!(answer.evidence_weight(), 3);
    }

    #[tokio::test]
    async fn query_error_is_recorded_not_raised() {
        let backend = InMemoryBackend::new().with_query_error("from returns", "no such table: returns");
        let completer = ScriptedCompleter::new()
            .on("Write one read-only SQL", r#"{"sql": "SELECT COUNT(*) FROM returns"}"#);

        let answer = answerer(backend, completer)
            .resolve(&data_question("How many returns?"), &orientation_with_table())
            .await
            .unwrap();
        assert_eq!(answer.failure_reason(), Some(FailureReason::QueryError));
        assert_eq!(answer.ordinal, 2);
    }

    #[tokio::test]
    async fn unsafe_query_is_a_query_error() {
        let completer = ScriptedCompleter::new()
            .on("Write one read-only SQL", r#"{"sql": "DELETE FROM sales"}"#);
        let answer = answerer(InMemoryBackend::new(), completer)
            .resolve(&data_question("Wipe it"), &orientation_with_table())
            .await
            .unwrap();
        assert_eq!(answer.failure_reason(), Some(FailureReason::QueryError));
    }

    #[tokio::test]
    async fn document_question_uses_orientation_scope() {
        let backend = InMemoryBackend::new()
            .with_expansion("f1", "memo.md #id:n1")
            .with_leaf(
                "n1",
                Leaf { id: "l1".into(), context: "Stores cited weather.".into(), node_type: "leaf".into(), hit: true },
            );
        let completer = ScriptedCompleter::new()
            .on("NODES:", "NODES: n1")
            .on("using only the context", "Weather was cited.");
        let question = SubQuestion { ordinal: 1, text: "Why?".into(), modality: Modality::Document };

        let answer = answerer(backend, completer)
            .resolve(&question, &orientation_with_table())
            .await
            .unwrap();
        assert!(answer.is_ok());
        assert_eq!(answer.evidence_weight(), 2);
    }

    #[tokio::test]
    async fn empty_retrieval_fails_the_sub_answer() {
        let completer = ScriptedCompleter::new();
        let question = SubQuestion { ordinal: 3, text: "Unknown?".into(), modality: Modality::Document };
        // f1 has no expansion configured, so expand reports a tool error.
        let answer = answerer(InMemoryBackend::new(), completer)
            .resolve(&question, &orientation_with_table())
            .await
            .unwrap();
        assert_eq!(answer.failure_reason(), Some(FailureReason::RetrievalEmpty));
    }

    #[tokio::test]
    async fn lost_backend_is_returned_not_recorded() {
        let backend = InMemoryBackend::new();
        backend.set_unavailable(true);
        let completer = ScriptedCompleter::new()
            .on("Write one read-only SQL", r#"{"sql": "SELECT COUNT(*) FROM sales"}"#);
        let result = answerer(backend, completer)
            .resolve(&data_question("How many sales?"), &orientation_with_table())
            .await;
        assert!(matches!(result, Err(PipelineError::BackendUnavailable(_))));
    }
}

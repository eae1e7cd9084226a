//! Merging sub-answers into one report.
//!
//! Triage happens before the model sees anything: failed sub-answers are
//! excluded with their reason, and redundant ones are excluded in favour
//! of the better-grounded duplicate. Only the survivors and the
//! orientation answer reach the synthesis prompt.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::completion::{Completer, Prompt};
use crate::models::{
    truncate_chars, Answer, AnswerStatus, Degradation, Evidence, Exclusion, ExclusionReason,
    FailureReason, Report, SubAnswer, Task,
};

/// Shortest normalized text that counts as contained in another answer.
const CONTAINMENT_MIN_CHARS: usize = 40;

const SYNTHESIS_SYSTEM: &str = "Merge the findings below into one structured report with these \
sections: 1. Summary 2. Key findings 3. Evidence 4. Risks and uncertainty 5. Next steps. \
Use only the initial answer and the findings. Merge overlapping content instead of repeating it. \
When two findings contradict each other, prefer the one with the higher evidence_weight; on a \
tie prefer the lower finding id, and mention the discrepancy under Risks and uncertainty.";

/// Included and excluded sub-answers after triage.
#[derive(Debug)]
pub struct Triage<'a> {
    /// Ok, non-redundant answers ranked by evidence weight, then ordinal.
    pub included: Vec<&'a SubAnswer>,
    /// Sorted by ordinal.
    pub excluded: Vec<Exclusion>,
}

/// Lowercased alphanumeric text with collapsed whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_redundant(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (short, long) = if a.chars().count() <= b.chars().count() { (a, b) } else { (b, a) };
    short.chars().count() >= CONTAINMENT_MIN_CHARS && long.contains(short)
}

/// Split sub-answers into included and excluded.
pub fn triage(sub_answers: &[SubAnswer]) -> Triage<'_> {
    let mut excluded = Vec::new();
    let mut ranked: Vec<&SubAnswer> = Vec::new();
    for answer in sub_answers {
        match &answer.status {
            AnswerStatus::Ok => ranked.push(answer),
            AnswerStatus::Failed { reason, detail } => excluded.push(Exclusion {
                ordinal: answer.ordinal,
                question: answer.question.clone(),
                reason: ExclusionReason::Failed {
                    reason: *reason,
                    detail: detail.clone(),
                },
            }),
        }
    }
    ranked.sort_by(|a, b| {
        b.evidence_weight()
            .cmp(&a.evidence_weight())
            .then(a.ordinal.cmp(&b.ordinal))
    });

    let mut included: Vec<(&SubAnswer, String)> = Vec::new();
    for answer in ranked {
        let normalized = normalize_text(&answer.text);
        let duplicate_of = included
            .iter()
            .find(|(_, kept)| is_redundant(kept, &normalized))
            .map(|(kept, _)| kept.ordinal);
        match duplicate_of {
            Some(duplicate_of) => excluded.push(Exclusion {
                ordinal: answer.ordinal,
                question: answer.question.clone(),
                reason: ExclusionReason::Redundant { duplicate_of },
            }),
            None => included.push((answer, normalized)),
        }
    }
    excluded.sort_by_key(|e| e.ordinal);

    Triage {
        included: included.into_iter().map(|(a, _)| a).collect(),
        excluded,
    }
}

fn evidence_summary(evidence: &Evidence) -> String {
    match evidence {
        Evidence::Excerpt { node_id, text, hit } => format!(
            "excerpt {}{}: {}",
            node_id,
            if *hit { " [HIT]" } else { "" },
            truncate_chars(text, 300)
        ),
        Evidence::Table { node_id, schema, .. } => format!("table {}: {}", node_id, schema),
        Evidence::Query { sql, rows } => format!(
            "query `{}` returned {} rows: {}",
            sql,
            rows.len(),
            truncate_chars(&serde_json::to_string(rows).unwrap_or_default(), 500)
        ),
    }
}

/// Deterministic report used when no model call is possible or wanted.
pub fn assemble(
    task: &Task,
    orientation: &Answer,
    sub_answers: &[SubAnswer],
    degradation: Degradation,
) -> Report {
    let triage = triage(sub_answers);
    let mut text = format!("## Summary\n\n{}\n", orientation.text.trim());
    if !triage.included.is_empty() {
        text.push_str("\n## Key findings\n");
        let mut by_ordinal = triage.included.clone();
        by_ordinal.sort_by_key(|a| a.ordinal);
        for answer in by_ordinal {
            text.push_str(&format!(
                "\n### {}. {}\n\n{}\n",
                answer.ordinal,
                answer.question,
                answer.text.trim()
            ));
        }
    }
    text.push('\n');
    text.push_str(&degradation.notice());

    finish(task, text, triage, Some(degradation))
}

/// Report text for runs where no sub-answer survived.
pub fn orientation_only(task: &Task, orientation: &Answer, sub_answers: &[SubAnswer], degradation: Degradation) -> Report {
    let triage = triage(sub_answers);
    let text = format!("{}\n\n{}", orientation.text.trim(), degradation.notice());
    finish(task, text, triage, Some(degradation))
}

fn finish(task: &Task, text: String, triage: Triage<'_>, degradation: Option<Degradation>) -> Report {
    let mut included: Vec<usize> = triage.included.iter().map(|a| a.ordinal).collect();
    included.sort_unstable();
    Report {
        task: task.text.clone(),
        text,
        included,
        excluded: triage.excluded,
        degradation,
    }
}

/// Model-backed report synthesis.
pub struct Synthesizer {
    completer: Arc<dyn Completer>,
    prompt_chars: usize,
}

impl Synthesizer {
    pub fn new(completer: Arc<dyn Completer>, prompt_chars: usize) -> Self {
        Self {
            completer,
            prompt_chars,
        }
    }

    /// The JSON document sent to the model. Each text field is cut to its
    /// share of `prompt_chars` before serializing: a quarter for the task
    /// and the initial answer, the rest split evenly across findings.
    fn payload(&self, task: &Task, orientation: &Answer, included: &[&SubAnswer]) -> String {
        let head = (self.prompt_chars / 8).max(1);
        let per_finding = (self.prompt_chars - self.prompt_chars / 4) / included.len().max(1);
        let answer_chars = (per_finding / 2).max(1);

        let findings: Vec<serde_json::Value> = included
            .iter()
            .map(|a| {
                let evidence_chars = (per_finding / 2 / a.evidence.len().max(1)).max(1);
                json!({
                    "id": a.ordinal,
                    "question": truncate_chars(&a.question, answer_chars),
                    "modality": a.modality,
                    "answer": truncate_chars(&a.text, answer_chars),
                    "evidence_weight": a.evidence_weight(),
                    "evidence": a
                        .evidence
                        .iter()
                        .map(|e| truncate_chars(&evidence_summary(e), evidence_chars))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        json!({
            "task": truncate_chars(&task.text, head),
            "initial_answer": truncate_chars(&orientation.text, head),
            "findings": findings,
        })
        .to_string()
    }

    /// Merge the ok sub-answers and the orientation answer into a report.
    ///
    /// Never fails: with no surviving findings the report is the
    /// orientation plus a notice, and a failed model call falls back to
    /// [`assemble`].
    pub async fn synthesize(
        &self,
        task: &Task,
        orientation: &Answer,
        sub_answers: &[SubAnswer],
    ) -> Report {
        let triage = triage(sub_answers);
        if triage.included.is_empty() {
            let all_cancelled = !sub_answers.is_empty()
                && sub_answers
                    .iter()
                    .all(|a| a.failure_reason() == Some(FailureReason::Cancelled));
            let degradation = if all_cancelled {
                Degradation::Cancelled
            } else {
                Degradation::AllFailed
            };
            warn!(failed = sub_answers.len(), "no sub-answer survived; using initial answer");
            return orientation_only(task, orientation, sub_answers, degradation);
        }

        let payload = self.payload(task, orientation, &triage.included);

        info!(findings = triage.included.len(), excluded = triage.excluded.len(), "synthesizing report");
        match self
            .completer
            .complete(&Prompt::new(SYNTHESIS_SYSTEM, payload))
            .await
        {
            Ok(text) => finish(task, text, triage, None),
            Err(e) => {
                warn!(error = %e, "synthesis failed; assembling findings directly");
                assemble(
                    task,
                    orientation,
                    sub_answers,
                    Degradation::SynthesisFailed {
                        detail: e.to_string(),
                    },
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::ScriptedCompleter;
    use crate::metrics::ContextMetrics;
    use crate::models::{Modality, SubQuestion, TreeScope};

    fn sq(ordinal: usize) -> SubQuestion {
        SubQuestion { ordinal, text: format!("Question {}", ordinal), modality: Modality::Document }
    }

    fn ok(ordinal: usize, text: &str, evidence: Vec<Evidence>) -> SubAnswer {
        SubAnswer::ok(&sq(ordinal), text.into(), evidence)
    }

    fn query() -> Evidence {
        Evidence::Query { sql: "SELECT 1".into(), rows: vec![] }
    }

    fn orientation() -> Answer {
        Answer {
            question: "task".into(),
            text: "Sales dipped in March.".into(),
            evidence: vec![],
            keywords: vec![],
            scope: TreeScope::default(),
            structure_nodes: vec![],
            retrieval_empty: false,
            metrics: ContextMetrics::default(),
        }
    }

    #[test]
    fn normalization_ignores_case_and_punctuation() {
        assert_eq!(normalize_text("  North, sold 120!\n"), "north sold 120");
    }

    #[test]
    fn failed_answers_are_excluded_with_reason() {
        let answers = vec![
            ok(1, "a", vec![]),
            SubAnswer::failed(&sq(2), FailureReason::QueryError, "no such table"),
        ];
        let t = triage(&answers);
        assert_eq!(t.included.len(), 1);
        assert_eq!(t.excluded.len(), 1);
        assert!(matches!(
            t.excluded[0].reason,
            ExclusionReason::Failed { reason: FailureReason::QueryError, .. }
        ));
    }

    #[test]
    fn duplicate_keeps_better_grounded_answer() {
        let answers = vec![
            ok(1, "North sold 120 units.", vec![]),
            ok(2, "north sold 120 units", vec![query()]),
        ];
        let t = triage(&answers);
        assert_eq!(t.included.iter().map(|a| a.ordinal).collect::<Vec<_>>(), vec![2]);
        assert_eq!(t.excluded[0].reason, ExclusionReason::Redundant { duplicate_of: 2 });
    }

    #[test]
    fn long_contained_text_is_redundant_short_is_not() {
        let long = "Returns were concentrated in the northern stores during March";
        let answers = vec![
            ok(1, &format!("{} after the product recall.", long), vec![]),
            ok(2, long, vec![]),
            ok(3, "March", vec![]),
        ];
        let t = triage(&answers);
        let included: Vec<usize> = t.included.iter().map(|a| a.ordinal).collect();
        assert_eq!(included, vec![1, 3]);
    }

    #[tokio::test]
    async fn all_failed_degrades_to_orientation() {
        let synth = Synthesizer::new(Arc::new(ScriptedCompleter::new()), 12000);
        let task = Task::new("Summarize Q1").unwrap();
        let answers = vec![
            SubAnswer::failed(&sq(1), FailureReason::Timeout, "slow"),
            SubAnswer::failed(&sq(2), FailureReason::QueryError, "bad"),
        ];
        let report = synth.synthesize(&task, &orientation(), &answers).await;
        assert_eq!(report.degradation, Some(Degradation::AllFailed));
        assert!(report.text.starts_with("Sales dipped in March."));
        assert!(report.text.contains("deeper analysis was unavailable"));
        assert!(report.included.is_empty());
        assert_eq!(report.excluded.len(), 2);
    }

    #[tokio::test]
    async fn synthesis_failure_assembles_findings() {
        let completer = ScriptedCompleter::new().fail_on("structured report", "HTTP 500");
        let synth = Synthesizer::new(Arc::new(completer), 12000);
        let task = Task::new("Summarize Q1").unwrap();
        let answers = vec![ok(1, "North fell 10%.", vec![query()])];
        let report = synth.synthesize(&task, &orientation(), &answers).await;
        assert!(matches!(report.degradation, Some(Degradation::SynthesisFailed { .. })));
        assert!(report.text.contains("North fell 10%."));
        assert_eq!(report.included, vec![1]);
    }

    #[tokio::test]
    async fn long_fields_are_cut_before_serializing() {
        let completer = Arc::new(ScriptedCompleter::new().on("structured report", "REPORT"));
        let synth = Synthesizer::new(completer.clone(), 100);
        let task = Task::new("Summarize Q1").unwrap();
        let answers = vec![ok(1, &"x".repeat(500), vec![])];
        let report = synth.synthesize(&task, &orientation(), &answers).await;
        assert_eq!(report.text, "REPORT");
        assert_eq!(report.degradation, None);

        let payload: serde_json::Value = serde_json::from_str(&completer.calls()[0].user).unwrap();
        assert_eq!(payload["findings"][0]["answer"].as_str().unwrap().chars().count(), 37);
        assert_eq!(payload["initial_answer"], "Sales dipped");
    }

    #[tokio::test]
    async fn long_initial_answer_keeps_findings_in_the_prompt() {
        let completer = Arc::new(ScriptedCompleter::new().on("structured report", "REPORT"));
        let synth = Synthesizer::new(completer.clone(), 12_000);
        let task = Task::new("Summarize Q1").unwrap();
        let mut long = orientation();
        long.text = "Sales dipped in March. ".repeat(600);
        let answers = vec![
            ok(1, "North fell 10%.", vec![query()]),
            ok(2, "A supplier outage caused the March dip.", vec![]),
        ];
        synth.synthesize(&task, &long, &answers).await;

        let user = &completer.calls()[0].user;
        let payload: serde_json::Value = serde_json::from_str(user).unwrap();
        let findings = payload["findings"].as_array().unwrap();
        assert_eq!(findings.len(), 2);
        assert!(user.contains("North fell 10%."));
        assert!(user.contains("A supplier outage caused the March dip."));
        assert_eq!(payload["initial_answer"].as_str().unwrap().chars().count(), 1_500);
    }
}

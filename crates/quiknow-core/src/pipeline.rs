//! The report pipeline: Ask → Decompose → Resolve-all → Synthesize.
//!
//! Sub-questions are resolved concurrently under a semaphore, each with its
//! own timeout. Synthesis waits until every sub-question has reached a
//! terminal state. A [`CancellationToken`] stops the run at any stage and
//! hands back what was completed as a [`PartialRun`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ask::{AskEngine, AskParams};
use crate::backend::KnowledgeBackend;
use crate::completion::Completer;
use crate::decompose::Decomposer;
use crate::error::PipelineError;
use crate::metrics::ContextMetrics;
use crate::models::{
    Answer, Degradation, FailureReason, PartialRun, ReportRun, SubAnswer, SubQuestion, Task,
    TreeScope,
};
use crate::resolve::SubAnswerer;
use crate::synthesize::{self, Synthesizer};

/// Tunables for a report run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportParams {
    pub min_sub_questions: usize,
    pub max_sub_questions: usize,
    /// Sub-questions resolved at the same time.
    pub concurrency: usize,
    /// Budget for one sub-question, measured from when it starts running.
    pub sub_question_timeout: Duration,
    pub synthesis_prompt_chars: usize,
}

impl Default for ReportParams {
    fn default() -> Self {
        Self {
            min_sub_questions: 1,
            max_sub_questions: 5,
            concurrency: 4,
            sub_question_timeout: Duration::from_secs(60),
            synthesis_prompt_chars: 12_000,
        }
    }
}

/// Stage transitions of a report run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Orienting,
    Decomposed { count: usize },
    Resolved { ordinal: usize, ok: bool, done: usize, total: usize },
    Synthesizing,
}

/// Receives [`ProgressEvent`]s. Called from the pipeline task; keep it cheap.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Discards progress.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub struct ReportPipeline {
    engine: Arc<AskEngine>,
    decomposer: Decomposer,
    answerer: SubAnswerer,
    synthesizer: Synthesizer,
    params: ReportParams,
    progress: Arc<dyn ProgressReporter>,
}

impl ReportPipeline {
    pub fn new(
        backend: Arc<dyn KnowledgeBackend>,
        completer: Arc<dyn Completer>,
        ask_params: AskParams,
        params: ReportParams,
    ) -> Self {
        let engine = Arc::new(AskEngine::new(backend, completer.clone(), ask_params));
        Self {
            decomposer: Decomposer::new(
                completer.clone(),
                params.min_sub_questions,
                params.max_sub_questions,
            ),
            answerer: SubAnswerer::new(engine.clone()),
            synthesizer: Synthesizer::new(completer, params.synthesis_prompt_chars),
            engine,
            params,
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn params(&self) -> &ReportParams {
        &self.params
    }

    pub fn engine(&self) -> &Arc<AskEngine> {
        &self.engine
    }

    /// Run the whole pipeline for `task`.
    ///
    /// Fails when the orientation pass cannot reach the backend or the
    /// model, when the backend is lost while sub-questions run, or when
    /// `cancel` fires. Every other problem degrades the report instead.
    pub async fn run(
        &self,
        task: Task,
        cancel: &CancellationToken,
    ) -> Result<ReportRun, PipelineError> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%id, task = %task.text, "report run started");

        self.progress.report(ProgressEvent::Orienting);
        let orientation = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(cancelled(task, None, Vec::new(), Vec::new(), started_at));
            }
            answer = self.engine.answer(&task.text, None) => answer?,
        };

        let decomposition = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(cancelled(task, Some(orientation), Vec::new(), Vec::new(), started_at));
            }
            d = self.decomposer.try_decompose(&task, &orientation) => d,
        };
        let sub_questions = match decomposition {
            Ok(questions) => questions,
            Err(e) => {
                warn!(%id, error = %e, "decomposition empty; reporting initial answer only");
                self.progress.report(ProgressEvent::Decomposed { count: 0 });
                let report = synthesize::orientation_only(
                    &task,
                    &orientation,
                    &[],
                    Degradation::DecompositionEmpty {
                        detail: e.to_string(),
                    },
                );
                return Ok(ReportRun {
                    id,
                    task,
                    orientation,
                    sub_questions: Vec::new(),
                    sub_answers: Vec::new(),
                    report,
                    started_at,
                    finished_at: Utc::now(),
                });
            }
        };
        self.progress.report(ProgressEvent::Decomposed {
            count: sub_questions.len(),
        });

        let sub_answers = self.resolve_all(&sub_questions, &orientation, cancel).await?;
        if cancel.is_cancelled() {
            return Err(cancelled(task, Some(orientation), sub_questions, sub_answers, started_at));
        }

        self.progress.report(ProgressEvent::Synthesizing);
        let report = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(cancelled(task, Some(orientation), sub_questions, sub_answers, started_at));
            }
            report = self.synthesizer.synthesize(&task, &orientation, &sub_answers) => report,
        };
        if let Some(degradation) = &report.degradation {
            warn!(%id, ?degradation, "report degraded");
        }
        info!(%id, included = report.included.len(), excluded = report.excluded.len(), "report run finished");

        Ok(ReportRun {
            id,
            task,
            orientation,
            sub_questions,
            sub_answers,
            report,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Resolve every sub-question and return one sub-answer per question,
    /// sorted by ordinal.
    ///
    /// Sub-questions still running or queued when `cancel` fires are
    /// recorded as failed with [`FailureReason::Cancelled`]. A lost backend
    /// connection drops every sub-question still in flight and is returned
    /// as [`PipelineError::BackendUnavailable`].
    pub async fn resolve_all(
        &self,
        sub_questions: &[SubQuestion],
        orientation: &Answer,
        cancel: &CancellationToken,
    ) -> Result<Vec<SubAnswer>, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.params.concurrency.max(1)));
        let timeout = self.params.sub_question_timeout;
        let total = sub_questions.len();

        let mut pending: FuturesUnordered<_> = sub_questions
            .iter()
            .map(move |sq| {
                let semaphore = semaphore.clone();
                let answerer = &self.answerer;
                async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return Ok(SubAnswer::failed(
                                sq,
                                FailureReason::Cancelled,
                                "worker pool closed",
                            ))
                        }
                    };
                    match tokio::time::timeout(timeout, answerer.resolve(sq, orientation)).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(ordinal = sq.ordinal, ?timeout, "sub-question timed out");
                            Ok(SubAnswer::failed(
                                sq,
                                FailureReason::Timeout,
                                format!("no answer within {:?}", timeout),
                            ))
                        }
                    }
                }
            })
            .collect();

        let mut answers: Vec<SubAnswer> = Vec::with_capacity(total);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(done = answers.len(), total, "cancelling in-flight sub-questions");
                    break;
                }
                next = pending.next() => match next {
                    Some(Err(e)) => {
                        warn!(done = answers.len(), total, error = %e, "backend lost; dropping remaining sub-questions");
                        return Err(e);
                    }
                    Some(Ok(answer)) => {
                        self.progress.report(ProgressEvent::Resolved {
                            ordinal: answer.ordinal,
                            ok: answer.is_ok(),
                            done: answers.len() + 1,
                            total,
                        });
                        answers.push(answer);
                    }
                    None => break,
                },
            }
        }
        drop(pending);

        for sq in sub_questions {
            if !answers.iter().any(|a| a.ordinal == sq.ordinal) {
                answers.push(SubAnswer::failed(
                    sq,
                    FailureReason::Cancelled,
                    "run cancelled before this sub-question finished",
                ));
            }
        }
        answers.sort_by_key(|a| a.ordinal);
        Ok(answers)
    }

    /// Build a degraded run from a cancelled one, without calling the model.
    pub fn assemble_partial(&self, partial: PartialRun) -> ReportRun {
        let orientation = partial.orientation.unwrap_or_else(|| Answer {
            question: partial.task.text.clone(),
            text: "The run was cancelled before an initial answer was produced.".to_string(),
            evidence: Vec::new(),
            keywords: Vec::new(),
            scope: TreeScope::default(),
            structure_nodes: Vec::new(),
            retrieval_empty: true,
            metrics: ContextMetrics::default(),
        });
        let report = synthesize::assemble(
            &partial.task,
            &orientation,
            &partial.sub_answers,
            Degradation::Cancelled,
        );
        ReportRun {
            id: Uuid::new_v4(),
            task: partial.task,
            orientation,
            sub_questions: partial.sub_questions,
            sub_answers: partial.sub_answers,
            report,
            started_at: partial.started_at,
            finished_at: Utc::now(),
        }
    }
}

fn cancelled(
    task: Task,
    orientation: Option<Answer>,
    sub_questions: Vec<SubQuestion>,
    sub_answers: Vec<SubAnswer>,
    started_at: chrono::DateTime<Utc>,
) -> PipelineError {
    warn!(task = %task.text, done = sub_answers.iter().filter(|a| a.is_ok()).count(), "report run cancelled");
    PipelineError::Cancelled(Box::new(PartialRun {
        task,
        orientation,
        sub_questions,
        sub_answers,
        started_at,
    }))
}

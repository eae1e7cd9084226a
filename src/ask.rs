//! `quiknow ask`: one-shot or interactive question answering.
//!
//! With a question on the command line, answers once and exits. Without
//! one, reads questions from stdin until an empty line. Each answer is also
//! written to the board file (`ask.board_path`) so another window can
//! follow along.
//!
//! The interactive loop connects on the first question. When the backend
//! drops out, the session is discarded and the next question reconnects.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

use quiknow_core::ask::{AskEngine, AskParams};
use quiknow_core::backend::KnowledgeBackend;
use quiknow_core::completion::Completer;
use quiknow_core::models::{Answer, Evidence};
use quiknow_core::PipelineError;

use crate::backend::McpBackend;
use crate::config::Config;
use crate::llm;

/// Render the board file for the latest question and answer.
pub fn render_board(question: &str, answer: &str) -> String {
    format!(
        "# Latest Q&A\n\n**Question**\n\n{}\n\n**Answer**\n\n{}\n",
        question, answer
    )
}

/// Overwrite the board file. Failures are logged, never returned.
pub fn write_board(path: &Path, question: &str, answer: &str) {
    if path.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = std::fs::write(path, render_board(question, answer)) {
        warn!(path = %path.display(), error = %e, "could not write board file");
    }
}

/// JSON shape printed by `ask --json`.
#[derive(Debug, Serialize)]
struct AskOutput<'a> {
    question: &'a str,
    answer: &'a str,
    keywords: &'a [String],
    chosen_files: &'a [String],
    structure_nodes: &'a [String],
    retrieval_empty: bool,
    evidence: &'a [Evidence],
    metrics: &'a quiknow_core::metrics::ContextMetrics,
}

fn print_answer(answer: &Answer, json: bool) -> Result<()> {
    if json {
        let out = AskOutput {
            question: &answer.question,
            answer: &answer.text,
            keywords: &answer.keywords,
            chosen_files: &answer.scope.file_ids,
            structure_nodes: &answer.structure_nodes,
            retrieval_empty: answer.retrieval_empty,
            evidence: &answer.evidence,
            metrics: &answer.metrics,
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}", answer.text);
    }
    Ok(())
}

struct Session<B> {
    backend: Arc<B>,
    engine: AskEngine,
}

/// Backend session for the interactive loop, opened on demand.
struct Reconnecting<B, F> {
    connect: F,
    completer: Arc<dyn Completer>,
    params: AskParams,
    session: Option<Session<B>>,
}

impl<B, F, Fut> Reconnecting<B, F>
where
    B: KnowledgeBackend + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Arc<B>, PipelineError>>,
{
    fn new(connect: F, completer: Arc<dyn Completer>, params: AskParams) -> Self {
        Self {
            connect,
            completer,
            params,
            session: None,
        }
    }

    async fn answer(&mut self, question: &str) -> Result<Answer, PipelineError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let backend = (self.connect)().await?;
                info!("backend session opened");
                let engine = AskEngine::new(backend.clone(), self.completer.clone(), self.params.clone());
                Session { backend, engine }
            }
        };
        let result = session.engine.answer(question, None).await;
        if let Err(PipelineError::BackendUnavailable(_)) = &result {
            warn!("backend session lost; reconnecting on the next question");
        } else {
            self.session = Some(session);
        }
        result
    }

    /// The open backend, if this loop holds the only handle to it.
    fn into_backend(self) -> Option<B> {
        let session = self.session?;
        drop(session.engine);
        Arc::try_unwrap(session.backend).ok()
    }
}

pub async fn run_ask(config: &Config, question: Option<String>, json: bool) -> Result<()> {
    let completer = llm::create_completer(&config.model, None)?;
    let board = config.ask.board_path.as_deref();

    if let Some(question) = question.filter(|q| !q.trim().is_empty()) {
        let backend = Arc::new(McpBackend::connect(&config.backend).await?);
        let engine = AskEngine::new(backend.clone(), completer, config.ask.params());
        let result = engine.answer(question.trim(), None).await;
        drop(engine);
        if let Ok(backend) = Arc::try_unwrap(backend) {
            backend.close().await;
        }
        let answer = result?;
        if let Some(board) = board {
            write_board(board, &answer.question, &answer.text);
        }
        return print_answer(&answer, json);
    }

    let mut session = Reconnecting::new(
        move || async move { McpBackend::connect(&config.backend).await.map(Arc::new) },
        completer,
        config.ask.params(),
    );
    eprintln!("Interactive ask mode (empty line exits)");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"question> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        if question.is_empty() {
            break;
        }
        match session.answer(question).await {
            Ok(answer) => {
                if let Some(board) = board {
                    write_board(board, &answer.question, &answer.text);
                }
                print_answer(&answer, json)?;
            }
            Err(e @ PipelineError::BackendUnavailable(_)) => {
                error!(error = %e, "backend unreachable; try again once it is back");
                eprintln!("error: {}", e);
            }
            Err(e) => {
                error!(error = %e, "ask failed");
                eprintln!("error: {}", e);
            }
        }
    }
    if let Some(backend) = session.into_backend() {
        backend.close().await;
    }
    Ok(())
}

//! `quiknow report`: multi-step report over the knowledge backend.
//!
//! Runs the report pipeline (orient, decompose, resolve every sub-question
//! concurrently, synthesize), then writes a markdown report file and prints
//! the report text (or the whole run as JSON).
//!
//! Ctrl-C cancels the in-flight sub-questions. The sub-answers finished so
//! far are assembled into a degraded report, which is still written.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quiknow_core::models::{AnswerStatus, ExclusionReason, ReportRun, Task};
use quiknow_core::pipeline::ReportPipeline;
use quiknow_core::PipelineError;

use crate::backend::McpBackend;
use crate::config::Config;
use crate::llm;
use crate::progress::ProgressMode;

pub struct ReportOptions<'a> {
    pub task: String,
    pub max_sub: Option<usize>,
    pub json: bool,
    pub output: Option<&'a Path>,
}

/// Render a run as the markdown written to the report file.
pub fn render_markdown(run: &ReportRun) -> String {
    let mut md = String::new();
    let _ = writeln!(md, "# Report\n");
    let _ = writeln!(md, "**Task**\n\n{}\n", run.task.text);

    let _ = writeln!(md, "**Sub-questions**\n");
    if run.sub_questions.is_empty() {
        let _ = writeln!(md, "_none_");
    }
    for sq in &run.sub_questions {
        let status = match run.sub_answer(sq.ordinal).map(|a| &a.status) {
            Some(AnswerStatus::Ok) => "ok".to_string(),
            Some(AnswerStatus::Failed { reason, .. }) => format!("failed: {}", reason),
            None => "not run".to_string(),
        };
        let _ = writeln!(
            md,
            "{}. {} ({}, {})",
            sq.ordinal,
            sq.text,
            sq.modality.as_str(),
            status
        );
    }

    let _ = writeln!(md, "\n**Final report**\n\n{}\n", run.report.text.trim_end());

    if !run.report.excluded.is_empty() {
        let _ = writeln!(md, "**Excluded**\n");
        for ex in &run.report.excluded {
            let why = match &ex.reason {
                ExclusionReason::Failed { reason, detail } => format!("{}: {}", reason, detail),
                ExclusionReason::Redundant { duplicate_of } => {
                    format!("redundant with #{}", duplicate_of)
                }
            };
            let _ = writeln!(md, "- #{} {} ({})", ex.ordinal, ex.question, why);
        }
    }
    md
}

pub async fn run_report(config: &Config, options: ReportOptions<'_>) -> Result<()> {
    let task = Task::new(options.task)?;

    let mut params = config.report.params();
    if let Some(max) = options.max_sub {
        params.max_sub_questions = max;
        params.min_sub_questions = params.min_sub_questions.min(max);
    }

    let completer = llm::create_completer(&config.model, None)?;
    let backend = Arc::new(McpBackend::connect(&config.backend).await?);
    let pipeline = ReportPipeline::new(backend.clone(), completer, config.ask.params(), params)
        .with_progress(ProgressMode::default_for_tty().reporter());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling report run");
            on_signal.cancel();
        }
    });

    let result = pipeline.run(task, &cancel).await;
    signal_task.abort();

    let run = match result {
        Ok(run) => Ok(run),
        Err(PipelineError::Cancelled(partial)) => Ok(pipeline.assemble_partial(*partial)),
        Err(e) => Err(e),
    };
    drop(pipeline);
    if let Ok(backend) = Arc::try_unwrap(backend) {
        backend.close().await;
    }
    let run = run.context("report run failed")?;

    if let Some(degradation) = &run.report.degradation {
        warn!(?degradation, "report is degraded");
    }

    let output = options.output.unwrap_or(&config.report.output_path);
    std::fs::write(output, render_markdown(&run))
        .with_context(|| format!("Failed to write report: {}", output.display()))?;
    info!(path = %output.display(), run = %run.id, "report written");

    if options.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        println!("{}", run.report.text);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiknow_core::ask::AskParams;
    use quiknow_core::backend::memory::InMemoryBackend;
    use quiknow_core::completion::ScriptedCompleter;
    use quiknow_core::pipeline::ReportParams;

    #[tokio::test]
    async fn markdown_lists_sub_questions_and_exclusions() {
        let backend = InMemoryBackend::new()
            .with_tree("docs/\n  memo.md #f1 [HIT]")
            .with_expansion("f1", "memo.md\n  #n1 section: March");
        let completer = ScriptedCompleter::new()
            .on("independent sub-questions", r#"["Why did March dip?", "Who approved the budget?"]"#)
            .on("most relevant files", "f1")
            .on("NODES:", "NODES: n1")
            .on("structured report", "Sales dipped in March.")
            .fallback("Sales dipped in March because of an outage.");
        let pipeline = ReportPipeline::new(
            Arc::new(backend),
            Arc::new(completer),
            AskParams::default(),
            ReportParams::default(),
        );
        let run = pipeline
            .run(Task::new("Summarize Q1").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let md = render_markdown(&run);
        assert!(md.starts_with("# Report"));
        assert!(md.contains("**Task**\n\nSummarize Q1"));
        assert!(md.contains("1. Why did March dip?"));
        assert!(md.contains("**Final report**"));
        let task_at = md.find("Summarize Q1").unwrap();
        let final_at = md.find("**Final report**").unwrap();
        assert!(task_at < final_at);
    }

    #[tokio::test]
    async fn backend_handle_is_released_after_the_run() {
        let backend = Arc::new(InMemoryBackend::new().with_tree("docs/\n  memo.md #f1 [HIT]"));
        let completer = ScriptedCompleter::new()
            .on("independent sub-questions", r#"["Why did March dip?"]"#)
            .fallback("March dipped.");
        let pipeline = ReportPipeline::new(
            backend.clone(),
            Arc::new(completer),
            AskParams::default(),
            ReportParams::default(),
        );
        pipeline
            .run(Task::new("Summarize Q1").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        drop(pipeline);
        assert!(Arc::try_unwrap(backend).is_ok());
    }
}

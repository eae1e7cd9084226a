//! Report and build progress on stderr.
//!
//! `quiknow report` shows each stage and every finished sub-question;
//! `quiknow status --wait` shows each poll of a build job. Progress goes to
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

use quiknow_core::models::JobStatus;
use quiknow_core::pipeline::{NoProgress, ProgressEvent, ProgressReporter};

/// Human-friendly progress: "report  resolved 2/5  (#3 failed)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Orienting => "report  answering the question directly...\n".to_string(),
            ProgressEvent::Decomposed { count: 0 } => {
                "report  no sub-questions; using the direct answer\n".to_string()
            }
            ProgressEvent::Decomposed { count } => {
                format!("report  resolving {} sub-questions\n", count)
            }
            ProgressEvent::Resolved {
                ordinal,
                ok,
                done,
                total,
            } => format!(
                "report  resolved {}/{}  (#{} {})\n",
                done,
                total,
                ordinal,
                if *ok { "ok" } else { "failed" }
            ),
            ProgressEvent::Synthesizing => "report  synthesizing...\n".to_string(),
        };
        write_stderr(&line);
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        write_json(&event_json(&event));
    }
}

fn event_json(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Orienting => serde_json::json!({
            "event": "progress",
            "phase": "orienting"
        }),
        ProgressEvent::Decomposed { count } => serde_json::json!({
            "event": "progress",
            "phase": "decomposed",
            "count": count
        }),
        ProgressEvent::Resolved {
            ordinal,
            ok,
            done,
            total,
        } => serde_json::json!({
            "event": "progress",
            "phase": "resolving",
            "ordinal": ordinal,
            "ok": ok,
            "n": done,
            "total": total
        }),
        ProgressEvent::Synthesizing => serde_json::json!({
            "event": "progress",
            "phase": "synthesizing"
        }),
    }
}

fn write_stderr(line: &str) {
    let mut err = std::io::stderr().lock();
    let _ = err.write_all(line.as_bytes());
    let _ = err.flush();
}

fn write_json(obj: &serde_json::Value) {
    if let Ok(line) = serde_json::to_string(obj) {
        write_stderr(&format!("{}\n", line));
    }
}

/// Render a job poll: "build job-3  running  42%".
pub fn format_job_line(status: &JobStatus) -> String {
    let mut line = format!(
        "build {}  {}",
        status.job_id,
        serde_json::to_value(status.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    );
    if let Some(p) = status.progress {
        line.push_str(&format!("  {:.0}%", p * 100.0));
    }
    if let Some(msg) = &status.message {
        line.push_str(&format!("  {}", msg));
    }
    line
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Reporter for report runs.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }

    /// Emit one build-job poll.
    pub fn job(&self, status: &JobStatus) {
        match self {
            ProgressMode::Off => {}
            ProgressMode::Human => write_stderr(&format!("{}\n", format_job_line(status))),
            ProgressMode::Json => write_json(&serde_json::json!({
                "event": "progress",
                "phase": "build",
                "job_id": status.job_id,
                "state": status.state,
                "progress": status.progress,
            })),
        }
    }
}

//! `quiknow build`, `quiknow status`, and `quiknow tree`.
//!
//! Thin commands over the backend's build and clustering tools. Results are
//! printed as pretty JSON on stdout.

use std::time::Duration;

use anyhow::{bail, Result};
use tracing::{info, warn};

use quiknow_core::backend::KnowledgeBackend;
use quiknow_core::models::{JobState, JobStatus};

use crate::backend::McpBackend;
use crate::config::Config;
use crate::progress::ProgressMode;

/// Poll `job_id` every `interval` until it reaches done or failed.
pub async fn wait_for_job(
    backend: &dyn KnowledgeBackend,
    job_id: &str,
    interval: Duration,
    progress: ProgressMode,
) -> Result<JobStatus> {
    loop {
        let status = backend.job_status(job_id).await?;
        progress.job(&status);
        if status.state.is_terminal() {
            return Ok(status);
        }
        tokio::time::sleep(interval).await;
    }
}

pub async fn run_build(
    config: &Config,
    path: Option<&str>,
    wait: bool,
    interval: Duration,
) -> Result<()> {
    let backend = McpBackend::connect(&config.backend).await?;
    let job = backend.start_document_build(path).await?;
    info!(job_id = %job.job_id, path = ?path, "build submitted");
    println!("{}", serde_json::to_string_pretty(&job.raw)?);

    if !wait {
        backend.close().await;
        return Ok(());
    }

    let result = wait_for_job(&backend, &job.job_id, interval, ProgressMode::default_for_tty()).await;
    backend.close().await;
    let status = result?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.state == JobState::Failed {
        warn!(job_id = %status.job_id, message = ?status.message, "build failed");
        bail!("build job {} failed", status.job_id);
    }
    Ok(())
}

pub async fn run_status(config: &Config, job_id: &str) -> Result<()> {
    let backend = McpBackend::connect(&config.backend).await?;
    let status = backend.job_status(job_id).await;
    backend.close().await;
    println!("{}", serde_json::to_string_pretty(&status?)?);
    Ok(())
}

pub async fn run_tree(config: &Config) -> Result<()> {
    let backend = McpBackend::connect(&config.backend).await?;
    let tree = backend.build_directory_tree().await;
    backend.close().await;
    println!("{}", serde_json::to_string_pretty(&tree?)?);
    Ok(())
}

//! `quiknow check`: model connectivity.
//!
//! Sends one tiny completion and prints a JSON health record to stdout.

use std::time::Instant;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::info;

use quiknow_core::completion::{Completer, Prompt};

use crate::config::Config;
use crate::llm::{self, normalize_base_url};

const CHECK_SYSTEM: &str = "health check";
const CHECK_USER: &str = "reply only OK";
const REPLY_CHARS: usize = 200;

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub model: String,
    pub protocol: String,
    pub base_url: String,
    pub status: String,
    pub latency_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn round_ms(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Run one completion against the configured model.
pub async fn check_model(config: &Config, model: Option<&str>) -> CheckReport {
    // One attempt: a health check should report, not wait out the backoff.
    let mut model_config = config.model.clone();
    model_config.max_retries = 0;

    let mut report = CheckReport {
        model: model.unwrap_or(&model_config.name).to_string(),
        protocol: model_config.protocol.clone(),
        base_url: normalize_base_url(&model_config.url),
        status: "error".to_string(),
        latency_sec: 0.0,
        reply: None,
        ok: None,
        error: None,
    };

    let start = Instant::now();
    let result = match llm::create_completer(&model_config, model) {
        Ok(completer) => completer
            .complete(&Prompt::new(CHECK_SYSTEM, CHECK_USER))
            .await
            .map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    report.latency_sec = round_ms(start.elapsed().as_secs_f64());

    match result {
        Ok(reply) => {
            report.status = "success".to_string();
            report.ok = Some(reply.to_uppercase().contains("OK"));
            report.reply = Some(reply.chars().take(REPLY_CHARS).collect());
        }
        Err(e) => report.error = Some(format!("{:#}", e)),
    }
    report
}

pub async fn run_check(config: &Config, model: Option<&str>) -> Result<()> {
    let report = check_model(config, model).await;
    info!(model = %report.model, status = %report.status, latency = report.latency_sec, "model check");
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.status != "success" {
        bail!("model check failed");
    }
    Ok(())
}

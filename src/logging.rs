//! Tracing setup.
//!
//! Logs go to stderr so stdout stays clean for JSON and answers. When
//! `logging.to_file` is set they are also appended, without ANSI colours,
//! to `<logging.dir>/quiknow.log`. `RUST_LOG` replaces the configured
//! filter entirely.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "quiknow.log";

/// Filter directive for `level`: our crates at `level`, everything else at `warn`.
pub fn default_filter(level: &str) -> String {
    format!("warn,quiknow={level},quiknow_core={level}")
}

/// Install the global subscriber. `verbose` forces `debug`.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let file_layer = if config.to_file {
        std::fs::create_dir_all(&config.dir)
            .with_context(|| format!("Failed to create log directory: {}", config.dir.display()))?;
        let path = config.dir.join(LOG_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Mutex::new(file)),
        )
    } else {
        None
    };

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .with_target(false);

    // A subscriber may already be installed (tests, embedding callers).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    Ok(())
}

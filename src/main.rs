//! # QuiKnow CLI (`quiknow`)
//!
//! ## Usage
//!
//! ```bash
//! quiknow --config ./config/quiknow.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `quiknow check` | Send one completion to the configured model |
//! | `quiknow build [--path P]` | Start a document build on the backend |
//! | `quiknow status --job ID` | Show a build job's status |
//! | `quiknow tree` | Cluster indexed content into a directory tree |
//! | `quiknow ask [QUESTION]` | Answer one question, or start interactive mode |
//! | `quiknow report <TASK>` | Decompose, research, and synthesize a report |
//!
//! Running `quiknow` with no command starts interactive `ask`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use quiknow::report::ReportOptions;
use quiknow::{ask, check, config, jobs, logging, report};

/// QuiKnow: question answering and multi-step reports over your documents
/// and data.
///
/// Configuration is read from `--config` (default `./config/quiknow.toml`;
/// built-in defaults apply when that file does not exist). See
/// `config/quiknow.example.toml` for every setting.
#[derive(Parser)]
#[command(
    name = "quiknow",
    about = "QuiKnow: question answering and multi-step reports over your documents and data",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the language model answers.
    ///
    /// Prints a JSON record with the model, endpoint, latency, and reply.
    /// Exits non-zero when the call fails.
    Check {
        /// Model name to test instead of `model.name`.
        #[arg(long)]
        model: Option<String>,
    },

    /// Start a document or data build on the knowledge backend.
    Build {
        /// File or directory to ingest (backend default when omitted).
        #[arg(long)]
        path: Option<String>,

        /// Poll the job until it finishes. Exits non-zero if it failed.
        #[arg(long)]
        wait: bool,

        /// Seconds between polls with `--wait` (at least 0.1).
        #[arg(long, default_value = "2", value_parser = parse_interval)]
        interval: Duration,
    },

    /// Show the status of a build job.
    Status {
        /// Job id returned by `build`.
        #[arg(long)]
        job: String,
    },

    /// Cluster indexed content into a navigable directory tree.
    Tree,

    /// Answer a question from the indexed content.
    ///
    /// Without a question, reads questions from stdin until an empty line.
    Ask {
        /// The question (may be several words without quotes).
        question: Vec<String>,

        /// Print the answer with its evidence and metrics as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Produce a multi-step report for a task.
    ///
    /// Answers the task directly, splits it into independent sub-questions,
    /// resolves them concurrently, and merges the findings. Ctrl-C keeps
    /// whatever finished.
    Report {
        /// The task (may be several words without quotes).
        #[arg(required = true)]
        task: Vec<String>,

        /// Upper bound on sub-questions (1-20).
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..=20))]
        max_sub: Option<u16>,

        /// Print the full run as JSON instead of the report text.
        #[arg(long)]
        json: bool,

        /// Markdown output file (default `report.output_path`).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Seconds as a positive, finite [`Duration`].
fn parse_interval(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    if !(secs > 0.0) {
        return Err(format!("interval must be > 0, got {}", value));
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid interval '{}': {}", value, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_or_default(cli.config.as_deref())?;
    logging::init(&cfg.logging, cli.verbose)?;

    match cli.command.unwrap_or(Commands::Ask {
        question: Vec::new(),
        json: false,
    }) {
        Commands::Check { model } => {
            check::run_check(&cfg, model.as_deref()).await?;
        }
        Commands::Build {
            path,
            wait,
            interval,
        } => {
            let interval = interval.max(MIN_POLL_INTERVAL);
            jobs::run_build(&cfg, path.as_deref(), wait, interval).await?;
        }
        Commands::Status { job } => {
            jobs::run_status(&cfg, &job).await?;
        }
        Commands::Tree => {
            jobs::run_tree(&cfg).await?;
        }
        Commands::Ask { question, json } => {
            let question = (!question.is_empty()).then(|| question.join(" "));
            ask::run_ask(&cfg, question, json).await?;
        }
        Commands::Report {
            task,
            max_sub,
            json,
            output,
        } => {
            report::run_report(
                &cfg,
                ReportOptions {
                    task: task.join(" "),
                    max_sub: max_sub.map(usize::from),
                    json,
                    output: output.as_deref(),
                },
            )
            .await?;
        }
    }

    Ok(())
}

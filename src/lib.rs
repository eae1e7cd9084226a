//! # QuiKnow
//!
//! A command-line agent that answers questions over your documents and data.
//!
//! QuiKnow does no indexing of its own. Document ingestion, job tracking,
//! directory clustering, retrieval, and structured queries all live in an
//! external knowledge backend reached over MCP. QuiKnow orchestrates those
//! tools and a language model:
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌───────────────────┐
//! │   CLI    │──▶│  quiknow-core            │──▶│ knowledge backend │
//! │ (quiknow)│   │  ask / report pipeline   │   │   (MCP tools)     │
//! └──────────┘   └────────────┬─────────────┘   └───────────────────┘
//!                             ▼
//!                      ┌─────────────┐
//!                      │  LLM (HTTP) │
//!                      └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! quiknow check                        # is the model reachable?
//! quiknow build --path docs/ --wait    # ingest documents
//! quiknow tree                         # cluster into a directory tree
//! quiknow ask "Why did March sales dip?"
//! quiknow report "Summarize Q1 performance and explain the March dip"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`logging`] | tracing subscriber (stderr + log file) |
//! | [`llm`] | OpenAI-compatible and Anthropic completers |
//! | [`backend`] | MCP client implementing the knowledge backend |
//! | [`progress`] | Report and build progress on stderr |
//! | [`check`] | `quiknow check` |
//! | [`jobs`] | `quiknow build`, `status`, `tree` |
//! | [`ask`] | `quiknow ask` |
//! | [`report`] | `quiknow report` |

pub mod ask;
pub mod backend;
pub mod check;
pub mod config;
pub mod jobs;
pub mod llm;
pub mod logging;
pub mod progress;
pub mod report;

//! # QuiKnow Core
//!
//! Pipeline logic for QuiKnow: the data model, the error taxonomy, the
//! [`backend::KnowledgeBackend`] and [`completion::Completer`] traits, the
//! single-shot [`ask::AskEngine`], and the report pipeline built on top of it.
//!
//! This crate performs no network I/O and reads no configuration. The
//! application crate supplies an MCP-backed [`backend::KnowledgeBackend`]
//! and an HTTP-backed [`completion::Completer`]; tests use
//! [`backend::memory::InMemoryBackend`] and
//! [`completion::ScriptedCompleter`].
//!
//! ## Report pipeline
//!
//! ```text
//! task ──▶ AskEngine ──▶ Decomposer ──▶ SubAnswerer × N ──▶ Synthesizer ──▶ Report
//!          (orientation)               (concurrent,        (barrier)
//!                                       isolated failures)
//! ```

pub mod ask;
pub mod backend;
pub mod completion;
pub mod decompose;
pub mod error;
pub mod metrics;
pub mod models;
pub mod parse;
pub mod pipeline;
pub mod resolve;
pub mod sql;
pub mod synthesize;

pub use error::PipelineError;

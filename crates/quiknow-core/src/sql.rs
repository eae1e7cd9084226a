//! Guard for model-written SQL.
//!
//! Only single read-only `SELECT` statements reach the backend.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::PipelineError;

/// Row cap appended when the statement has no `LIMIT`.
pub const DEFAULT_ROW_LIMIT: usize = 200;

/// Longest statement accepted after the limit is appended.
pub const MAX_SQL_CHARS: usize = 2000;

const FORBIDDEN_WORDS: &[&str] = &[
    "attach", "pragma", "drop", "delete", "update", "insert", "alter", "create", "replace",
    "vacuum",
];

fn limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\blimit\b").expect("valid regex"))
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z_]+").expect("valid regex"))
}

/// Validate and normalize a statement.
///
/// Trailing semicolons are trimmed; any remaining `;`, comment marker, or
/// write/DDL keyword rejects the statement.
pub fn sanitize_sql(sql: &str) -> Result<String, PipelineError> {
    let stmt = sql.trim().trim_end_matches(';').trim();
    if stmt.is_empty() {
        return Err(PipelineError::QueryError("empty statement".to_string()));
    }
    if !stmt.to_ascii_lowercase().starts_with("select") {
        return Err(PipelineError::QueryError(
            "only SELECT statements are allowed".to_string(),
        ));
    }
    for marker in [";", "--", "/*"] {
        if stmt.contains(marker) {
            return Err(PipelineError::QueryError(format!(
                "forbidden token '{}' in statement",
                marker
            )));
        }
    }
    if let Some(word) = word_re()
        .find_iter(stmt)
        .map(|m| m.as_str().to_ascii_lowercase())
        .find(|w| FORBIDDEN_WORDS.contains(&w.as_str()))
    {
        return Err(PipelineError::QueryError(format!(
            "forbidden keyword '{}' in statement",
            word
        )));
    }

    let out = if limit_re().is_match(stmt) {
        stmt.to_string()
    } else {
        format!("{} LIMIT {}", stmt, DEFAULT_ROW_LIMIT)
    };
    if out.chars().count() > MAX_SQL_CHARS {
        return Err(PipelineError::QueryError(format!(
            "statement longer than {} characters",
            MAX_SQL_CHARS
        )));
    }
    Ok(out)
}

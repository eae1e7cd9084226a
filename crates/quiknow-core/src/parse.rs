//! Tolerant parsing of model output.
//!
//! Small local models rarely follow output formats exactly: they wrap JSON
//! in code fences, emit `<think>` blocks, return objects where arrays were
//! asked for, or fall back to bullet lists. Every stage that reads model
//! output goes through these helpers.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::models::Modality;

fn think_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"))
}

fn object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"))
}

fn question_field_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""question"\s*:\s*"(.+?)""#).expect("valid regex"))
}

fn nodes_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)NODES?\s*[:：]\s*(.+)").expect("valid regex"))
}

/// Remove `<think>…</think>` reasoning blocks.
pub fn strip_reasoning(text: &str) -> String {
    think_re().replace_all(text, "").trim().to_string()
}

/// Remove Markdown code fence lines (```` ```json ```` / ```` ``` ````).
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.contains("```") {
        return trimmed.to_string();
    }
    trimmed
        .lines()
        .filter(|l| !l.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Extract the first `{…}` span and parse it as a JSON object.
///
/// Retries with single quotes replaced by double quotes, which covers
/// models that answer with Python-style dict literals.
pub fn extract_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let raw = object_re().find(text)?.as_str();
    for candidate in [raw.to_string(), raw.replace('\'', "\"")] {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate) {
            return Some(map);
        }
    }
    None
}

/// Parse a comma or newline separated id list such as `#id:12, #id:7`.
pub fn parse_id_list(text: &str, limit: usize) -> Vec<String> {
    let mut ids = Vec::new();
    for raw in text.split([',', '，', '\n']) {
        let id = clean_id(raw);
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
        if ids.len() >= limit {
            break;
        }
    }
    ids
}

fn clean_id(raw: &str) -> String {
    let s = raw.trim();
    let s = s
        .strip_prefix("#id:")
        .or_else(|| s.strip_prefix("#id"))
        .or_else(|| s.strip_prefix('#'))
        .unwrap_or(s);
    s.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '[' || c == ']')
        .trim()
        .to_string()
}

/// Parse a `NODES: a,b,c` line. Returns an empty list when no such line exists.
pub fn parse_nodes_line(text: &str, limit: usize) -> Vec<String> {
    text.lines()
        .find_map(|line| nodes_re().captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| parse_id_list(m.as_str(), limit))
        .unwrap_or_default()
}

/// A sub-question as proposed by the model, before bounding and tagging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionDraft {
    pub text: String,
    pub modality: Option<Modality>,
}

impl QuestionDraft {
    fn new(text: &str, modality: Option<Modality>) -> Option<Self> {
        let text = text.trim().trim_matches('"').trim();
        if text.is_empty() {
            None
        } else {
            Some(Self {
                text: text.to_string(),
                modality,
            })
        }
    }
}

/// Parse a model-proposed list of sub-questions.
///
/// Accepts, in order of preference: a JSON array of strings or of
/// `{question|q, modality}` objects; a JSON object with a `questions` array;
/// `"question": "…"` fragments inside malformed JSON; and finally one
/// question per line.
pub fn parse_sub_questions(text: &str) -> Vec<QuestionDraft> {
    let cleaned = strip_code_fences(&strip_reasoning(text));

    if let Some(drafts) = parse_json_questions(&cleaned) {
        if !drafts.is_empty() {
            return drafts;
        }
    }

    let fragments: Vec<QuestionDraft> = question_field_re()
        .captures_iter(&cleaned)
        .filter_map(|c| c.get(1))
        .filter_map(|m| QuestionDraft::new(m.as_str(), None))
        .collect();
    if !fragments.is_empty() {
        return fragments;
    }

    parse_question_lines(&cleaned)
}

fn parse_json_questions(text: &str) -> Option<Vec<QuestionDraft>> {
    let value = serde_json::from_str::<Value>(text)
        .ok()
        .or_else(|| {
            // Leading or trailing chatter around an array.
            let start = text.find('[')?;
            let end = text.rfind(']')?;
            (start < end)
                .then(|| serde_json::from_str::<Value>(&text[start..=end]).ok())
                .flatten()
        })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("questions") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    Some(
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => QuestionDraft::new(s, None),
                Value::Object(obj) => {
                    let q = obj
                        .get("question")
                        .or_else(|| obj.get("q"))
                        .and_then(|v| v.as_str())?;
                    let modality = obj
                        .get("modality")
                        .and_then(|v| v.as_str())
                        .and_then(Modality::parse);
                    QuestionDraft::new(q, modality)
                }
                _ => None,
            })
            .collect(),
    )
}

fn parse_question_lines(text: &str) -> Vec<QuestionDraft> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| !(l.chars().count() <= 3 && l.starts_with(['[', ']', '{', '}', '-', '*'])))
        .filter(|l| !matches!(l.to_ascii_lowercase().as_str(), "json" | "array"))
        .filter_map(|l| {
            let mut s = l;
            if s.len() >= 2
                && ((s.starts_with('"') && s.ends_with('"'))
                    || (s.starts_with('\'') && s.ends_with('\'')))
            {
                s = &s[1..s.len() - 1];
            }
            let s = s.trim_start_matches(['-', '*']).trim_start();
            let s = strip_numbering(s);
            let s = strip_question_key(s);
            let s = s.trim_end_matches(',').trim();
            let len = s.chars().count();
            let only_punct = s.chars().all(|c| "[]{}:,\"".contains(c));
            if (2..=80).contains(&len) && !only_punct {
                QuestionDraft::new(s, None)
            } else {
                None
            }
        })
        .collect()
}

/// `1. foo` / `2) foo` → `foo`.
fn strip_numbering(s: &str) -> &str {
    let digits = s.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return s;
    }
    let rest = &s[digits..];
    rest.strip_prefix(['.', ')', '、'])
        .map(str::trim_start)
        .unwrap_or(s)
}

fn strip_question_key(s: &str) -> &str {
    let lower = s.to_ascii_lowercase();
    for key in ["\"question\":", "question:"] {
        if lower.starts_with(key) {
            return s[key.len()..].trim_start().trim_matches('"');
        }
    }
    s
}

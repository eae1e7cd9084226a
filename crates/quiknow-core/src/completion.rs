//! Text-completion abstraction.
//!
//! Every model call in the ask engine and the report pipeline goes through
//! [`Completer`]. The application crate provides HTTP implementations;
//! [`ScriptedCompleter`] is a deterministic fake for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PipelineError;

/// A single-turn prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// A fallible, latency-bearing text-completion capability.
#[async_trait]
pub trait Completer: Send + Sync {
    /// Model identifier, for logs and `check` output.
    fn model_name(&self) -> &str;

    /// Complete `prompt`. Implementations strip reasoning blocks before
    /// returning.
    async fn complete(&self, prompt: &Prompt) -> Result<String, PipelineError>;
}

struct Rule {
    needles: Vec<String>,
    reply: Result<String, String>,
    delay: Option<Duration>,
}

impl Rule {
    fn matches(&self, haystack: &str) -> bool {
        self.needles.iter().all(|n| haystack.contains(n.as_str()))
    }
}

/// Completer that answers from a list of substring rules.
///
/// A rule matches when all of its needles occur in the system prompt or
/// the user prompt. The first matching rule wins; unmatched prompts get the
/// fallback reply.
pub struct ScriptedCompleter {
    rules: Vec<Rule>,
    fallback: Result<String, String>,
    calls: Mutex<Vec<Prompt>>,
}

impl ScriptedCompleter {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: Ok(String::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `reply` when the prompt contains `needle`.
    pub fn on(self, needle: &str, reply: impl Into<String>) -> Self {
        self.on_all(&[needle], reply)
    }

    /// Reply with `reply` when the prompt contains every needle.
    pub fn on_all(mut self, needles: &[&str], reply: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needles: needles.iter().map(|s| s.to_string()).collect(),
            reply: Ok(reply.into()),
            delay: None,
        });
        self
    }

    /// Reply after `delay`.
    pub fn on_slow(mut self, needle: &str, reply: impl Into<String>, delay: Duration) -> Self {
        self.rules.push(Rule {
            needles: vec![needle.to_string()],
            reply: Ok(reply.into()),
            delay: Some(delay),
        });
        self
    }

    /// Fail with [`PipelineError::Completion`] when the prompt contains `needle`.
    pub fn fail_on(mut self, needle: &str, message: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needles: vec![needle.to_string()],
            reply: Err(message.into()),
            delay: None,
        });
        self
    }

    pub fn fallback(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Ok(reply.into());
        self
    }

    /// Fail every unmatched prompt.
    pub fn fail_by_default(mut self, message: impl Into<String>) -> Self {
        self.fallback = Err(message.into());
        self
    }

    /// Prompts received so far, in call order.
    pub fn calls(&self) -> Vec<Prompt> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls whose system or user prompt contains `needle`.
    pub fn count_calls(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|p| p.system.contains(needle) || p.user.contains(needle))
            .count()
    }
}

impl Default for ScriptedCompleter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Completer for ScriptedCompleter {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String, PipelineError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(prompt.clone());
        }
        let haystack = format!("{}\n{}", prompt.system, prompt.user);
        let (reply, delay) = match self.rules.iter().find(|r| r.matches(&haystack)) {
            Some(rule) => (rule.reply.clone(), rule.delay),
            None => (self.fallback.clone(), None),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        reply.map_err(PipelineError::Completion)
    }
}

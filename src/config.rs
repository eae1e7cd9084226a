//! Configuration loading.
//!
//! QuiKnow reads a TOML file (default `config/quiknow.toml`). Every section
//! and key is optional. A handful of environment variables override the
//! file so the same config can point at different backends or models:
//! `MCP_HOST`, `MCP_PORT`, `MCP_PATH`, `TOOL_TIMEOUT`, `MODEL_PROTOCOL`,
//! `MODEL_URL`, `MODEL_NAME`, and `LOG_LEVEL`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use quiknow_core::ask::AskParams;
use quiknow_core::pipeline::ReportParams;

/// Config path used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config/quiknow.toml";

/// Upper bound on `report.max_sub_questions`.
const SUB_QUESTION_CEILING: usize = 20;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub ask: AskConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The MCP knowledge backend (streamable HTTP).
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_mcp_path")]
    pub path: String,
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_mcp_path(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    /// Falls back to the default for values [`validate`] would reject.
    pub fn tool_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.tool_timeout_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_tool_timeout()))
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    9000
}
fn default_mcp_path() -> String {
    "/mcp".to_string()
}
fn default_tool_timeout() -> f64 {
    8.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// `openai` (any chat-completions endpoint, including Ollama), `anthropic`,
    /// or `google`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_model_url")]
    pub url: String,
    #[serde(default = "default_model_name")]
    pub name: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            url: default_model_url(),
            name: default_model_name(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_model_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl ModelConfig {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

fn default_protocol() -> String {
    "openai".to_string()
}
fn default_model_url() -> String {
    "127.0.0.1:11434/v1".to_string()
}
fn default_model_name() -> String {
    "qwen3:0.6b".to_string()
}
fn default_api_key_env() -> String {
    "MODEL_KEY".to_string()
}
fn default_model_timeout() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AskConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
    /// File that receives the latest question and answer. An empty path
    /// disables it.
    #[serde(default = "default_board_path")]
    pub board_path: Option<PathBuf>,
}

impl Default for AskConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_nodes: default_max_nodes(),
            board_path: default_board_path(),
        }
    }
}

impl AskConfig {
    pub fn params(&self) -> AskParams {
        AskParams {
            max_files: self.max_files,
            max_nodes: self.max_nodes,
            ..AskParams::default()
        }
    }
}

fn default_max_files() -> usize {
    5
}
fn default_max_nodes() -> usize {
    6
}
fn default_board_path() -> Option<PathBuf> {
    Some(PathBuf::from("ask.md"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportConfig {
    #[serde(default = "default_min_sub")]
    pub min_sub_questions: usize,
    #[serde(default = "default_max_sub")]
    pub max_sub_questions: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_sub_timeout")]
    pub sub_question_timeout_secs: u64,
    #[serde(default = "default_synthesis_chars")]
    pub synthesis_prompt_chars: usize,
    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            min_sub_questions: default_min_sub(),
            max_sub_questions: default_max_sub(),
            concurrency: default_concurrency(),
            sub_question_timeout_secs: default_sub_timeout(),
            synthesis_prompt_chars: default_synthesis_chars(),
            output_path: default_output_path(),
        }
    }
}

impl ReportConfig {
    pub fn params(&self) -> ReportParams {
        ReportParams {
            min_sub_questions: self.min_sub_questions,
            max_sub_questions: self.max_sub_questions,
            concurrency: self.concurrency,
            sub_question_timeout: Duration::from_secs(self.sub_question_timeout_secs),
            synthesis_prompt_chars: self.synthesis_prompt_chars,
        }
    }
}

fn default_min_sub() -> usize {
    1
}
fn default_max_sub() -> usize {
    5
}
fn default_concurrency() -> usize {
    4
}
fn default_sub_timeout() -> u64 {
    60
}
fn default_synthesis_chars() -> usize {
    12_000
}
fn default_output_path() -> PathBuf {
    PathBuf::from("report.md")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_to_file")]
    pub to_file: bool,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            to_file: default_to_file(),
            dir: default_log_dir(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_to_file() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// Load the config at `path`, or built-in defaults when `path` is `None`
/// and the default file does not exist.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if default.exists() {
                load_config(default)
            } else {
                let mut config = Config::default();
                apply_env_overrides(&mut config, |k| std::env::var(k).ok())?;
                validate(&config)?;
                Ok(config)
            }
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let mut config = parse_config(&content)?;
    apply_env_overrides(&mut config, |k| std::env::var(k).ok())?;
    validate(&config)?;
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse config file")
}

/// Apply environment overrides read through `lookup`.
pub fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(v) = lookup("MCP_HOST") {
        config.backend.host = v;
    }
    if let Some(v) = lookup("MCP_PORT") {
        config.backend.port = v
            .parse()
            .with_context(|| format!("MCP_PORT is not a port number: '{}'", v))?;
    }
    if let Some(v) = lookup("MCP_PATH") {
        config.backend.path = v;
    }
    if let Some(v) = lookup("TOOL_TIMEOUT") {
        config.backend.tool_timeout_secs = v
            .parse()
            .with_context(|| format!("TOOL_TIMEOUT is not a number: '{}'", v))?;
    }
    if let Some(v) = lookup("MODEL_PROTOCOL") {
        config.model.protocol = v.to_ascii_lowercase();
    }
    if let Some(v) = lookup("MODEL_URL") {
        config.model.url = v;
    }
    if let Some(v) = lookup("MODEL_NAME") {
        config.model.name = v;
    }
    if let Some(v) = lookup("LOG_LEVEL") {
        config.logging.level = v.to_ascii_lowercase();
    }
    Ok(())
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate backend
    if config.backend.host.trim().is_empty() {
        anyhow::bail!("backend.host must not be empty");
    }
    let timeout = config.backend.tool_timeout_secs;
    if !(timeout > 0.0) || Duration::try_from_secs_f64(timeout).is_err() {
        anyhow::bail!("backend.tool_timeout_secs must be a finite number > 0");
    }

    // Validate model
    match config.model.protocol.as_str() {
        "openai" | "anthropic" | "google" => {}
        other => anyhow::bail!(
            "Unknown model protocol: '{}'. Must be openai, anthropic, or google.",
            other
        ),
    }
    if config.model.name.trim().is_empty() {
        anyhow::bail!("model.name must not be empty");
    }
    if config.model.timeout_secs == 0 {
        anyhow::bail!("model.timeout_secs must be > 0");
    }

    // Validate ask
    if config.ask.max_files == 0 || config.ask.max_nodes == 0 {
        anyhow::bail!("ask.max_files and ask.max_nodes must be >= 1");
    }

    // Validate report
    let r = &config.report;
    if r.min_sub_questions < 1 {
        anyhow::bail!("report.min_sub_questions must be >= 1");
    }
    if r.min_sub_questions > r.max_sub_questions {
        anyhow::bail!(
            "report.min_sub_questions ({}) must not exceed report.max_sub_questions ({})",
            r.min_sub_questions,
            r.max_sub_questions
        );
    }
    if r.max_sub_questions > SUB_QUESTION_CEILING {
        anyhow::bail!(
            "report.max_sub_questions must be <= {}",
            SUB_QUESTION_CEILING
        );
    }
    if r.concurrency < 1 {
        anyhow::bail!("report.concurrency must be >= 1");
    }
    if r.sub_question_timeout_secs == 0 {
        anyhow::bail!("report.sub_question_timeout_secs must be > 0");
    }
    if r.synthesis_prompt_chars == 0 {
        anyhow::bail!("report.synthesis_prompt_chars must be > 0");
    }

    match config.logging.level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        other => anyhow::bail!(
            "Unknown logging.level: '{}'. Must be trace, debug, info, warn, or error.",
            other
        ),
    }

    Ok(())
}

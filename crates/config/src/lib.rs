//! Configuration loading, validation, and management for Ferrule.
//!
//! Loads configuration from `~/.ferrule/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.ferrule/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Provider tried first
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Request loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Context optimizer settings
    #[serde(default)]
    pub optimizer: OptimizerConfig,

    /// Built-in tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Provider configurations, in fallback order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_provider() -> String {
    "openrouter".into()
}
fn default_model() -> String {
    "anthropic/claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("optimizer", &self.optimizer)
            .field("tools", &self.tools)
            .field("logging", &self.logging)
            .field("providers", &self.providers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Request loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model-call/tool-execution cycles allowed per user request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Stream model output by default
    #[serde(default)]
    pub stream: bool,

    /// Try other providers when the active one fails
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    /// Run the context optimizer between iterations
    #[serde(default = "default_true")]
    pub auto_optimize: bool,

    /// Replace the built-in base instructions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

fn default_max_iterations() -> u32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            stream: false,
            fallback_enabled: true,
            auto_optimize: true,
            system_prompt_override: None,
        }
    }
}

/// Context optimizer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Actions whose repeated identical calls get pruned
    #[serde(default = "default_optimized_actions")]
    pub optimized_actions: Vec<String>,

    /// Identical calls kept per fingerprint
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Non-summary message count that triggers summarization
    #[serde(default = "default_summary_threshold")]
    pub summary_threshold: usize,

    /// Most recent messages kept verbatim when summarizing
    #[serde(default = "default_summary_retention")]
    pub summary_retention: usize,
}

fn default_optimized_actions() -> Vec<String> {
    vec!["list_directory".into(), "read_file".into()]
}
fn default_max_instances() -> usize {
    1
}
fn default_summary_threshold() -> usize {
    20
}
fn default_summary_retention() -> usize {
    8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            optimized_actions: default_optimized_actions(),
            max_instances: default_max_instances(),
            summary_threshold: default_summary_threshold(),
            summary_retention: default_summary_retention(),
        }
    }
}

/// Built-in tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Root directory file tools are confined to. Defaults to the cwd.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,

    /// Base commands `run_command` may execute. Empty = allow all.
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Seconds before `run_command` gives up on a process
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_allowed_commands() -> Vec<String> {
    ["ls", "cat", "head", "tail", "wc", "grep", "find", "pwd", "echo", "git", "cargo"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_command_timeout() -> u64 {
    60
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            allowed_commands: default_allowed_commands(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of human-readable output
    #[serde(default)]
    pub json: bool,

    /// Append domain events as JSON lines to this file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registration name (e.g. "openrouter", "ollama")
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Model used when this provider answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Per-attempt timeout in the fallback chain
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    120
}

impl AppConfig {
    /// Load configuration from the default path (~/.ferrule/config.toml).
    ///
    /// Also checks environment variables for API keys:
    /// - `FERRULE_API_KEY` (highest priority)
    /// - `OPENROUTER_API_KEY`
    /// - `OPENAI_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if self.api_key.is_none() {
            self.api_key = std::env::var("FERRULE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }

        if let Ok(provider) = std::env::var("FERRULE_PROVIDER") {
            self.default_provider = provider;
        }

        if let Ok(model) = std::env::var("FERRULE_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".ferrule")
    }

    /// Directory where session snapshots are stored.
    pub fn sessions_dir() -> PathBuf {
        Self::config_dir().join("sessions")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }

        if self.optimizer.max_instances == 0 {
            return Err(ConfigError::ValidationError(
                "optimizer.max_instances must be at least 1".into(),
            ));
        }

        if self.optimizer.summary_retention >= self.optimizer.summary_threshold {
            return Err(ConfigError::ValidationError(
                "optimizer.summary_retention must be smaller than optimizer.summary_threshold"
                    .into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{}' is configured more than once",
                    provider.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some() || self.providers.iter().any(|p| p.api_key.is_some())
    }

    /// Generate a default config TOML string (for `config --init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            optimizer: OptimizerConfig::default(),
            tools: ToolsConfig::default(),
            logging: LoggingConfig::default(),
            providers: Vec::new(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

//! Configuration loading, validation, and management for Switchboard.
//!
//! Loads configuration from `~/.switchboard/config.toml` with environment
//! variable overrides. Validates all settings at startup and converts them
//! into the [`AgentConfig`] handed to the orchestrator.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use switchboard_core::agent::AgentConfig;
use switchboard_core::classification::{ClassificationTypeConfig, ParseOptions};
use switchboard_core::schema::ValidationLevel;
use switchboard_core::tool::ToolOptions;

/// The root configuration structure.
///
/// Maps directly to `~/.switchboard/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model transport
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Orchestrator behavior
    #[serde(default)]
    pub agent: AgentSection,

    /// Default tool execution policy
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name reported by the provider ("openai", "ollama", ...)
    #[serde(default = "default_provider")]
    pub name: String,

    /// Base URL of an OpenAI-compatible endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: default_provider(),
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    /// Owner id stamped on created sessions
    #[serde(default = "default_agent_id")]
    pub id: String,

    #[serde(default)]
    pub stream: bool,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub validation_level: ValidationLevel,

    #[serde(default = "default_true")]
    pub allow_partial_match: bool,

    #[serde(default = "default_true")]
    pub require_message_type: bool,

    /// Response types the model is asked to classify into. With none
    /// configured, replies are treated as plain conversation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub classifications: Vec<ClassificationTypeConfig>,
}

fn default_agent_id() -> String {
    "switchboard".into()
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_history_limit() -> usize {
    20
}
fn default_true() -> bool {
    true
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: default_agent_id(),
            stream: false,
            poll_interval_ms: default_poll_interval_ms(),
            history_limit: default_history_limit(),
            validation_level: ValidationLevel::default(),
            allow_partial_match: true,
            require_message_type: true,
            classifications: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.switchboard/config.toml).
    ///
    /// Also checks environment variables:
    /// - `SWITCHBOARD_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `SWITCHBOARD_MODEL` overrides the configured model
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
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

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = lookup("SWITCHBOARD_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }

        if let Some(model) = lookup("SWITCHBOARD_MODEL") {
            self.provider.model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".switchboard")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.provider.model.trim().is_empty() {
            return Err(ConfigError::ValidationError("provider.model must not be empty".into()));
        }

        if self.agent.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError("agent.poll_interval_ms must be > 0".into()));
        }

        if self.agent.history_limit == 0 {
            return Err(ConfigError::ValidationError("agent.history_limit must be > 0".into()));
        }

        if self.tools.timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError("tools.timeout_secs must be > 0".into()));
        }

        let mut names = HashSet::new();
        for classification in &self.agent.classifications {
            if classification.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "agent.classifications entries need a name".into(),
                ));
            }
            if !names.insert(classification.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "agent.classifications has {} twice",
                    classification.name
                )));
            }
            if !classification.schema.is_object() {
                return Err(ConfigError::ValidationError(format!(
                    "agent.classifications.{} schema must be a table",
                    classification.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Classifications to register with the orchestrator.
    pub fn classifications(&self) -> Vec<ClassificationTypeConfig> {
        self.agent.classifications.clone()
    }

    /// The runtime configuration injected into the orchestrator.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            agent_id: self.agent.id.clone(),
            model: self.provider.model.clone(),
            temperature: self.provider.temperature,
            max_tokens: self.provider.max_tokens,
            stream: self.agent.stream,
            poll_interval_ms: self.agent.poll_interval_ms,
            history_limit: self.agent.history_limit,
            parse: ParseOptions {
                level: self.agent.validation_level,
                allow_partial_match: self.agent.allow_partial_match,
                require_message_type: self.agent.require_message_type,
            },
            tool_defaults: ToolOptions {
                max_retries: self.tools.max_retries,
                retry_delay_ms: self.tools.retry_delay_ms,
                timeout_ms: self.tools.timeout_secs.map(|s| s.saturating_mul(1000)),
            },
            // The binary registers no tools, so there is nothing to map to
            instruction_tools: HashMap::new(),
        }
    }

    /// Generate a default config TOML string, with a commented-out
    /// classification as a starting point.
    pub fn default_toml() -> String {
        let mut out = toml::to_string_pretty(&Self::default()).unwrap_or_default();
        out.push_str(CLASSIFICATION_EXAMPLE);
        out
    }
}

const CLASSIFICATION_EXAMPLE: &str = r#"
# [[agent.classifications]]
# name = "SMALL_TALK"
# description = "Chit-chat with the user"
# kind = "CONVERSATION"
#
# [agent.classifications.schema]
# type = "object"
# required = ["answer"]
#
# [agent.classifications.schema.properties.answer]
# type = "string"
"#;

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

//! Configuration loading, validation, and management for clawloop.
//!
//! Loads configuration from `~/.clawloop/config.toml` with environment
//! variable overrides. Validates all settings at load time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.clawloop/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model used when a request carries no explicit override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Agent runner settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Context window policy
    #[serde(default)]
    pub context: ContextSettings,

    /// Delegated sub-agent settings
    #[serde(default)]
    pub delegate: DelegateSettings,

    /// Background job settings
    #[serde(default)]
    pub background: BackgroundSettings,
}

/// How tool schemas are disclosed to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolDisclosure {
    /// Complete schemas on every call.
    #[default]
    Full,
    /// Names and descriptions first; parameter schemas only for the tools
    /// the model commits to.
    TwoPhase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum model rounds before the forced summary round
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Per-call tool timeout
    #[serde(default = "default_tool_timeout")]
    pub tool_call_timeout_secs: u64,

    /// Request chunked model output and forward deltas
    #[serde(default)]
    pub streaming: bool,

    #[serde(default)]
    pub tool_disclosure: ToolDisclosure,
}

fn default_max_steps() -> usize {
    30
}
fn default_tool_timeout() -> u64 {
    60
}

impl AgentSettings {
    pub fn tool_call_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_call_timeout_secs)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            tool_call_timeout_secs: default_tool_timeout(),
            streaming: false,
            tool_disclosure: ToolDisclosure::default(),
        }
    }
}

/// What to do once the window is still over the token budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationStrategy {
    /// Drop further oldest turns.
    #[default]
    Truncate,
    /// Summarize older turns with a compression model.
    Compress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Maximum user turns kept in the window (0 = unlimited)
    #[serde(default)]
    pub max_turns: usize,

    /// Turns removed at a time once `max_turns` is exceeded
    #[serde(default = "default_dequeue_turns")]
    pub dequeue_turns: usize,

    /// Token budget for the window (0 = unlimited)
    #[serde(default)]
    pub max_context_tokens: usize,

    #[serde(default)]
    pub strategy: TruncationStrategy,

    /// Model used for summaries; falls back to the run's model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compress_model: Option<String>,

    /// Most recent turns never folded into a summary
    #[serde(default = "default_keep_recent")]
    pub keep_recent_turns: usize,
}

fn default_dequeue_turns() -> usize {
    1
}
fn default_keep_recent() -> usize {
    4
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_turns: 0,
            dequeue_turns: default_dequeue_turns(),
            max_context_tokens: 0,
            strategy: TruncationStrategy::default(),
            compress_model: None,
            keep_recent_turns: default_keep_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateSettings {
    /// Step budget for nested runs without their own
    #[serde(default = "default_nested_steps")]
    pub max_steps: usize,
}

fn default_nested_steps() -> usize {
    10
}

impl Default for DelegateSettings {
    fn default() -> Self {
        Self {
            max_steps: default_nested_steps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundSettings {
    /// Whether finished background jobs re-enter the agent loop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Step budget of the follow-up run
    #[serde(default = "default_nested_steps")]
    pub max_steps: usize,
}

fn default_true() -> bool {
    true
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_steps: default_nested_steps(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.clawloop/config.toml).
    ///
    /// Environment overrides (highest priority):
    /// - `CLAWLOOP_MODEL`
    /// - `CLAWLOOP_MAX_STEPS`
    /// - `CLAWLOOP_TOOL_TIMEOUT_SECS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
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

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("CLAWLOOP_MODEL") {
            self.default_model = Some(model);
        }
        if let Some(raw) = lookup("CLAWLOOP_MAX_STEPS") {
            self.agent.max_steps = parse_override("CLAWLOOP_MAX_STEPS", &raw)?;
        }
        if let Some(raw) = lookup("CLAWLOOP_TOOL_TIMEOUT_SECS") {
            self.agent.tool_call_timeout_secs = parse_override("CLAWLOOP_TOOL_TIMEOUT_SECS", &raw)?;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".clawloop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }

        if self.agent.tool_call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "agent.tool_call_timeout_secs must be at least 1".into(),
            ));
        }

        if self.context.dequeue_turns == 0 {
            return Err(ConfigError::ValidationError(
                "context.dequeue_turns must be at least 1".into(),
            ));
        }

        if self.context.strategy == TruncationStrategy::Compress
            && self.context.max_context_tokens == 0
        {
            return Err(ConfigError::ValidationError(
                "context.strategy = \"compress\" needs context.max_context_tokens".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} is not a valid number: {raw:?}")))
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

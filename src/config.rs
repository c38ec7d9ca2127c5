//! Application configuration loaded from `agent.yaml`.
//!
//! The file has four sections: `server` and `sampling` (see
//! [`crate::inference::config`]), `agent` and `logging`. Every field has a default, so
//! an empty or missing file yields a working configuration for a server
//! already listening on the default port.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::{TemplateFormat, DEFAULT_EVENT_CAPACITY, DEFAULT_SYSTEM_PROMPT};
use crate::inference::{SamplingConfig, ServerConfig};

pub const CONFIG_FILE_NAME: &str = "agent.yaml";
pub const CONFIG_ENV_VAR: &str = "LLAMA_AGENT_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Types ───────────────────────────────────────────────────────────────────

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}
fn default_keep_files() -> u32 {
    3
}

/// The full contents of `agent.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// The `logging:` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Rotated `agent.log.<n>` generations kept at startup.
    #[serde(default = "default_keep_files")]
    pub keep_files: u32,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            keep_files: default_keep_files(),
            json: false,
        }
    }
}

/// The `agent:` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSettings {
    /// `None` means [`DEFAULT_SYSTEM_PROMPT`].
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub template: TemplateFormat,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            template: TemplateFormat::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl AgentSettings {
    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate().map_err(|e| ConfigError::Invalid {
            reason: e.to_string(),
        })?;
        if self.agent.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                reason: "agent.event_capacity must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate `agent.yaml`.
///
/// Resolution order:
/// 1. `explicit`, when given (it must exist).
/// 2. The `LLAMA_AGENT_CONFIG` env var.
/// 3. `agent.yaml` in `start` or any of its ancestors.
/// 4. `agent.yaml` in the data directory.
///
/// Returns `Ok(None)` when nothing is found.
pub fn find_config_path(start: &Path, explicit: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(ConfigError::Read {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
        });
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points to a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            break;
        }
    }

    let candidate = crate::data_dir().join(CONFIG_FILE_NAME);
    if candidate.is_file() {
        return Ok(Some(candidate));
    }

    Ok(None)
}

/// Load, interpolate, parse and validate a config file.
///
/// `${VAR_NAME}` and `${VAR_NAME:-default}` are replaced before parsing.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        source: e,
    })?;

    let config = parse_config(&raw).map_err(|reason| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    })?;
    config.validate()?;
    Ok(config)
}

/// Discover and load the config, falling back to built-in defaults when no
/// file exists.
pub fn load_or_default(explicit: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_default();
    match find_config_path(&cwd, explicit)? {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => {
            tracing::info!("no {CONFIG_FILE_NAME} found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

fn parse_config(raw: &str) -> Result<AppConfig, String> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&interpolated).map_err(|e| e.to_string())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset variables without a default
/// become the empty string.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

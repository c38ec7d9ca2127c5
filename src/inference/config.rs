//! Inference server and sampling configuration.
//!
//! These are the `server:` and `sampling:` sections of `agent.yaml`; file
//! discovery and env-var interpolation live in [`crate::config`].

use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Defaults ────────────────────────────────────────────────────────────────

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8690";
const DEFAULT_SERVER_BINARY: &str = "llama-server";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_connect_timeout_secs() -> u64 {
    5
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_stream_timeout_secs() -> u64 {
    600
}
fn default_binary() -> String {
    DEFAULT_SERVER_BINARY.to_string()
}
fn default_context_size() -> u32 {
    4096
}
fn default_startup_timeout_secs() -> u64 {
    120
}
fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> u32 {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_max_tokens() -> i32 {
    -1
}
fn default_cache_prompt() -> bool {
    true
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// How to reach (and optionally launch) the inference server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Total timeout for non-streaming calls (warmup probes).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Total timeout for streaming calls.
    ///
    /// Local models can take a long time on a large prompt before the first
    /// token arrives, so this is much longer than `request_timeout_secs`.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,
    /// When present, the client spawns and owns the server process.
    #[serde(default)]
    pub launch: Option<LaunchConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_timeout_secs: default_stream_timeout_secs(),
            launch: None,
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    /// The base URL without a trailing slash.
    pub fn endpoint(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "server.base_url must not be empty".into(),
            });
        }
        if let Some(ref launch) = self.launch {
            if launch.model_path.trim().is_empty() {
                return Err(InferenceError::ConfigError {
                    reason: "server.launch.model_path must be set when launching a server".into(),
                });
            }
        }
        Ok(())
    }
}

/// Command line used to spawn the server process.
#[derive(Debug, Clone, Deserialize)]
pub struct LaunchConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default)]
    pub model_path: String,
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default)]
    pub gpu_layers: Option<u32>,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

impl LaunchConfig {
    pub fn new(model_path: impl Into<String>) -> Self {
        Self {
            binary: default_binary(),
            model_path: model_path.into(),
            context_size: default_context_size(),
            gpu_layers: None,
            threads: None,
            extra_args: Vec::new(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Sampling parameters sent with every completion request.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    /// `n_predict`; `-1` generates until EOS or a stop word.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i32,
    /// Let the server reuse the KV cache for the common prompt prefix.
    #[serde(default = "default_cache_prompt")]
    pub cache_prompt: bool,
    #[serde(default)]
    pub seed: Option<i64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            max_tokens: default_max_tokens(),
            cache_prompt: default_cache_prompt(),
            seed: None,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

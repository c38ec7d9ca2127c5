//! Shared types for the inference client.
//!
//! The wire types mirror the llama.cpp server `/completion` API, used for
//! both request building and response parsing. `CompletionRequest` and
//! `CompletionResult` are the backend-neutral shapes the agent works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::config::SamplingConfig;

// ─── Backend-neutral Types ───────────────────────────────────────────────────

/// One completion call as issued by the agent.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Fully rendered prompt text.
    pub prompt: String,
    /// Stop sequences; empty means generate until EOS or the token limit.
    pub stop: Vec<String>,
    /// Per-call override of the configured prediction limit.
    pub max_tokens: Option<i32>,
    /// Cancelled when the caller interrupts this call.
    pub cancel: CancellationToken,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, stop: Vec<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stop,
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    StopWord { word: String },
    Limit,
    Unknown,
}

/// Final structured result of one completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionResult {
    /// Authoritative response text (normalized by the backend).
    pub text: String,
    pub model: Option<String>,
    pub stop_reason: StopReason,
    pub tokens_predicted: Option<u32>,
    pub tokens_evaluated: Option<u32>,
    /// Latency between sending the request and the first streamed chunk.
    pub response_start_seconds: Option<f64>,
    pub predicted_per_second: Option<f64>,
    pub started_at: DateTime<Utc>,
}

impl CompletionResult {
    /// A result carrying only text, with no provider metadata.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
            stop_reason: StopReason::Unknown,
            tokens_predicted: None,
            tokens_evaluated: None,
            response_start_seconds: None,
            predicted_per_second: None,
            started_at: Utc::now(),
        }
    }
}

// ─── Request Types ───────────────────────────────────────────────────────────

/// Request body for `POST /completion`.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionBody {
    pub prompt: String,
    pub stream: bool,
    pub n_predict: i32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    pub cache_prompt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
}

impl CompletionBody {
    pub fn new(request: &CompletionRequest, sampling: &SamplingConfig, stream: bool) -> Self {
        Self {
            prompt: request.prompt.clone(),
            stream,
            n_predict: request.max_tokens.unwrap_or(sampling.max_tokens),
            temperature: sampling.temperature,
            top_k: sampling.top_k,
            top_p: sampling.top_p,
            repeat_penalty: sampling.repeat_penalty,
            stop: request.stop.clone(),
            cache_prompt: sampling.cache_prompt,
            seed: sampling.seed,
        }
    }
}

// ─── Response Types ──────────────────────────────────────────────────────────

/// One `/completion` response object: an SSE `data:` payload when streaming,
/// or the whole body when not.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub content: String,
    /// `true` on the final event of a stream.
    #[serde(default)]
    pub stop: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_predicted: Option<u32>,
    #[serde(default)]
    pub tokens_evaluated: Option<u32>,
    #[serde(default)]
    pub stopped_eos: bool,
    #[serde(default)]
    pub stopped_word: bool,
    #[serde(default)]
    pub stopped_limit: bool,
    #[serde(default)]
    pub stopping_word: Option<String>,
    #[serde(default)]
    pub timings: Option<Timings>,
    #[serde(default)]
    pub error: Option<ServerErrorBody>,
}

impl CompletionChunk {
    pub fn stop_reason(&self) -> StopReason {
        if self.stopped_word {
            StopReason::StopWord {
                word: self.stopping_word.clone().unwrap_or_default(),
            }
        } else if self.stopped_eos {
            StopReason::EndOfSequence
        } else if self.stopped_limit {
            StopReason::Limit
        } else {
            StopReason::Unknown
        }
    }
}

/// Server-side timing metadata, present on the final event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timings {
    #[serde(default)]
    pub prompt_n: Option<u32>,
    #[serde(default)]
    pub prompt_ms: Option<f64>,
    #[serde(default)]
    pub predicted_n: Option<u32>,
    #[serde(default)]
    pub predicted_ms: Option<f64>,
    #[serde(default)]
    pub predicted_per_second: Option<f64>,
}

/// Error object the server embeds when generation fails.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerErrorBody {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ServerErrorBody {
    pub fn describe(&self) -> String {
        match (&self.kind, self.code) {
            (Some(kind), Some(code)) => format!("{kind} ({code}): {}", self.message),
            (Some(kind), None) => format!("{kind}: {}", self.message),
            (None, Some(code)) => format!("{code}: {}", self.message),
            (None, None) => self.message.clone(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

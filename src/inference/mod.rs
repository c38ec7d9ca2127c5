//! Inference Client — streaming completion against a local llama.cpp server.
//!
//! This module handles all communication with the local inference server:
//! - Streaming and non-streaming `/completion` requests
//! - SSE stream parsing
//! - Interrupting the in-flight request
//! - Spawning and supervising an owned `llama-server` process
//!
//! The agent only sees the [`CompletionBackend`] trait, so the server can be
//! swapped for any other backend without touching the agent.

pub mod backend;
pub mod client;
pub mod config;
pub mod errors;
pub mod server;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use backend::{CompletionBackend, ProgressSender};
pub use client::LlamaClient;
pub use config::{LaunchConfig, SamplingConfig, ServerConfig};
pub use errors::InferenceError;
pub use server::ServerProcess;
pub use types::{CompletionRequest, CompletionResult, StopReason};

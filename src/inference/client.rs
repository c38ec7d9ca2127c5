//! llama.cpp-compatible inference client.
//!
//! Sends `/completion` requests to a local inference server and streams back
//! text chunks. Optionally owns the server process it talks to.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::Client as HttpClient;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backend::{CompletionBackend, ProgressSender};
use super::config::{SamplingConfig, ServerConfig};
use super::errors::InferenceError;
use super::server::{wait_until_healthy, ServerProcess};
use super::streaming::{parse_completion_response, parse_sse_stream};
use super::types::{CompletionBody, CompletionChunk, CompletionRequest, CompletionResult, StopReason};

// ─── LlamaClient ─────────────────────────────────────────────────────────────

/// Client for one local inference server.
///
/// At most one completion is expected in flight at a time; `interrupt`
/// cancels it. When created with [`LlamaClient::launch`] the client owns the
/// server process, which is killed when the client is dropped.
pub struct LlamaClient {
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests (longer timeout).
    http_stream: HttpClient,
    server: ServerConfig,
    sampling: SamplingConfig,
    process: tokio::sync::Mutex<Option<ServerProcess>>,
    /// Cancellation token of the call currently in flight, keyed by call id.
    in_flight: Mutex<Option<(u64, CancellationToken)>>,
    next_call_id: AtomicU64,
}

impl LlamaClient {
    /// Create a client for an already running server.
    ///
    /// Does NOT check connectivity — that happens on the first request.
    pub fn connect(server: ServerConfig, sampling: SamplingConfig) -> Result<Self, InferenceError> {
        server.validate()?;

        let http = HttpClient::builder()
            .connect_timeout(server.connect_timeout())
            .timeout(server.request_timeout())
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: server.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(server.connect_timeout())
            .timeout(server.stream_timeout())
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: server.base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            server,
            sampling,
            process: tokio::sync::Mutex::new(None),
            in_flight: Mutex::new(None),
            next_call_id: AtomicU64::new(1),
        })
    }

    /// Create a client, spawning the server first when `server.launch` is set,
    /// and wait until the server reports healthy.
    pub async fn launch(server: ServerConfig, sampling: SamplingConfig) -> Result<Self, InferenceError> {
        let client = Self::connect(server, sampling)?;

        let Some(launch) = client.server.launch.clone() else {
            return Ok(client);
        };

        let mut process = ServerProcess::spawn(&launch, client.server.endpoint())?;
        if let Err(e) = wait_until_healthy(
            &client.http,
            client.server.endpoint(),
            Some(&mut process),
            launch.startup_timeout(),
        )
        .await
        {
            process.shutdown().await;
            return Err(e);
        }

        *client.process.lock().await = Some(process);
        Ok(client)
    }

    /// The base URL of the inference server.
    pub fn base_url(&self) -> &str {
        self.server.endpoint()
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    /// Whether this client spawned (and still holds) its server process.
    pub async fn owns_server(&self) -> bool {
        self.process.lock().await.is_some()
    }

    // ─── Health Check ────────────────────────────────────────────────────

    /// Check if the inference server is reachable and has a model loaded.
    pub async fn health_check(&self) -> Result<bool, InferenceError> {
        let url = format!("{}/health", self.server.endpoint());

        match self
            .http
            .get(&url)
            .timeout(self.server.connect_timeout())
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Stop the owned server process, if any.
    pub async fn shutdown(&self) {
        if let Some(mut process) = self.process.lock().await.take() {
            process.shutdown().await;
        }
    }

    // ─── In-flight Tracking ──────────────────────────────────────────────

    fn begin_call(&self, cancel: CancellationToken) -> InFlightCall<'_> {
        let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = Some((id, cancel));
        InFlightCall { client: self, id }
    }

    fn end_call(&self, id: u64) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*slot, Some((current, _)) if current == id) {
            *slot = None;
        }
    }

    // ─── Completion (streaming) ──────────────────────────────────────────

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        progress: ProgressSender,
    ) -> Result<CompletionResult, InferenceError> {
        let url = format!("{}/completion", self.server.endpoint());
        let body = CompletionBody::new(request, &self.sampling, true);
        let cancel = &request.cancel;
        let started = Instant::now();
        let started_at = Utc::now();

        // Log the request metadata (not the prompt — it can be huge)
        tracing::info!(
            url = %url,
            prompt_len = body.prompt.len(),
            stop_count = body.stop.len(),
            n_predict = body.n_predict,
            stream = body.stream,
            "=== LLM REQUEST ==="
        );

        let send = self
            .http_stream
            .post(&url)
            .json(&body)
            .header("Accept", "text/event-stream")
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(InferenceError::Cancelled { partial_text: String::new() });
            }
            res = send => res.map_err(|e| {
                InferenceError::from_transport(&url, self.server.stream_timeout_secs, e)
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let stream = parse_sse_stream(response.bytes_stream());
        futures::pin_mut!(stream);

        let mut text = String::new();
        let mut chunk_count: usize = 0;
        let mut first_chunk_after: Option<Duration> = None;
        let mut final_chunk: Option<CompletionChunk> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the stream closes the connection, which makes
                    // the server abandon the generation.
                    tracing::info!(
                        url = %url,
                        partial_len = text.len(),
                        chunk_count,
                        "completion interrupted"
                    );
                    return Err(InferenceError::Cancelled { partial_text: text });
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        if !chunk.content.is_empty() {
                            first_chunk_after.get_or_insert_with(|| started.elapsed());
                            text.push_str(&chunk.content);
                            chunk_count += 1;
                            // A dropped receiver only means nobody is watching.
                            let _ = progress.send(chunk.content.clone());
                        }
                        if chunk.stop {
                            final_chunk = Some(chunk);
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(url = %url, error = %e, chunk_count, "stream error");
                        return Err(e);
                    }
                    None => break,
                }
            }
        }

        let result = build_result(
            &text,
            &request.stop,
            final_chunk.as_ref(),
            started_at,
            first_chunk_after,
        );

        tracing::info!(
            url = %url,
            chunk_count,
            text_len = result.text.len(),
            tokens_predicted = ?result.tokens_predicted,
            predicted_per_second = ?result.predicted_per_second,
            stop_reason = ?result.stop_reason,
            "=== LLM RESPONSE ==="
        );

        Ok(result)
    }

    // ─── Completion (non-streaming) ──────────────────────────────────────

    async fn oneshot_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResult, InferenceError> {
        let url = format!("{}/completion", self.server.endpoint());
        let body = CompletionBody::new(request, &self.sampling, false);
        let cancel = &request.cancel;
        let started = Instant::now();
        let started_at = Utc::now();

        tracing::info!(
            url = %url,
            prompt_len = body.prompt.len(),
            n_predict = body.n_predict,
            stream = body.stream,
            "=== LLM REQUEST ==="
        );

        let exchange = async {
            let response = self
                .http
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| InferenceError::from_transport(&url, self.server.request_timeout_secs, e))?;

            let status = response.status();
            let body_text = response.text().await.map_err(|e| InferenceError::StreamError {
                reason: format!("failed to read response body: {e}"),
            })?;

            if !status.is_success() {
                return Err(InferenceError::HttpError {
                    status: status.as_u16(),
                    body: body_text,
                });
            }
            Ok(body_text)
        };

        let body_text = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(InferenceError::Cancelled { partial_text: String::new() });
            }
            res = exchange => res?,
        };

        let chunk = parse_completion_response(&body_text)?;
        let result = build_result(
            &chunk.content,
            &request.stop,
            Some(&chunk),
            started_at,
            Some(started.elapsed()),
        );

        tracing::info!(
            url = %url,
            text_len = result.text.len(),
            tokens_evaluated = ?result.tokens_evaluated,
            "=== LLM RESPONSE ==="
        );

        Ok(result)
    }
}

#[async_trait]
impl CompletionBackend for LlamaClient {
    async fn complete(
        &self,
        request: CompletionRequest,
        progress: Option<ProgressSender>,
    ) -> Result<CompletionResult, InferenceError> {
        let _call = self.begin_call(request.cancel.clone());

        // Interrupted before the request was registered.
        if request.cancel.is_cancelled() {
            return Err(InferenceError::Cancelled {
                partial_text: String::new(),
            });
        }

        match progress {
            Some(progress) => self.stream_completion(&request, progress).await,
            None => self.oneshot_completion(&request).await,
        }
    }

    async fn interrupt(&self) {
        let token = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(_, token)| token.clone());

        match token {
            Some(token) => {
                tracing::info!(url = %self.server.endpoint(), "interrupting in-flight completion");
                token.cancel();
            }
            None => tracing::debug!("interrupt requested with no completion in flight"),
        }
    }
}

/// Clears the in-flight slot when a call ends, however it ends.
struct InFlightCall<'a> {
    client: &'a LlamaClient,
    id: u64,
}

impl Drop for InFlightCall<'_> {
    fn drop(&mut self) {
        self.client.end_call(self.id);
    }
}

// ─── Result Assembly ─────────────────────────────────────────────────────────

fn build_result(
    raw: &str,
    stop: &[String],
    last: Option<&CompletionChunk>,
    started_at: DateTime<Utc>,
    first_chunk_after: Option<Duration>,
) -> CompletionResult {
    CompletionResult {
        text: normalize_completion_text(raw, stop),
        model: last.and_then(|c| c.model.clone()),
        stop_reason: last
            .map(CompletionChunk::stop_reason)
            .unwrap_or(StopReason::Unknown),
        tokens_predicted: last.and_then(|c| c.tokens_predicted),
        tokens_evaluated: last.and_then(|c| c.tokens_evaluated),
        response_start_seconds: first_chunk_after.map(|d| d.as_secs_f64()),
        predicted_per_second: last
            .and_then(|c| c.timings.as_ref())
            .and_then(|t| t.predicted_per_second),
        started_at,
    }
}

/// Normalize raw generated text into the authoritative response.
///
/// Removes a stop sequence the server let through at the very end (ignoring
/// trailing whitespace after it), then trims surrounding whitespace.
pub fn normalize_completion_text(raw: &str, stop: &[String]) -> String {
    let mut text = raw.trim_end();
    for word in stop.iter().map(|w| w.trim_end()).filter(|w| !w.is_empty()) {
        if let Some(stripped) = text.strip_suffix(word) {
            text = stripped;
            break;
        }
    }
    text.trim().to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

//! SSE streaming response parser for the llama.cpp `/completion` endpoint.
//!
//! Reads an HTTP body as a byte stream, splits on SSE boundaries
//! (`data: …\n\n`) and parses each event as a [`CompletionChunk`].

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};

use super::errors::InferenceError;
use super::types::{CompletionChunk, ServerErrorBody};

// ─── SSE event parser ────────────────────────────────────────────────────────

/// Parse raw SSE bytes into `CompletionChunk`s.
///
/// This is the main entry point for streaming. It:
/// 1. Buffers bytes until a complete `\n\n`-terminated event is available
/// 2. Decodes the event as UTF-8 (never splitting a multi-byte character)
/// 3. Parses the `data:` payload as a `CompletionChunk`
/// 4. Surfaces `error:` events and embedded `error` objects as errors
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<CompletionChunk, InferenceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    stream::unfold(
        (Box::pin(byte_stream), Vec::<u8>::new()),
        |(mut byte_stream, mut buffer)| async move {
            loop {
                // Check if we have a complete SSE event in the buffer
                if let Some((event_end, sep_len)) = find_event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + sep_len).collect();
                    let event = String::from_utf8_lossy(&event[..event_end]).into_owned();

                    match process_event(&event) {
                        Ok(Some(chunk)) => return Some((Ok(chunk), (byte_stream, buffer))),
                        Ok(None) => continue, // keep-alive, comment or [DONE]
                        Err(e) => return Some((Err(e), (byte_stream, buffer))),
                    }
                }

                // Need more data from the stream
                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer),
                        ));
                    }
                    None => {
                        // Stream ended — flush a trailing event without a terminator
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if rest.is_empty() {
                            return None;
                        }
                        return match process_event(&rest) {
                            Ok(Some(chunk)) => Some((Ok(chunk), (byte_stream, buffer))),
                            Ok(None) => None,
                            Err(e) => Some((Err(e), (byte_stream, buffer))),
                        };
                    }
                }
            }
        },
    )
}

/// Locate the end of the first complete event: `(index, separator_len)`.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Process a single SSE event string (may contain multiple `data:` lines).
fn process_event(event: &str) -> Result<Option<CompletionChunk>, InferenceError> {
    let mut data_content = String::new();

    for line in event.lines() {
        if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
            let data = data.trim();
            if data == "[DONE]" {
                continue;
            }
            data_content.push_str(data);
        } else if let Some(err) = line.strip_prefix("error: ").or_else(|| line.strip_prefix("error:")) {
            return Err(server_error_from_raw(err.trim()));
        }
        // Ignore non-data lines (comments, event types, ids)
    }

    if data_content.is_empty() {
        return Ok(None);
    }

    let chunk: CompletionChunk =
        serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
        })?;

    if let Some(ref err) = chunk.error {
        return Err(InferenceError::ServerError {
            message: err.describe(),
        });
    }

    Ok(Some(chunk))
}

fn server_error_from_raw(raw: &str) -> InferenceError {
    #[derive(serde::Deserialize)]
    struct Wrapped {
        error: ServerErrorBody,
    }

    let message = serde_json::from_str::<Wrapped>(raw)
        .map(|w| w.error.describe())
        .or_else(|_| serde_json::from_str::<ServerErrorBody>(raw).map(|b| b.describe()))
        .unwrap_or_else(|_| raw.to_string());

    InferenceError::ServerError { message }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Parse a non-streaming `/completion` response body.
///
/// Used for warmup probes, which do not stream.
pub fn parse_completion_response(body: &str) -> Result<CompletionChunk, InferenceError> {
    let chunk: CompletionChunk =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse completion response: {e}"),
        })?;

    if let Some(ref err) = chunk.error {
        return Err(InferenceError::ServerError {
            message: err.describe(),
        });
    }

    Ok(chunk)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

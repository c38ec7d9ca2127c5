//! The completion capability the agent consumes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::errors::InferenceError;
use super::types::{CompletionRequest, CompletionResult};

/// Receives each text chunk as it is generated.
pub type ProgressSender = mpsc::UnboundedSender<String>;

/// A text-completion backend with streaming progress and interrupt.
///
/// Contract:
/// - `complete` sends zero or more chunks on `progress`, in generation order,
///   before it resolves. `progress: None` requests a non-streaming call.
/// - Cancelling `request.cancel` must have the same effect as `interrupt()`.
/// - An interrupted call ends promptly, either `Ok` with the partial text or
///   `Err(InferenceError::Cancelled { .. })`.
/// - `interrupt` only requests cancellation; it does not wait for `complete`
///   to return, and it is a no-op when nothing is in flight.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
        progress: Option<ProgressSender>,
    ) -> Result<CompletionResult, InferenceError>;

    async fn interrupt(&self);
}

#[async_trait]
impl<T: CompletionBackend + ?Sized> CompletionBackend for std::sync::Arc<T> {
    async fn complete(
        &self,
        request: CompletionRequest,
        progress: Option<ProgressSender>,
    ) -> Result<CompletionResult, InferenceError> {
        (**self).complete(request, progress).await
    }

    async fn interrupt(&self) {
        (**self).interrupt().await
    }
}

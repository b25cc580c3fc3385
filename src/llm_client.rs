//! Transport seam for chat-completion providers

use crate::error::Result;
use crate::openrouter::{CompletionRequest, CompletionResponse};
use async_trait::async_trait;

/// Unified trait for chat-completion transports
///
/// Implementations perform exactly one request per call; retry and backoff
/// belong to whoever wraps the client, never to the pipeline.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a completion request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the client type for debugging/logging
    fn client_type(&self) -> &str;

    /// Get the base URL or endpoint
    fn endpoint(&self) -> &str;
}

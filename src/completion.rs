//! Completion Port: the single I/O boundary the pipeline depends on

use crate::assembler::assemble;
use crate::config::ModelConfig;
use crate::cost::CostAccumulator;
use crate::error::{Error, Result};
use crate::llm_client::LlmClient;
use crate::openrouter::{CompletionRequest, Message};
use crate::types::TokenUsage;
use async_trait::async_trait;
use std::sync::Arc;

/// Text and token usage of one completion call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionResult {
    /// Generated text, untrusted
    pub text: String,
    /// Token usage reported by the provider
    pub usage: TokenUsage,
}

impl CompletionResult {
    /// Create a result
    pub fn new(text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }

    /// Total tokens consumed by the call
    pub fn token_count(&self) -> u64 {
        self.usage.total_tokens
    }
}

/// A model behind a message-list interface
///
/// One call, one request. Implementations must not retry; a failed call is
/// reported once as [`Error::Completion`].
#[async_trait]
pub trait CompletionPort: Send + Sync {
    /// Run one completion
    async fn complete(&self, messages: Vec<Message>) -> Result<CompletionResult>;

    /// Identifier used for pricing and logs
    fn model_id(&self) -> &str;
}

/// Adapts an [`LlmClient`] plus model settings into a [`CompletionPort`]
#[derive(Clone)]
pub struct ModelPort {
    client: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl ModelPort {
    /// Create a port for one model
    pub fn new(client: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { client, model }
    }

    /// Model settings used for every request
    pub fn model(&self) -> &ModelConfig {
        &self.model
    }
}

impl std::fmt::Debug for ModelPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPort")
            .field("client", &self.client.client_type())
            .field("endpoint", &self.client.endpoint())
            .field("model", &self.model)
            .finish()
    }
}

#[async_trait]
impl CompletionPort for ModelPort {
    async fn complete(&self, messages: Vec<Message>) -> Result<CompletionResult> {
        if messages.is_empty() {
            return Err(Error::completion("completion request needs at least one message"));
        }

        let mut request = CompletionRequest::new(&self.model.model, messages)
            .with_temperature(self.model.temperature);
        if let Some(max_tokens) = self.model.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        let response = self.client.complete(request).await.map_err(|e| match e {
            Error::Completion(msg) => Error::Completion(msg),
            other => Error::completion(other.to_string()),
        })?;

        let text = response
            .first_text()
            .ok_or_else(|| Error::completion(format!("{} returned no choices", self.model.model)))?
            .to_string();
        let usage = response.usage.map(TokenUsage::from).unwrap_or_default();

        Ok(CompletionResult::new(text, usage))
    }

    fn model_id(&self) -> &str {
        &self.model.model
    }
}

/// Assemble, complete and book the cost of one call
pub async fn invoke(
    port: &dyn CompletionPort,
    cost: &CostAccumulator,
    persona: &str,
    task_text: &str,
) -> Result<CompletionResult> {
    let messages = assemble(persona, task_text);
    let result = port.complete(messages).await?;
    cost.record(
        port.model_id(),
        result.usage.prompt_tokens,
        result.usage.completion_tokens,
    );
    tracing::debug!(
        model = port.model_id(),
        chars = result.text.len(),
        tokens = result.token_count(),
        "completion received"
    );
    Ok(result)
}

//! Scripted completion port for tests

use crate::completion::{CompletionPort, CompletionResult};
use crate::error::Result;
use crate::openrouter::{Message, Role};
use crate::types::TokenUsage;
use async_trait::async_trait;
use parking_lot::Mutex;

type Script = dyn Fn(&[Message]) -> Result<String> + Send + Sync;

/// Port whose replies come from a closure over the request messages
pub struct ScriptedPort {
    model: String,
    script: Box<Script>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedPort {
    /// Reply with `script(messages)` for every call
    pub fn new<F>(model: impl Into<String>, script: F) -> Self
    where
        F: Fn(&[Message]) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            model: model.into(),
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls received
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// User prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.calls.lock().iter().map(|m| user_text(m).to_string()).collect()
    }
}

/// System message of a request, empty when absent
pub fn system_text(messages: &[Message]) -> &str {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Final user message of a request
pub fn user_text(messages: &[Message]) -> &str {
    messages.last().map(|m| m.content.as_str()).unwrap_or("")
}

#[async_trait]
impl CompletionPort for ScriptedPort {
    async fn complete(&self, messages: Vec<Message>) -> Result<CompletionResult> {
        self.calls.lock().push(messages.clone());
        // let sibling branches interleave
        tokio::task::yield_now().await;
        let text = (self.script)(&messages)?;
        Ok(CompletionResult::new(text, TokenUsage::new(10, 5)))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

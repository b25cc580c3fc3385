//! # MPLLM
//!
//! A multi-persona LLM pipeline built with Rust.
//!
//! One task item passes through a fixed sequence of model calls: a Switch
//! stage invents persona groups, the groups research and reason in parallel,
//! a Minimux stage arbitrates their outputs, and an optional Guesser stage
//! synthesizes a final answer.
//!
//! ## Features
//!
//! - **Three task types**: recall-and-write, word-link and constraint-puzzle
//! - **OpenRouter Integration**: any chat-completion model behind one API
//! - **Fault tolerant**: branch failures and malformed output degrade the
//!   payload instead of aborting the run
//! - **Output recovery**: fenced, wrapped or truncated JSON is still parsed
//! - **Cost accounting**: token usage and spend across a whole session
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mpllm::{OpenRouterClient, PipelineConfig, Sequencer, TaskItem};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = OpenRouterClient::from_env()?;
//!     let sequencer = Sequencer::from_config(&PipelineConfig::default(), Arc::new(client))?;
//!
//!     let item = TaskItem::trivia("Ancient Egypt", vec!["Longest river?".into()]);
//!     let output = sequencer.run("recall-and-write", &item).await?;
//!     println!("{}", serde_json::to_string_pretty(&output.payload)?);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assembler;
pub mod completion;
pub mod config;
pub mod consensus;
pub mod cost;
pub mod error;
pub mod fallback;
pub mod fanout;
pub mod llm_client;
pub mod openrouter;
pub mod parser;
pub mod persona;
pub mod pipeline;
pub mod profile;
pub mod prompts;
pub mod trace;
pub mod types;

// Re-exports for convenience
pub use completion::{CompletionPort, CompletionResult, ModelPort};
pub use config::{ModelConfig, OpenRouterConfig, PipelineConfig};
pub use consensus::{majority_vote, Vote};
pub use cost::{CostAccumulator, CostState, CostSummary, ModelRate, PricingTable};
pub use error::{Error, Result};
pub use fanout::FanOutExecutor;
pub use llm_client::LlmClient;
pub use openrouter::{CompletionRequest, CompletionResponse, Message, OpenRouterClient, Role};
pub use parser::{parse, Mapping};
pub use persona::{Persona, PersonaGroup, SwitchOutput};
pub use pipeline::{GroupOutcome, PipelineOutput, Sequencer, SequencerBuilder, Stage};
pub use profile::{ResearchMode, TaskItem, TaskProfile, TaskType};
pub use trace::{StageRecord, StageTrace, TraceAnnotation};
pub use types::{RunId, TokenUsage};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::completion::CompletionPort;
    pub use crate::config::PipelineConfig;
    pub use crate::error::{Error, Result};
    pub use crate::openrouter::OpenRouterClient;
    pub use crate::pipeline::{PipelineOutput, Sequencer};
    pub use crate::profile::{TaskItem, TaskType};
    pub use crate::types::*;
}

//! Stage names and the single-call step every stage is built from

use crate::completion::{invoke, CompletionPort};
use crate::cost::CostAccumulator;
use crate::parser::{parse_detailed, Mapping};
use crate::trace::{StageRecord, TraceAnnotation};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Persona generation
    Switch,
    /// Fact gathering
    Researcher,
    /// Task reasoning
    Thinker,
    /// Arbitration
    Minimux,
    /// Synthesis
    Guesser,
}

impl Stage {
    /// Stage name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Researcher => "researcher",
            Self::Thinker => "thinker",
            Self::Minimux => "minimux",
            Self::Guesser => "guesser",
        }
    }

    /// Trace key: the stage name, suffixed with `.g{id}` for per-group calls
    pub fn key(&self, group: Option<u32>) -> String {
        match group {
            Some(id) => format!("{}.g{}", self.name(), id),
            None => self.name().to_string(),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Text and parsed mapping of a successful call
#[derive(Debug, Clone)]
pub struct Reply {
    /// Raw model text
    pub text: String,
    /// Parsed mapping, empty when unparsable
    pub mapping: Mapping,
}

impl Reply {
    /// Trimmed raw text, `None` when blank
    pub fn raw_text(&self) -> Option<String> {
        let text = self.text.trim();
        (!text.is_empty()).then(|| text.to_string())
    }
}

/// Trace record plus the reply, if the call succeeded
#[derive(Debug, Clone)]
pub struct StageCall {
    /// Record for the trace
    pub record: StageRecord,
    /// `None` when the completion call failed
    pub reply: Option<Reply>,
}

impl StageCall {
    /// Parsed mapping, empty when the call failed or was unparsable
    pub fn mapping(&self) -> Mapping {
        self.reply
            .as_ref()
            .map(|reply| reply.mapping.clone())
            .unwrap_or_default()
    }

    /// Whether the completion call failed
    pub fn failed(&self) -> bool {
        self.reply.is_none()
    }
}

/// Run one completion call and parse its reply.
///
/// Never fails: a transport error becomes a failed [`StageRecord`], an
/// unparsable reply an empty mapping annotated as malformed.
pub async fn call(
    port: &dyn CompletionPort,
    cost: &CostAccumulator,
    key: String,
    persona: &str,
    prompt: &str,
) -> StageCall {
    tracing::debug!(stage = %key, model = port.model_id(), prompt_chars = prompt.len(), "calling model");

    match invoke(port, cost, persona, prompt).await {
        Ok(result) => {
            let outcome = parse_detailed(&result.text);
            let mut record = StageRecord::new(&key, &result.text, result.usage);
            match outcome.strategy {
                None => {
                    tracing::warn!(stage = %key, chars = result.text.len(), "model output could not be parsed");
                    record.annotate(TraceAnnotation::MalformedOutput);
                }
                Some("direct") => {}
                Some(strategy) => {
                    tracing::debug!(stage = %key, strategy, "recovered structured output");
                    record.annotate(TraceAnnotation::Recovered {
                        strategy: strategy.to_string(),
                    });
                }
            }
            StageCall {
                record,
                reply: Some(Reply {
                    text: result.text,
                    mapping: outcome.mapping,
                }),
            }
        }
        Err(e) => {
            tracing::warn!(stage = %key, error = %e, "completion call failed");
            StageCall {
                record: StageRecord::failed(&key, e.to_string()),
                reply: None,
            }
        }
    }
}

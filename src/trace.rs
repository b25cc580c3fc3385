//! Per-item stage trace for observability

use crate::types::TokenUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Non-fatal event attached to a stage record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceAnnotation {
    /// The completion call failed
    TransportFailure {
        /// Error text
        message: String,
    },
    /// No parser strategy produced a mapping
    MalformedOutput,
    /// Parsed via a recovery strategy rather than direct decode
    Recovered {
        /// Strategy name
        strategy: String,
    },
    /// Defaults replaced the stage's output
    FallbackApplied {
        /// What was substituted
        detail: String,
    },
    /// Some fan-out branches produced nothing
    PartialGroupFailure {
        /// Group ids that contributed nothing
        failed: Vec<u32>,
    },
    /// Final payload was rebuilt without a successful arbitration call
    Degraded {
        /// Reason
        reason: String,
    },
}

/// Raw output and cost of one completed stage call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name, e.g. `switch` or `thinker.g2`
    pub stage: String,
    /// Raw model text, unmodified (empty when the call failed)
    pub raw: String,
    /// Tokens spent
    pub tokens: TokenUsage,
    /// Events observed while handling this stage
    pub annotations: Vec<TraceAnnotation>,
    /// When the record was appended
    pub recorded_at: DateTime<Utc>,
}

impl StageRecord {
    /// Create a record for a completed call
    pub fn new(stage: impl Into<String>, raw: impl Into<String>, tokens: TokenUsage) -> Self {
        Self {
            stage: stage.into(),
            raw: raw.into(),
            tokens,
            annotations: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Record for a call that never returned text
    pub fn failed(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage, "", TokenUsage::default()).with_annotation(TraceAnnotation::TransportFailure {
            message: message.into(),
        })
    }

    /// Attach an annotation
    pub fn with_annotation(mut self, annotation: TraceAnnotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    /// Attach an annotation in place
    pub fn annotate(&mut self, annotation: TraceAnnotation) {
        self.annotations.push(annotation);
    }

    /// Whether the call behind this record failed
    pub fn is_failure(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, TraceAnnotation::TransportFailure { .. }))
    }
}

/// Append-only log of stage records for one task item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTrace {
    records: Vec<StageRecord>,
}

impl StageTrace {
    /// Create an empty trace
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. A stage name can only be recorded once; a second
    /// record under the same name is dropped and `false` is returned.
    pub fn record(&mut self, record: StageRecord) -> bool {
        if self.get(&record.stage).is_some() {
            tracing::warn!(stage = %record.stage, "stage already traced; record dropped");
            return false;
        }
        self.records.push(record);
        true
    }

    /// Record for a stage
    pub fn get(&self, stage: &str) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.stage == stage)
    }

    /// Records in append order
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Stage names in append order
    pub fn stages(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.stage.as_str()).collect()
    }

    /// Tokens across all stages
    pub fn total_tokens(&self) -> TokenUsage {
        self.records.iter().fold(TokenUsage::default(), |mut acc, r| {
            acc.add(r.tokens);
            acc
        })
    }

    /// Every annotation with its stage name
    pub fn annotations(&self) -> impl Iterator<Item = (&str, &TraceAnnotation)> {
        self.records
            .iter()
            .flat_map(|r| r.annotations.iter().map(move |a| (r.stage.as_str(), a)))
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

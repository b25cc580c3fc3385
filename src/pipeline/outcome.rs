//! Results of a pipeline run

use crate::cost::CostState;
use crate::parser::{get_str, get_string_list, Mapping};
use crate::persona::{PersonaGroup, SwitchOutput};
use crate::profile::TaskType;
use crate::trace::StageTrace;
use crate::types::RunId;
use serde::{Deserialize, Serialize};

/// What one persona group produced in the collaborative stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupOutcome {
    /// Group id
    pub id: u32,
    /// Researcher persona text
    pub researcher: Option<String>,
    /// Thinker persona text
    pub thinker: Option<String>,
    /// Researcher findings (answers, associations or constraints)
    pub facts: Vec<String>,
    /// Thinker proposal (direction, clue or answer)
    pub proposal: Option<String>,
    /// Thinker reasoning, when given
    pub reasoning: Option<String>,
    /// Whether any call for this group failed
    pub failed: bool,
}

impl GroupOutcome {
    /// Empty outcome for a group
    pub fn pending(group: &PersonaGroup) -> Self {
        let text = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            id: group.id,
            researcher: text(group.researcher_text()),
            thinker: text(group.thinker_text()),
            ..Self::default()
        }
    }

    /// Whether the group gave arbitration anything to work with
    pub fn contributed(&self) -> bool {
        !self.facts.is_empty() || self.proposal.is_some()
    }
}

/// Final result of one task item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    /// Run identifier
    pub run_id: RunId,
    /// Task type
    pub task: TaskType,
    /// Final payload handed to scoring
    pub payload: Mapping,
    /// Whether the payload was produced despite upstream failures
    pub degraded: bool,
    /// Personas the run used, after fallback
    pub switch: SwitchOutput,
    /// Per-group results in group order
    pub groups: Vec<GroupOutcome>,
    /// Stage trace
    pub trace: StageTrace,
    /// Session cost totals at the end of the run
    pub cost: CostState,
}

impl PipelineOutput {
    /// String field of the payload
    pub fn field(&self, key: &str) -> Option<String> {
        get_str(&self.payload, key)
    }

    /// List field of the payload
    pub fn list(&self, key: &str) -> Vec<String> {
        get_string_list(&self.payload, key)
    }

    /// Groups that produced content
    pub fn contributing_groups(&self) -> impl Iterator<Item = &GroupOutcome> {
        self.groups.iter().filter(|g| g.contributed())
    }
}

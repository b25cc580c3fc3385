//! Persona shapes produced by the Switch stage

use crate::parser::Mapping;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role description as models emit it: plain text or `{"persona": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Persona {
    /// Plain role text
    Plain(String),
    /// Object carrying the text under `persona`
    Nested {
        /// Role text
        persona: String,
    },
}

impl Persona {
    /// Plain text of the persona
    pub fn as_text(&self) -> &str {
        match self {
            Self::Plain(text) => text.trim(),
            Self::Nested { persona } => persona.trim(),
        }
    }

    /// Normalize any JSON shape a model produced.
    ///
    /// Lists resolve to their first usable element. Numbers and booleans are
    /// not personas.
    pub fn from_value(value: &Value) -> Option<Self> {
        let persona = match value {
            Value::Array(items) => return items.iter().find_map(Self::from_value),
            Value::Object(map) => map.get("persona").and_then(Self::from_value)?,
            _ => serde_json::from_value::<Persona>(value.clone()).ok()?,
        };
        (!persona.as_text().is_empty()).then_some(persona)
    }

    /// Collapse to [`Persona::Plain`]
    pub fn normalized(&self) -> Self {
        Self::Plain(self.as_text().to_string())
    }
}

impl From<&str> for Persona {
    fn from(text: &str) -> Self {
        Self::Plain(text.to_string())
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_text())
    }
}

/// One Researcher/Thinker pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaGroup {
    /// Group id, 1-based when the model omits it
    pub id: u32,
    /// Fact-gathering persona
    pub researcher: Option<Persona>,
    /// Reasoning persona
    pub thinker: Option<Persona>,
}

const ID_KEYS: &[&str] = &["id", "group_id", "g"];
const RESEARCHER_KEYS: &[&str] = &["researcher", "r"];
const THINKER_KEYS: &[&str] = &["thinker", "t"];

fn first_persona(map: &Mapping, keys: &[&str]) -> Option<Persona> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(Persona::from_value))
        .map(|p| p.normalized())
}

impl PersonaGroup {
    /// Create a group from plain texts
    pub fn new(id: u32, researcher: Option<&str>, thinker: Option<&str>) -> Self {
        Self {
            id,
            researcher: researcher.map(Persona::from),
            thinker: thinker.map(Persona::from),
        }
    }

    /// Read one entry of a `groups` array; `None` when it names no persona
    pub fn from_value(value: &Value, position: usize) -> Option<Self> {
        let map = value.as_object()?;
        let id = ID_KEYS
            .iter()
            .find_map(|key| match map.get(*key)? {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|id| u32::try_from(id).ok())
            .unwrap_or(position as u32 + 1);

        let researcher = first_persona(map, RESEARCHER_KEYS);
        let thinker = first_persona(map, THINKER_KEYS);
        if researcher.is_none() && thinker.is_none() {
            return None;
        }
        Some(Self {
            id,
            researcher,
            thinker,
        })
    }

    /// Researcher text, empty when absent
    pub fn researcher_text(&self) -> &str {
        self.researcher.as_ref().map(Persona::as_text).unwrap_or("")
    }

    /// Thinker text, empty when absent
    pub fn thinker_text(&self) -> &str {
        self.thinker.as_ref().map(Persona::as_text).unwrap_or("")
    }
}

/// Most groups a Switch reply may contribute; extra entries are dropped
pub const MAX_GROUPS: usize = 5;

/// Personas for one task item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SwitchOutput {
    /// Groups in model order
    pub groups: Vec<PersonaGroup>,
    /// Arbitration persona
    pub decider: Option<Persona>,
    /// Other top-level fields, e.g. `spymaster_clue`
    #[serde(default)]
    pub extras: Mapping,
}

impl SwitchOutput {
    /// Interpret a parsed Switch mapping. Malformed groups are dropped, and
    /// ids are renumbered by position when the model repeats one.
    pub fn from_mapping(mapping: &Mapping) -> Self {
        let mut groups: Vec<PersonaGroup> = match mapping.get("groups") {
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(i, item)| PersonaGroup::from_value(item, i))
                .collect(),
            _ => Vec::new(),
        };
        if groups.len() > MAX_GROUPS {
            tracing::warn!(returned = groups.len(), kept = MAX_GROUPS, "too many persona groups");
            groups.truncate(MAX_GROUPS);
        }
        let mut ids: Vec<u32> = groups.iter().map(|g| g.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != groups.len() {
            for (position, group) in groups.iter_mut().enumerate() {
                group.id = position as u32 + 1;
            }
        }
        let decider = mapping
            .get("decider")
            .and_then(Persona::from_value)
            .map(|p| p.normalized());
        let extras = mapping
            .iter()
            .filter(|(key, _)| key.as_str() != "groups" && key.as_str() != "decider")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            groups,
            decider,
            extras,
        }
    }

    /// Decider text, empty when absent
    pub fn decider_text(&self) -> &str {
        self.decider.as_ref().map(Persona::as_text).unwrap_or("")
    }
}

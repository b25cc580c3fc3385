//! Task profiles: the per-task parameters of the one generic pipeline

use crate::assembler::format_numbered;
use crate::error::{Error, Result};
use crate::prompts;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported task identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Trivia answers plus a short story
    #[serde(rename = "recall-and-write", alias = "trivia")]
    Trivia,
    /// Single clue for a set of target words
    #[serde(rename = "word-link", alias = "codenames")]
    Codenames,
    /// Logic grid puzzle
    #[serde(rename = "constraint-puzzle", alias = "logic")]
    Logic,
}

impl TaskType {
    /// All task types
    pub const ALL: [TaskType; 3] = [Self::Trivia, Self::Codenames, Self::Logic];

    /// Canonical identifier
    pub fn id(&self) -> &'static str {
        match self {
            Self::Trivia => "recall-and-write",
            Self::Codenames => "word-link",
            Self::Logic => "constraint-puzzle",
        }
    }

    /// Profile driving the pipeline for this task
    pub fn profile(&self) -> TaskProfile {
        TaskProfile::for_task(*self)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recall-and-write" | "trivia" => Ok(Self::Trivia),
            "word-link" | "codenames" => Ok(Self::Codenames),
            "constraint-puzzle" | "logic" => Ok(Self::Logic),
            _ => Err(Error::UnknownTask(s.to_string())),
        }
    }
}

/// How the collaborative stage gathers facts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    /// One call answers for every researcher persona
    Merged,
    /// Each group's researcher runs before its thinker
    PerGroup,
    /// Thinkers work from the task alone
    None,
}

/// Input data for one task item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    /// Trivia topic
    #[serde(default)]
    pub topic: Option<String>,
    /// Trivia questions
    #[serde(default)]
    pub questions: Vec<String>,
    /// Words the clue must cover
    #[serde(default)]
    pub target_words: Vec<String>,
    /// Full board
    #[serde(default)]
    pub word_list: Vec<String>,
    /// Logic puzzle text
    #[serde(default)]
    pub inputs: Option<String>,
}

const DEFAULT_TOPIC: &str = "General";

impl TaskItem {
    /// Trivia item
    pub fn trivia(topic: impl Into<String>, questions: Vec<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            questions,
            ..Self::default()
        }
    }

    /// Word-link item
    pub fn codenames(target_words: Vec<String>, word_list: Vec<String>) -> Self {
        Self {
            target_words,
            word_list,
            ..Self::default()
        }
    }

    /// Logic item
    pub fn logic(inputs: impl Into<String>) -> Self {
        Self {
            inputs: Some(inputs.into()),
            ..Self::default()
        }
    }

    /// Topic, or "General" when unset
    pub fn topic(&self) -> &str {
        self.topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TOPIC)
    }

    /// Number of guesses expected for word-link
    pub fn n(&self) -> usize {
        self.target_words.len()
    }

    /// Check the fields the task needs
    pub fn validate(&self, task: TaskType) -> Result<()> {
        let missing = |field: &str| -> Result<()> { Err(Error::missing_field(task.id(), field)) };
        match task {
            TaskType::Trivia if self.questions.iter().all(|q| q.trim().is_empty()) => {
                missing("questions")
            }
            TaskType::Codenames if self.target_words.is_empty() => missing("target_words"),
            TaskType::Codenames if self.word_list.is_empty() => missing("word_list"),
            TaskType::Logic
                if self.inputs.as_deref().map(str::trim).unwrap_or("").is_empty() =>
            {
                missing("inputs")
            }
            _ => Ok(()),
        }
    }

    /// Placeholder values shared by every prompt of a run
    pub fn bindings(&self) -> Vec<(&'static str, String)> {
        vec![
            ("topic", self.topic().to_string()),
            ("questions", format_numbered(&self.questions)),
            ("count", self.questions.len().to_string()),
            ("target_words", self.target_words.join(", ")),
            ("word_list", self.word_list.join(", ")),
            ("n", self.n().to_string()),
            ("inputs", self.inputs.clone().unwrap_or_default()),
        ]
    }
}

/// Templates and result field names for one task type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProfile {
    /// Task this profile serves
    pub task: TaskType,
    /// Switch system prompt
    pub switch_system: &'static str,
    /// Switch user prompt
    pub switch_user: &'static str,
    /// Default research strategy
    pub research_mode: ResearchMode,
    /// Merged researcher prompt, when the task supports it
    pub merged_researcher: Option<&'static str>,
    /// Per-group researcher prompt
    pub researcher: &'static str,
    /// Field of a researcher reply holding its findings
    pub research_field: &'static str,
    /// Thinker prompt
    pub thinker: &'static str,
    /// Field of a thinker reply holding its proposal
    pub thinker_field: &'static str,
    /// Arbitration prompt
    pub minimux: &'static str,
    /// Synthesis prompts for tasks that need one
    pub guesser: Option<SynthesisPrompts>,
    /// Payload field with the main textual result
    pub result_text_field: &'static str,
    /// Payload field with per-question answers
    pub result_list_field: Option<&'static str>,
}

/// Persona and prompt of the synthesis stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisPrompts {
    /// System persona
    pub system: &'static str,
    /// User prompt template
    pub user: &'static str,
}

/// Payload field written by the synthesis stage
pub const GUESS_FIELD: &str = "guessed_words";

impl TaskProfile {
    /// Profile for a task type
    pub fn for_task(task: TaskType) -> Self {
        match task {
            TaskType::Trivia => Self {
                task,
                switch_system: prompts::trivia::SWITCH_SYSTEM,
                switch_user: prompts::trivia::SWITCH_USER,
                research_mode: ResearchMode::Merged,
                merged_researcher: Some(prompts::trivia::MERGED_RESEARCHER),
                researcher: prompts::trivia::RESEARCHER,
                research_field: "answers",
                thinker: prompts::trivia::THINKER,
                thinker_field: "creative_direction",
                minimux: prompts::trivia::MINIMUX,
                guesser: None,
                result_text_field: "final_story",
                result_list_field: Some("final_answers"),
            },
            TaskType::Codenames => Self {
                task,
                switch_system: prompts::codenames::SWITCH_SYSTEM,
                switch_user: prompts::codenames::SWITCH_USER,
                research_mode: ResearchMode::PerGroup,
                merged_researcher: None,
                researcher: prompts::codenames::RESEARCHER,
                research_field: "associations",
                thinker: prompts::codenames::THINKER,
                thinker_field: "clue",
                minimux: prompts::codenames::MINIMUX,
                guesser: Some(SynthesisPrompts {
                    system: prompts::codenames::GUESSER_SYSTEM,
                    user: prompts::codenames::GUESSER,
                }),
                result_text_field: "final_clue",
                result_list_field: None,
            },
            TaskType::Logic => Self {
                task,
                switch_system: prompts::logic::SWITCH_SYSTEM,
                switch_user: prompts::logic::SWITCH_USER,
                research_mode: ResearchMode::PerGroup,
                merged_researcher: None,
                researcher: prompts::logic::RESEARCHER,
                research_field: "constraints",
                thinker: prompts::logic::THINKER,
                thinker_field: "answer",
                minimux: prompts::logic::MINIMUX,
                guesser: None,
                result_text_field: "final_answer",
                result_list_field: None,
            },
        }
    }

    /// Research strategy after applying an override.
    ///
    /// `Merged` needs a merged template; tasks without one run per group.
    pub fn resolve_research_mode(&self, requested: Option<ResearchMode>) -> ResearchMode {
        match requested.unwrap_or(self.research_mode) {
            ResearchMode::Merged if self.merged_researcher.is_none() => ResearchMode::PerGroup,
            mode => mode,
        }
    }
}

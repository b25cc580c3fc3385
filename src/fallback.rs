//! Fallback Policy: canonical personas when the Switch stage yields nothing usable

use crate::persona::{Persona, PersonaGroup};
use crate::profile::TaskType;

/// Number of groups every fallback set contains
pub const DEFAULT_GROUP_COUNT: usize = 3;

fn pairs(task: TaskType) -> [(&'static str, &'static str); DEFAULT_GROUP_COUNT] {
    match task {
        TaskType::Trivia => [
            ("Fact Expert", "Story Weaver"),
            ("Data Scholar", "Tale Scribe"),
            ("Knowledge Keeper", "Myth Builder"),
        ],
        TaskType::Codenames => [
            ("Lexicographer", "Lateral Thinker"),
            ("Pop Culture Buff", "Word Game Strategist"),
            ("Etymologist", "Risk Assessor"),
        ],
        TaskType::Logic => [
            ("Constraint Extractor", "Deductive Solver"),
            ("Careful Reader", "Grid Elimination Specialist"),
            ("Relation Analyst", "Consistency Checker"),
        ],
    }
}

/// Default groups for a task type, ids 1..=3
pub fn default_groups(task: TaskType) -> Vec<PersonaGroup> {
    pairs(task)
        .into_iter()
        .zip(1u32..)
        .map(|((researcher, thinker), id)| PersonaGroup::new(id, Some(researcher), Some(thinker)))
        .collect()
}

/// Default arbitration persona for a task type
pub fn default_decider(task: TaskType) -> Persona {
    let text = match task {
        TaskType::Trivia => "Chief Editor who verifies facts and writes clear, vivid prose",
        TaskType::Codenames => "Veteran Spymaster who weighs every clue against the whole board",
        TaskType::Logic => "Puzzle Judge who checks every deduction against the constraints",
    };
    Persona::from(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_task_has_three_complete_groups() {
        for task in TaskType::ALL {
            let groups = default_groups(task);
            assert_eq!(groups.len(), DEFAULT_GROUP_COUNT);
            for (i, group) in groups.iter().enumerate() {
                assert_eq!(group.id as usize, i + 1);
                assert!(!group.researcher_text().is_empty());
                assert!(!group.thinker_text().is_empty());
            }
            assert!(!default_decider(task).as_text().is_empty());
        }
    }

    #[test]
    fn test_trivia_defaults_are_stable() {
        let groups = default_groups(TaskType::Trivia);
        assert_eq!(groups[0].researcher_text(), "Fact Expert");
        assert_eq!(groups[2].thinker_text(), "Myth Builder");
        assert_eq!(groups, default_groups(TaskType::Trivia));
    }
}

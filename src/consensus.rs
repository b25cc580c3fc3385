//! Majority voting over branch outputs
//!
//! Used when arbitration cannot run: the payload is rebuilt from what the
//! groups agree on instead of being left empty.

use std::collections::HashMap;

/// Placeholder answer that never wins a vote
pub const UNKNOWN: &str = "unknown";

/// Winner of a vote
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    /// Winning value, as first written by a voter
    pub value: String,
    /// Voters who agreed
    pub count: usize,
    /// Share of counted voters, 0.0 to 1.0
    pub share: f64,
}

impl Vote {
    /// Whether agreement meets `threshold`
    pub fn reached(&self, threshold: f64) -> bool {
        self.share >= threshold.clamp(0.0, 1.0)
    }
}

fn normalize(value: &str) -> Option<String> {
    let key = value.trim().trim_matches('"').trim().to_lowercase();
    (!key.is_empty() && key != UNKNOWN).then_some(key)
}

/// Most common value, ignoring blanks and "unknown".
///
/// Comparison is case-insensitive. Ties go to the value seen first.
pub fn majority_vote<S: AsRef<str>>(responses: &[S]) -> Option<Vote> {
    let mut counts: HashMap<String, (usize, usize, &str)> = HashMap::new();
    let mut counted = 0usize;

    for (position, response) in responses.iter().enumerate() {
        let Some(key) = normalize(response.as_ref()) else {
            continue;
        };
        counted += 1;
        counts
            .entry(key)
            .or_insert((0, position, response.as_ref().trim()))
            .0 += 1;
    }

    counts
        .into_values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(count, _, value)| Vote {
            value: value.to_string(),
            count,
            share: count as f64 / counted as f64,
        })
}

/// Per-position vote across several answer lists.
///
/// Output always has `len` entries; positions nobody answered are "unknown".
pub fn consensus_answers(answer_sets: &[Vec<String>], len: usize) -> Vec<String> {
    (0..len)
        .map(|i| {
            let column: Vec<&str> = answer_sets
                .iter()
                .filter_map(|set| set.get(i).map(String::as_str))
                .collect();
            majority_vote(&column)
                .map(|vote| vote.value)
                .unwrap_or_else(|| UNKNOWN.to_string())
        })
        .collect()
}

/// Pad with "unknown" or truncate to exactly `len` entries
pub fn fit_to_len(mut answers: Vec<String>, len: usize) -> Vec<String> {
    answers.truncate(len);
    answers.resize(len, UNKNOWN.to_string());
    answers
}

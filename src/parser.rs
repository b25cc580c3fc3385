//! Tolerant extraction of JSON objects from model output
//!
//! Model text is untrusted: it may be wrapped in code fences, surrounded by
//! prose, carry an extra layer of template braces, or stop mid-object. The
//! parser runs an ordered chain of pure strategies and returns the first
//! mapping any of them produces. It never fails; total failure is an empty
//! mapping, which callers treat as "use the fallback".

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// JSON object produced by the parser
pub type Mapping = Map<String, Value>;

/// One recovery strategy
pub type Strategy = fn(&str) -> Option<Mapping>;

/// Strategies in priority order
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct", decode_direct),
    ("strip_fences", decode_without_fences),
    ("brace_slice", decode_brace_slice),
    ("doubled_braces", decode_doubled_braces),
    ("field_regex", extract_known_fields),
];

/// Keys whose value is a list of short strings
pub const LIST_FIELDS: &[&str] = &[
    "final_answers",
    "guessed_words",
    "answers",
    "constraints",
    "associations",
    "r1",
    "r2",
    "r3",
    "r4",
    "r5",
    "r6",
    "r7",
    "r8",
    "r9",
];

/// Keys whose value is a single string or scalar
pub const TEXT_FIELDS: &[&str] = &[
    "final_story",
    "final_clue",
    "final_answer",
    "creative_direction",
    "clue",
    "answer",
    "reasoning",
    "justification",
    "spymaster_clue",
    "decider",
    "correction_log",
];

static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[A-Za-z0-9_-]*").expect("valid fence regex"));

static LIST_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    LIST_FIELDS
        .iter()
        .map(|key| {
            let pattern = format!(r#""{}"\s*:\s*\[([^\]]*)\]"#, regex::escape(key));
            (*key, Regex::new(&pattern).expect("valid list field regex"))
        })
        .collect()
});

static TEXT_PATTERNS: Lazy<Vec<(&'static str, Regex, Regex, Regex)>> = Lazy::new(|| {
    TEXT_FIELDS
        .iter()
        .map(|key| {
            let key_re = regex::escape(key);
            let closed = format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, key_re);
            let scalar = format!(r#""{}"\s*:\s*(-?\d+(?:\.\d+)?|true|false)"#, key_re);
            let truncated = format!(r#"(?s)"{}"\s*:\s*"(.+)$"#, key_re);
            (
                *key,
                Regex::new(&closed).expect("valid text field regex"),
                Regex::new(&scalar).expect("valid scalar field regex"),
                Regex::new(&truncated).expect("valid truncated field regex"),
            )
        })
        .collect()
});

/// Parse model output into a mapping, empty when nothing is recoverable
pub fn parse(text: &str) -> Mapping {
    parse_detailed(text).mapping
}

/// Result of [`parse_detailed`]
#[derive(Debug, Clone, PartialEq)]
pub struct ParseOutcome {
    /// Recovered mapping (empty on total failure)
    pub mapping: Mapping,
    /// Name of the strategy that succeeded
    pub strategy: Option<&'static str>,
}

impl ParseOutcome {
    /// Whether every strategy failed
    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }
}

/// Parse and report which strategy produced the mapping
pub fn parse_detailed(text: &str) -> ParseOutcome {
    for (name, strategy) in STRATEGIES {
        if let Some(mapping) = strategy(text) {
            return ParseOutcome {
                mapping,
                strategy: Some(name),
            };
        }
    }
    ParseOutcome {
        mapping: Mapping::new(),
        strategy: None,
    }
}

fn decode_object(text: &str) -> Option<Mapping> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn strip_fences(text: &str) -> String {
    FENCE.replace_all(text, "").trim().to_string()
}

fn brace_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

/// Strategy 1: the whole text is a JSON object
pub fn decode_direct(text: &str) -> Option<Mapping> {
    decode_object(text)
}

/// Strategy 2: drop code-fence markers, then decode
pub fn decode_without_fences(text: &str) -> Option<Mapping> {
    decode_object(&strip_fences(text))
}

/// Strategy 3: decode from the first `{` to the last `}`
pub fn decode_brace_slice(text: &str) -> Option<Mapping> {
    let cleaned = strip_fences(text);
    brace_slice(&cleaned).and_then(decode_object)
}

/// Strategy 4: peel one layer of `{{ ... }}` and rerun strategies 1-3
pub fn decode_doubled_braces(text: &str) -> Option<Mapping> {
    let cleaned = strip_fences(text);
    let candidate = if cleaned.starts_with("{{") && cleaned.ends_with("}}") {
        cleaned.as_str()
    } else {
        brace_slice(&cleaned).filter(|slice| slice.starts_with("{{") && slice.ends_with("}}"))?
    };

    let inner = &candidate[1..candidate.len() - 1];
    decode_direct(inner)
        .or_else(|| decode_without_fences(inner))
        .or_else(|| decode_brace_slice(inner))
        .or_else(|| decode_object(&candidate.replace("{{", "{").replace("}}", "}")))
}

/// Strategy 5: pull known keys out with regular expressions
pub fn extract_known_fields(text: &str) -> Option<Mapping> {
    let mut mapping = Mapping::new();

    for (key, pattern) in LIST_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            mapping.insert((*key).to_string(), Value::Array(split_list(&caps[1])));
        }
    }

    for (key, closed, scalar, truncated) in TEXT_PATTERNS.iter() {
        if let Some(caps) = closed.captures(text) {
            mapping.insert((*key).to_string(), Value::String(unescape(&caps[1])));
        } else if let Some(caps) = scalar.captures(text) {
            let value = serde_json::from_str(&caps[1]).unwrap_or(Value::String(caps[1].to_string()));
            mapping.insert((*key).to_string(), value);
        } else if let Some(caps) = truncated.captures(text) {
            let partial = caps[1].trim_end_matches(['}', ']', ' ', '\n', '\r', '\t', '"']);
            if !partial.is_empty() {
                mapping.insert((*key).to_string(), Value::String(unescape(partial)));
            }
        }
    }

    (!mapping.is_empty()).then_some(mapping)
}

fn split_list(inner: &str) -> Vec<Value> {
    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&format!("[{}]", inner)) {
        return items;
    }
    inner
        .split(',')
        .map(|item| item.trim().trim_matches(|c| c == '"' || c == '\''))
        .filter(|item| !item.is_empty())
        .map(|item| Value::String(item.to_string()))
        .collect()
}

fn unescape(raw: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", raw)).unwrap_or_else(|_| raw.to_string())
}

/// String value of a key; scalars are stringified, blanks are `None`
pub fn get_str(mapping: &Mapping, key: &str) -> Option<String> {
    let text = match mapping.get(key)? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// List value of a key. Accepts an array of scalars or a comma-separated string.
pub fn get_string_list(mapping: &Mapping, key: &str) -> Vec<String> {
    match mapping.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                Value::Bool(b) => Some(b.to_string()),
                _ => None,
            })
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

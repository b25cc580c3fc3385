//! Persona and prompt assembly

use crate::openrouter::Message;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Build the message list for one completion call.
///
/// An empty (or whitespace-only) persona produces no system message; the task
/// text is always the single, final user message.
pub fn assemble(persona: &str, task_text: &str) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if !persona.trim().is_empty() {
        messages.push(Message::system(persona));
    }
    messages.push(Message::user(task_text));
    messages
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("valid placeholder regex"));

/// Replace `{key}` placeholders literally.
///
/// Templates carry JSON examples, so this never interprets braces beyond the
/// exact placeholders given; anything else is left as written. The template is
/// scanned once, so placeholders inside bound values stay as written.
pub fn fill_template(template: &str, bindings: &[(&str, String)]) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let key = &caps[1];
            match bindings.iter().find(|(name, _)| *name == key) {
                Some((_, value)) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render items as a 1-based numbered list, one per line
pub fn format_numbered<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item.as_ref()))
        .collect::<Vec<_>>()
        .join("\n")
}

//! Human-readable event lines printed by the head loop.
//!
//! ```text
//! [2026-03-04T05:06:07] [completed] BACKEND, backend-1: Add parser.
//! Parses the manifest. Rejects unknown keys. Reports line numbers.
//! ```

use chrono::{DateTime, Utc};

const RESET: &str = "\x1b[0m";
const MAX_SENTENCES: usize = 3;

/// One event to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event<'a> {
    pub kind: &'a str,
    pub role: &'a str,
    pub agent_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
}

fn role_color(role: &str) -> &'static str {
    match role {
        "lead" => "\x1b[35m",
        "backend" => "\x1b[34m",
        "frontend" => "\x1b[36m",
        "qa" => "\x1b[33m",
        "platform" => "\x1b[32m",
        "design" => "\x1b[95m",
        "content" => "\x1b[93m",
        _ => "\x1b[37m",
    }
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn with_period(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() || text.ends_with(['.', '!', '?']) {
        text.to_string()
    } else {
        format!("{text}.")
    }
}

/// First `max` sentences of `text`, whitespace collapsed.
pub fn leading_sentences(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = collapsed.as_bytes();
    for (idx, ch) in collapsed.char_indices() {
        let boundary = matches!(ch, '.' | '!' | '?')
            && (idx + 1 == bytes.len() || bytes[idx + 1] == b' ');
        if boundary {
            sentences.push(collapsed[start..=idx].trim().to_string());
            start = idx + 1;
            if sentences.len() == max {
                return sentences.join(" ");
            }
        }
    }
    let rest = collapsed[start..].trim();
    if !rest.is_empty() && sentences.len() < max {
        sentences.push(rest.to_string());
    }
    sentences.join(" ")
}

pub fn format_event(event: &Event<'_>, now: DateTime<Utc>, color: bool) -> String {
    let role = event.role.to_uppercase();
    let role = if color {
        format!("{}{role}{RESET}", role_color(event.role))
    } else {
        role
    };
    let mut line = format!(
        "[{}] [{}] {role}, {}: {}",
        timestamp(now),
        event.kind,
        event.agent_id,
        with_period(event.title)
    );
    let description = leading_sentences(event.description, MAX_SENTENCES);
    if !description.is_empty() {
        line.push('\n');
        line.push_str(&description);
    }
    line
}

pub fn format_heartbeat(agent_id: &str, elapsed_seconds: u64, now: DateTime<Utc>) -> String {
    format!(
        "[{}] [heartbeat] Agent {agent_id} still running, elapsed seconds: {elapsed_seconds}.",
        timestamp(now)
    )
}

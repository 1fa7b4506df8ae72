//! Bounded conversation window handed to the reasoning collaborator.
//!
//! Keeps the most recent messages, drops oldest-first until the byte budget
//! fits, and as a last resort truncates the head of the single remaining
//! message so its tail (the freshest output) survives.

use serde::Serialize;

pub const TRUNCATION_MARKER: &str = "[...truncated]\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextWindow {
    pub messages: Vec<String>,
    /// Messages that did not fit (count only).
    pub dropped: usize,
    pub truncated: bool,
}

impl ContextWindow {
    pub fn total_bytes(&self) -> usize {
        self.messages.iter().map(String::len).sum()
    }
}

pub fn bounded_window(messages: &[String], limit: usize, budget_bytes: usize) -> ContextWindow {
    let start = messages.len().saturating_sub(limit);
    let mut kept: Vec<String> = messages[start..].to_vec();
    let mut dropped = start;

    let mut total: usize = kept.iter().map(String::len).sum();
    while total > budget_bytes && kept.len() > 1 {
        let removed = kept.remove(0);
        total -= removed.len();
        dropped += 1;
    }

    let mut truncated = false;
    if total > budget_bytes
        && let Some(last) = kept.last_mut()
    {
        *last = keep_tail(last, budget_bytes);
        truncated = true;
    }

    ContextWindow {
        messages: kept,
        dropped,
        truncated,
    }
}

/// Keep the last bytes of `text` that fit `budget` including the marker.
fn keep_tail(text: &str, budget: usize) -> String {
    if budget <= TRUNCATION_MARKER.len() {
        let mut end = budget;
        while !TRUNCATION_MARKER.is_char_boundary(end) {
            end -= 1;
        }
        return TRUNCATION_MARKER[..end].to_string();
    }
    let room = budget - TRUNCATION_MARKER.len();
    let mut cut = text.len().saturating_sub(room);
    while cut < text.len() && !text.is_char_boundary(cut) {
        cut += 1;
    }
    format!("{}{}", TRUNCATION_MARKER, &text[cut..])
}

//! Metadata sanitization for registry input.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataLimits {
    pub max_keys: usize,
    pub max_key_chars: usize,
    pub max_value_chars: usize,
}

/// Strip control characters and cap lengths. Keys that end up empty are
/// dropped; keys beyond `max_keys` are dropped in sorted order.
pub fn sanitize_metadata(
    raw: &BTreeMap<String, String>,
    limits: MetadataLimits,
) -> BTreeMap<String, String> {
    let mut clean = BTreeMap::new();
    for (key, value) in raw {
        if clean.len() >= limits.max_keys {
            break;
        }
        let key = sanitize_text(key, limits.max_key_chars);
        if key.is_empty() {
            continue;
        }
        clean.insert(key, sanitize_text(value, limits.max_value_chars));
    }
    clean
}

/// Remove control characters (newlines and tabs become spaces), trim, and
/// cap at `max_chars` characters.
pub fn sanitize_text(raw: &str, max_chars: usize) -> String {
    raw.chars()
        .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .chars()
        .take(max_chars)
        .collect()
}

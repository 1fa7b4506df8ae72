//! Parsing of reasoning-collaborator responses into allowed actions.
//!
//! Responses are opaque text. Each [`ResponseShape`] is one parsing strategy;
//! they are tried in order and the first that yields an action string wins.
//! Anything that does not map onto the allow-list becomes `wait` with the
//! reason recorded in [`ParsedDecision::malformed`].

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::core::types::DecisionAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    /// A JSON object, possibly embedded in prose or a code fence.
    JsonObject,
    /// `ACTION: <name>` / `REASONING: ...` / `MESSAGE: ...` lines.
    KeyValueLines,
}

pub const DEFAULT_SHAPES: [ResponseShape; 2] =
    [ResponseShape::JsonObject, ResponseShape::KeyValueLines];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDecision {
    pub action: DecisionAction,
    pub reasoning: String,
    pub payload: Option<String>,
    pub shape: Option<ResponseShape>,
    /// Why the response was replaced with `wait`, if it was.
    pub malformed: Option<String>,
}

impl ParsedDecision {
    fn wait(reason: String) -> Self {
        Self {
            action: DecisionAction::Wait,
            reasoning: String::new(),
            payload: None,
            shape: None,
            malformed: Some(reason),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    action: String,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default, alias = "message")]
    payload: Option<String>,
}

static ACTION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*action\s*:\s*(\S+)").expect("valid regex"));
static REASONING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*reasoning\s*:\s*(.+)$").expect("valid regex"));
static MESSAGE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^\s*message\s*:\s*(.+)$").expect("valid regex"));

pub fn parse_decision(raw: &str) -> ParsedDecision {
    parse_with(raw, &DEFAULT_SHAPES)
}

pub fn parse_with(raw: &str, shapes: &[ResponseShape]) -> ParsedDecision {
    for shape in shapes {
        let Some(candidate) = extract(raw, *shape) else {
            continue;
        };
        let reasoning = candidate.reasoning.unwrap_or_default();
        let payload = candidate
            .payload
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        return match DecisionAction::parse(&candidate.action) {
            Some(action) => ParsedDecision {
                action,
                reasoning,
                payload,
                shape: Some(*shape),
                malformed: None,
            },
            None => ParsedDecision {
                reasoning,
                shape: Some(*shape),
                ..ParsedDecision::wait(format!(
                    "action '{}' is not allowed",
                    candidate.action.trim()
                ))
            },
        };
    }
    ParsedDecision::wait("no recognizable decision in response".to_string())
}

fn extract(raw: &str, shape: ResponseShape) -> Option<RawDecision> {
    match shape {
        ResponseShape::JsonObject => {
            let start = raw.find('{')?;
            let end = raw.rfind('}')?;
            if end <= start {
                return None;
            }
            serde_json::from_str(&raw[start..=end]).ok()
        }
        ResponseShape::KeyValueLines => {
            let action = ACTION_LINE.captures(raw)?.get(1)?.as_str().to_string();
            let capture = |re: &Regex| {
                re.captures(raw)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().trim().to_string())
            };
            Some(RawDecision {
                action,
                reasoning: capture(&REASONING_LINE),
                payload: capture(&MESSAGE_LINE),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_embedded_in_prose() {
        let raw = "Here is my call:\n```json\n{\"action\": \"send_message\", \"reasoning\": \"nudge\", \"message\": \"run the tests\"}\n```";
        let parsed = parse_decision(raw);
        assert_eq!(parsed.action, DecisionAction::SendMessage);
        assert_eq!(parsed.payload.as_deref(), Some("run the tests"));
        assert_eq!(parsed.shape, Some(ResponseShape::JsonObject));
        assert!(parsed.malformed.is_none());
    }

    #[test]
    fn parses_key_value_lines() {
        let raw = "ACTION: mark_complete\nREASONING: all criteria met";
        let parsed = parse_decision(raw);
        assert_eq!(parsed.action, DecisionAction::MarkComplete);
        assert_eq!(parsed.reasoning, "all criteria met");
    }

    #[test]
    fn unknown_action_becomes_wait() {
        let parsed = parse_decision(r#"{"action": "rm_rf", "reasoning": "why not"}"#);
        assert_eq!(parsed.action, DecisionAction::Wait);
        assert!(parsed.malformed.as_deref().unwrap_or("").contains("rm_rf"));
    }

    #[test]
    fn garbage_becomes_wait() {
        let parsed = parse_decision("I am not sure what to do.");
        assert_eq!(parsed.action, DecisionAction::Wait);
        assert!(parsed.malformed.is_some());
        assert!(parsed.shape.is_none());
    }

    #[test]
    fn broken_json_falls_through_to_lines() {
        let parsed = parse_decision("{ not json }\nAction: escalate");
        assert_eq!(parsed.action, DecisionAction::Escalate);
        assert_eq!(parsed.shape, Some(ResponseShape::KeyValueLines));
    }
}

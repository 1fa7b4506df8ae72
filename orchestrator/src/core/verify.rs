//! Pure confidence rules for execution verification.
//!
//! Each rule looks at one independent signal and returns evidence, errors
//! and a signed weight. [`score`] sums the weights and clamps to 0..=100.
//! File existence and the alternative probe are resolved by the caller
//! (`verifier` module) so everything here stays free of I/O.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::report::CriterionClaim;
use crate::core::types::{PassCriterion, VerificationResult};

pub const EXECUTED_THRESHOLD: u8 = 50;

pub const PATTERN_FIRST_WEIGHT: i32 = 30;
pub const PATTERN_EXTRA_WEIGHT: i32 = 5;
pub const PATTERN_CAP: i32 = 40;
pub const FILES_WEIGHT: i32 = 30;
pub const COMMAND_CAP: i32 = 40;
pub const CLAIM_PASSED_WEIGHT: i32 = 10;
pub const CLAIM_FAILED_WEIGHT: i32 = -40;
pub const ERROR_PENALTY: i32 = -20;
pub const PROBE_WEIGHT: i32 = 30;

/// What a single criterion expects to observe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Expectation {
    pub description: String,
    pub command: Option<String>,
    /// Regex sources; invalid ones are matched literally.
    pub patterns: Vec<String>,
    pub required_files: Vec<String>,
}

static FILE_EXISTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)file\s+[`'"]?([\w./-]+)[`'"]?\s+(?:exists|is created|present)"#)
        .expect("valid regex")
});

impl Expectation {
    pub fn from_criterion(criterion: &PassCriterion) -> Self {
        let mut expectation = Self {
            description: criterion.description.clone(),
            command: criterion.command.clone(),
            patterns: criterion.expected_patterns.clone(),
            required_files: criterion.required_files.clone(),
        };
        let lower = criterion.description.to_lowercase();

        if expectation.required_files.is_empty()
            && let Some(path) = FILE_EXISTS
                .captures(&criterion.description)
                .and_then(|c| c.get(1))
        {
            expectation.required_files.push(path.as_str().to_string());
        }

        if expectation.patterns.is_empty() {
            if lower.contains("test") && lower.contains("pass") {
                expectation
                    .patterns
                    .push(r"(?i)(✓|\bpassed\b|\bpassing\b|test result: ok|\b0 failed\b)".into());
            }
            if lower.contains("build") {
                expectation
                    .patterns
                    .push(r"(?i)(build\s+succe|\bcompiled\b|\bbuilt\b|\bfinished\b)".into());
            }
            if expectation.patterns.is_empty() {
                expectation
                    .patterns
                    .push(r"(?i)\b(completed?|success(ful(ly)?)?|done|finished)\b".into());
                expectation
                    .patterns
                    .push(r"(?i)\b(created|updated|modified)\b".into());
            }
        }
        expectation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCheck {
    pub path: String,
    pub exists: bool,
}

pub struct RuleInput<'a> {
    pub output: &'a str,
    pub expectation: &'a Expectation,
    pub files: &'a [FileCheck],
    pub claim: CriterionClaim,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub evidence: Vec<String>,
    pub errors: Vec<String>,
    pub weight: i32,
}

impl RuleOutcome {
    fn evidence(text: impl Into<String>, weight: i32) -> Self {
        Self {
            evidence: vec![text.into()],
            errors: Vec::new(),
            weight,
        }
    }

    fn error(text: impl Into<String>, weight: i32) -> Self {
        Self {
            evidence: Vec::new(),
            errors: vec![text.into()],
            weight,
        }
    }
}

pub type Rule = fn(&RuleInput<'_>) -> RuleOutcome;

pub const RULES: [Rule; 5] = [
    pattern_rule,
    artifact_rule,
    command_rule,
    claim_rule,
    error_indicator_rule,
];

pub fn score(input: &RuleInput<'_>) -> VerificationResult {
    let mut evidence = Vec::new();
    let mut errors = Vec::new();
    let mut total = 0i32;
    for rule in RULES {
        let outcome = rule(input);
        total += outcome.weight;
        evidence.extend(outcome.evidence);
        errors.extend(outcome.errors);
    }
    finish(total, evidence, errors)
}

/// Fold alternative-probe evidence into an earlier result.
pub fn with_probe_evidence(result: VerificationResult, probe: &str) -> VerificationResult {
    let total = i32::from(result.confidence) + PROBE_WEIGHT;
    let mut evidence = result.evidence;
    evidence.push(format!("alternative probe: {probe}"));
    finish(total, evidence, result.errors)
}

fn finish(total: i32, evidence: Vec<String>, errors: Vec<String>) -> VerificationResult {
    // Clamped to 0..=100 above, so the narrowing is lossless.
    let confidence = total.clamp(0, 100) as u8;
    VerificationResult {
        executed: confidence >= EXECUTED_THRESHOLD,
        evidence,
        confidence,
        errors,
    }
}

fn compile(source: &str) -> Regex {
    Regex::new(source).unwrap_or_else(|_| {
        Regex::new(&regex::escape(source)).unwrap_or_else(|_| Regex::new("$^").expect("valid regex"))
    })
}

fn pattern_rule(input: &RuleInput<'_>) -> RuleOutcome {
    let patterns = &input.expectation.patterns;
    if patterns.is_empty() {
        return RuleOutcome::default();
    }
    let matched = patterns
        .iter()
        .filter(|p| compile(p).is_match(input.output))
        .count();
    if matched == 0 {
        return RuleOutcome::error("no expected pattern found in output", 0);
    }
    let extra = PATTERN_EXTRA_WEIGHT * (matched as i32 - 1);
    RuleOutcome::evidence(
        format!("matched {matched} of {} expected patterns", patterns.len()),
        (PATTERN_FIRST_WEIGHT + extra).min(PATTERN_CAP),
    )
}

fn artifact_rule(input: &RuleInput<'_>) -> RuleOutcome {
    if input.files.is_empty() {
        return RuleOutcome::default();
    }
    let missing: Vec<&str> = input
        .files
        .iter()
        .filter(|f| !f.exists)
        .map(|f| f.path.as_str())
        .collect();
    if missing.is_empty() {
        return RuleOutcome::evidence(
            format!("all {} required files exist", input.files.len()),
            FILES_WEIGHT,
        );
    }
    RuleOutcome::error(format!("missing files: {}", missing.join(", ")), 0)
}

static ECHO_ARG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"echo\s+["']?([^"'\n]+)["']?"#).expect("valid regex"));

fn command_rule(input: &RuleInput<'_>) -> RuleOutcome {
    let Some(command) = input.expectation.command.as_deref() else {
        return RuleOutcome::default();
    };
    let cmd = command.to_lowercase();
    let out = input.output.to_lowercase();
    let mut outcome = RuleOutcome::default();
    let mut hit = |text: &str, weight: i32| {
        outcome.evidence.push(text.to_string());
        outcome.weight += weight;
    };

    if cmd.contains("git commit")
        && (out.contains("files changed") || out.contains("file changed") || out.contains("insertion"))
    {
        hit("git commit summary present", 20);
    }
    if cmd.contains("git push") && (out.contains("writing objects") || out.contains("branch")) {
        hit("git push transfer output present", 20);
    }
    if (cmd.contains("npm install") || cmd.contains("yarn") || cmd.contains("pnpm install"))
        && (out.contains("packages") || out.contains("dependencies") || out.contains("added"))
    {
        hit("package install output present", 20);
    }
    if cmd.contains("build")
        && (out.contains("built") || out.contains("compiled") || out.contains("finished"))
    {
        hit("build output present", 20);
    }
    if cmd.contains("cargo test") && out.contains("test result: ok") {
        hit("test summary reports ok", 20);
    }
    if cmd.contains("echo")
        && let Some(text) = ECHO_ARG.captures(command).and_then(|c| c.get(1))
        && input.output.contains(text.as_str().trim())
    {
        hit("echoed text present in output", 30);
    }
    if cmd.contains("mkdir") && !out.contains("error") && !out.contains("cannot create") {
        hit("directory creation reported no error", 20);
    }

    outcome.weight = outcome.weight.min(COMMAND_CAP);
    outcome
}

fn claim_rule(input: &RuleInput<'_>) -> RuleOutcome {
    match input.claim {
        CriterionClaim::Passed => {
            RuleOutcome::evidence("worker reports criterion passed", CLAIM_PASSED_WEIGHT)
        }
        CriterionClaim::Failed => {
            RuleOutcome::error("worker reports criterion failed", CLAIM_FAILED_WEIGHT)
        }
        CriterionClaim::Unreported => RuleOutcome::default(),
    }
}

static ERROR_INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)error:",
        r"(?i)fatal:",
        r"(?i)cannot\s+find",
        r"(?i)permission\s+denied",
        r"(?i)not\s+found",
        r"(?i)\binvalid\b",
        r"(?i)exception",
        r"(?i)traceback",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// `failed`, optionally preceded by a count ("0 failed", "3 tests failed").
static FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\b(\d+)\s+(?:tests?\s+)?)?\bfailed\b").expect("valid regex")
});

/// First `failed` that is not a zero count in a test summary.
fn reported_failure(output: &str) -> Option<&str> {
    FAILED
        .captures_iter(output)
        .find(|caps| {
            caps.get(1)
                .is_none_or(|count| count.as_str().parse::<u64>().map_or(true, |n| n > 0))
        })
        .and_then(|caps| caps.get(0))
        .map(|m| m.as_str())
}

fn error_indicator_rule(input: &RuleInput<'_>) -> RuleOutcome {
    let mut found: Vec<String> = ERROR_INDICATORS
        .iter()
        .filter_map(|re| re.find(input.output))
        .map(|m| format!("error indicator: {}", m.as_str()))
        .collect();
    if let Some(failure) = reported_failure(input.output) {
        found.push(format!("error indicator: {failure}"));
    }
    if found.is_empty() {
        return RuleOutcome::default();
    }
    RuleOutcome {
        evidence: Vec::new(),
        errors: found,
        weight: ERROR_PENALTY,
    }
}

//! Worker self-reports on pass criteria.
//!
//! The worker's claim about each criterion is evidence, not proof. Parsing
//! is best-effort: a response that matches no [`ReportShape`] yields an
//! all-`Unreported` report, which contributes nothing to confidence.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionClaim {
    Passed,
    Failed,
    Unreported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportShape {
    /// `{"criteria": [{"index": 1, "passed": true}, ...]}`
    CriteriaJson,
    /// `CRITERION 1: PASS` lines.
    CriteriaLines,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub shape: Option<ReportShape>,
    pub claims: Vec<CriterionClaim>,
}

impl WorkerReport {
    /// Claim for the zero-based criterion `index`.
    pub fn claim(&self, index: usize) -> CriterionClaim {
        self.claims
            .get(index)
            .copied()
            .unwrap_or(CriterionClaim::Unreported)
    }
}

#[derive(Debug, Deserialize)]
struct JsonReport {
    criteria: Vec<JsonClaim>,
}

#[derive(Debug, Deserialize)]
struct JsonClaim {
    index: usize,
    passed: bool,
}

static CLAIM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*criteri(?:on|a)\s*#?(\d+)\s*[:\-]\s*(pass(?:ed)?|fail(?:ed)?)\b")
        .expect("valid regex")
});

pub fn parse_report(output: &str, criteria_count: usize) -> WorkerReport {
    let mut claims = vec![CriterionClaim::Unreported; criteria_count];

    if let Some(report) = json_report(output) {
        for claim in report.criteria {
            set_claim(&mut claims, claim.index, claim.passed);
        }
        return WorkerReport {
            shape: Some(ReportShape::CriteriaJson),
            claims,
        };
    }

    let mut matched = false;
    for caps in CLAIM_LINE.captures_iter(output) {
        let (Some(index), Some(verdict)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let Ok(index) = index.as_str().parse::<usize>() else {
            continue;
        };
        matched = true;
        let passed = verdict.as_str().to_ascii_lowercase().starts_with("pass");
        set_claim(&mut claims, index, passed);
    }

    WorkerReport {
        shape: matched.then_some(ReportShape::CriteriaLines),
        claims,
    }
}

/// Indices in reports are one-based; out-of-range claims are ignored.
fn set_claim(claims: &mut [CriterionClaim], one_based: usize, passed: bool) {
    if one_based == 0 {
        return;
    }
    if let Some(slot) = claims.get_mut(one_based - 1) {
        *slot = if passed {
            CriterionClaim::Passed
        } else {
            CriterionClaim::Failed
        };
    }
}

fn json_report(output: &str) -> Option<JsonReport> {
    let start = output.find("{\"criteria\"")?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&output[start..=end]).ok()
}

//! Execution verifier: confidence that claimed work actually happened.
//!
//! Scoring itself is pure (`core::verify`). This module resolves the
//! signals that need the outside world: required files on disk and, when
//! the first score falls short, an alternative probe of the sandbox state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::report::{CriterionClaim, ReportShape, parse_report};
use crate::core::types::{PassCriterion, VerificationResult};
use crate::core::verify::{Expectation, FileCheck, RuleInput, score, with_probe_evidence};
use crate::error::Result;
use crate::io::worker::ExecutionWorker;

const PROBE_MARKER: &str = "VERIFICATION_SUCCESS";

pub trait ArtifactProbe: Send + Sync {
    fn exists(&self, path: &str) -> bool;
}

/// Files resolved relative to the checkpoint's working directory.
#[derive(Debug, Clone)]
pub struct LocalArtifacts {
    root: PathBuf,
}

impl LocalArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactProbe for LocalArtifacts {
    fn exists(&self, path: &str) -> bool {
        let path = Path::new(path);
        if path.is_absolute() {
            path.exists()
        } else {
            self.root.join(path).exists()
        }
    }
}

/// Re-queries sandbox state directly. Returns new evidence, if any.
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn probe(&self, command: &str) -> Result<Option<String>>;
}

/// Probe that runs a command in the worker session and reads back only
/// the messages that arrived after it.
pub struct SessionProbe<'a> {
    pub worker: &'a dyn ExecutionWorker,
    pub session_id: &'a str,
}

#[async_trait]
impl StateProbe for SessionProbe<'_> {
    async fn probe(&self, command: &str) -> Result<Option<String>> {
        let before = self.worker.list_messages(self.session_id).await?.len();
        self.worker.execute(self.session_id, command).await?;
        let after = self.worker.list_messages(self.session_id).await?;
        let fresh = after
            .get(before..)
            .unwrap_or_default()
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Ok((!fresh.is_empty()).then_some(fresh))
    }
}

/// Probe used when there is no session to ask.
pub struct NoProbe;

#[async_trait]
impl StateProbe for NoProbe {
    async fn probe(&self, _command: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Probe command for the expectation's command family.
pub fn probe_command(expectation: &Expectation) -> &'static str {
    let command = expectation.command.as_deref().unwrap_or_default().to_lowercase();
    if command.contains("git") {
        "git status --short"
    } else if ["npm", "yarn", "pnpm"].iter().any(|p| command.contains(p)) {
        "ls node_modules | head -20"
    } else if command.contains("echo") {
        "echo VERIFICATION_SUCCESS"
    } else {
        "pwd && ls -la"
    }
}

/// Whether probe output counts as evidence for `command`.
fn probe_confirms(command: &str, output: &str) -> bool {
    if command.starts_with("echo") {
        return output.contains(PROBE_MARKER);
    }
    !output.trim().is_empty()
}

#[derive(Debug, Clone, Serialize)]
pub struct CriterionResult {
    pub index: usize,
    pub description: String,
    pub claim: CriterionClaim,
    pub result: VerificationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub report_shape: Option<ReportShape>,
    pub criteria: Vec<CriterionResult>,
}

impl VerificationReport {
    /// One-based numbers of criteria that were not verified.
    pub fn failed_criteria(&self) -> Vec<usize> {
        self.criteria
            .iter()
            .filter(|c| !c.result.executed)
            .map(|c| c.index + 1)
            .collect()
    }
}

pub struct ExecutionVerifier {
    artifacts: Arc<dyn ArtifactProbe>,
}

impl ExecutionVerifier {
    pub fn new(artifacts: Arc<dyn ArtifactProbe>) -> Self {
        Self { artifacts }
    }

    fn file_checks(&self, expectation: &Expectation) -> Vec<FileCheck> {
        expectation
            .required_files
            .iter()
            .map(|path| FileCheck {
                path: path.clone(),
                exists: self.artifacts.exists(path),
            })
            .collect()
    }

    fn score_with_claim(
        &self,
        output: &str,
        expectation: &Expectation,
        claim: CriterionClaim,
    ) -> VerificationResult {
        let files = self.file_checks(expectation);
        score(&RuleInput {
            output,
            expectation,
            files: &files,
            claim,
        })
    }

    pub fn verify(&self, output: &str, expectation: &Expectation) -> VerificationResult {
        self.score_with_claim(output, expectation, CriterionClaim::Unreported)
    }

    /// Score, then fall back to the alternative probe below threshold.
    pub async fn verify_with_probe(
        &self,
        output: &str,
        expectation: &Expectation,
        claim: CriterionClaim,
        probe: &dyn StateProbe,
    ) -> VerificationResult {
        let result = self.score_with_claim(output, expectation, claim);
        if result.executed {
            return result;
        }
        let command = probe_command(expectation);
        match probe.probe(command).await {
            Ok(Some(evidence)) if probe_confirms(command, &evidence) => {
                debug!(command, "alternative probe produced evidence");
                with_probe_evidence(result, command)
            }
            Ok(_) => result,
            Err(err) => {
                warn!(command, error = %err, "alternative probe failed");
                result
            }
        }
    }

    /// Verify each criterion on its own. Passing requires every one.
    #[instrument(skip_all, fields(criteria = criteria.len()))]
    pub async fn verify_criteria(
        &self,
        output: &str,
        criteria: &[PassCriterion],
        probe: &dyn StateProbe,
    ) -> VerificationReport {
        let report = parse_report(output, criteria.len());
        let mut results = Vec::with_capacity(criteria.len());
        for (index, criterion) in criteria.iter().enumerate() {
            let expectation = Expectation::from_criterion(criterion);
            let claim = report.claim(index);
            let result = self
                .verify_with_probe(output, &expectation, claim, probe)
                .await;
            debug!(index, confidence = result.confidence, executed = result.executed, "criterion scored");
            results.push(CriterionResult {
                index,
                description: criterion.description.clone(),
                claim,
                result,
            });
        }
        let passed = !results.is_empty() && results.iter().all(|c| c.result.executed);
        VerificationReport {
            passed,
            report_shape: report.shape,
            criteria: results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FAILING_OUTPUT, PASSING_OUTPUT, ScriptedSession, ScriptedWorker};
    use crate::io::worker::SessionContext;

    struct Files(Vec<&'static str>);

    impl ArtifactProbe for Files {
        fn exists(&self, path: &str) -> bool {
            self.0.contains(&path)
        }
    }

    struct FixedProbe(Option<&'static str>);

    #[async_trait]
    impl StateProbe for FixedProbe {
        async fn probe(&self, _command: &str) -> Result<Option<String>> {
            Ok(self.0.map(str::to_string))
        }
    }

    fn verifier(files: Vec<&'static str>) -> ExecutionVerifier {
        ExecutionVerifier::new(Arc::new(Files(files)))
    }

    fn echo_criterion() -> PassCriterion {
        PassCriterion {
            command: Some("echo STEP_OK".to_string()),
            ..PassCriterion::described("marker echoed")
        }
    }

    #[test]
    fn probe_command_follows_command_family() {
        let git = Expectation {
            command: Some("git commit -m x".to_string()),
            ..Expectation::default()
        };
        assert_eq!(probe_command(&git), "git status --short");
        let npm = Expectation {
            command: Some("npm install".to_string()),
            ..Expectation::default()
        };
        assert_eq!(probe_command(&npm), "ls node_modules | head -20");
        assert_eq!(probe_command(&Expectation::default()), "pwd && ls -la");
    }

    #[test]
    fn required_file_is_checked_on_disk() {
        let expectation = Expectation {
            required_files: vec!["src/parser.rs".to_string()],
            ..Expectation::default()
        };
        assert_eq!(verifier(vec!["src/parser.rs"]).verify("", &expectation).confidence, 30);
        assert_eq!(verifier(vec![]).verify("", &expectation).confidence, 0);
    }

    #[tokio::test]
    async fn every_criterion_must_verify() {
        let criteria = vec![
            echo_criterion(),
            PassCriterion::described("file src/parser.rs exists"),
        ];
        let output = "STEP_OK completed\nCRITERION 1: PASS\nCRITERION 2: PASS";
        let report = verifier(vec![])
            .verify_criteria(output, &criteria, &NoProbe)
            .await;
        assert!(!report.passed);
        assert_eq!(report.failed_criteria(), vec![2]);

        let report = verifier(vec!["src/parser.rs"])
            .verify_criteria(output, &criteria, &NoProbe)
            .await;
        assert!(report.passed, "{report:?}");
        assert_eq!(report.report_shape, Some(ReportShape::CriteriaLines));
    }

    #[tokio::test]
    async fn probe_lifts_borderline_result() {
        let expectation = Expectation {
            command: Some("echo STEP_OK".to_string()),
            ..Expectation::default()
        };
        let verifier = verifier(vec![]);
        let weak = verifier
            .verify_with_probe("STEP_OK", &expectation, CriterionClaim::Unreported, &NoProbe)
            .await;
        assert_eq!(weak.confidence, 30);
        assert!(!weak.executed);

        let lifted = verifier
            .verify_with_probe(
                "STEP_OK",
                &expectation,
                CriterionClaim::Unreported,
                &FixedProbe(Some("VERIFICATION_SUCCESS")),
            )
            .await;
        assert_eq!(lifted.confidence, 60);
        assert!(lifted.executed);

        let unconfirmed = verifier
            .verify_with_probe(
                "STEP_OK",
                &expectation,
                CriterionClaim::Unreported,
                &FixedProbe(Some("something else")),
            )
            .await;
        assert!(!unconfirmed.executed);
    }

    #[tokio::test]
    async fn session_probe_ignores_earlier_messages() {
        let worker = ScriptedWorker::new(vec![ScriptedSession::passing(PASSING_OUTPUT)]);
        let session = worker
            .submit(&SessionContext {
                working_dir: PathBuf::from("/tmp"),
                label: "cp".to_string(),
            })
            .await
            .expect("submit");
        let probe = SessionProbe {
            worker: &worker,
            session_id: &session,
        };
        assert_eq!(probe.probe("echo VERIFICATION_SUCCESS").await.expect("probe"), None);
    }

    #[tokio::test]
    async fn failing_output_does_not_pass() {
        let report = verifier(vec![])
            .verify_criteria(FAILING_OUTPUT, &[echo_criterion()], &NoProbe)
            .await;
        assert!(!report.passed);
        assert_eq!(report.criteria[0].claim, CriterionClaim::Failed);
        assert_eq!(report.criteria[0].result.confidence, 0);
    }
}

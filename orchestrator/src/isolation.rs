//! Checkpoint isolation executor.
//!
//! Every attempt gets a brand-new worker session that knows only the
//! working directory and this checkpoint's brief. The session is torn down
//! and its instance marked terminal on every exit path before the outcome
//! is returned, so the next attempt never overlaps with this one.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::types::{
    Checkpoint, Heartbeat, InstanceKind, InstanceStatus, LogLevel, MessageRole, Timestamp, new_id,
};
use crate::error::{Error, Result};
use crate::io::config::ExecutionConfig;
use crate::io::journal::{AttemptJournal, AttemptMeta, AttemptRecord};
use crate::io::prompt::PromptRenderer;
use crate::io::worker::{ExecutionWorker, SessionContext, SessionState};
use crate::registry::{InstanceRegistry, Registration};
use crate::verifier::{ExecutionVerifier, LocalArtifacts, SessionProbe, VerificationReport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkingContext {
    pub working_dir: PathBuf,
    pub task_id: Option<String>,
    /// Task control instance that owns the attempt, if any.
    pub parent_instance: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The poll budget ran out before the session finished.
    Timeout { polls: u32 },
    Worker(String),
    /// One-based numbers of the criteria that were not verified.
    Verification { failed_criteria: Vec<usize> },
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { polls } => write!(f, "timed out after {polls} polls"),
            Self::Worker(message) => write!(f, "worker error: {message}"),
            Self::Verification { failed_criteria } => {
                let list = failed_criteria
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "criteria not verified: {list}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub checkpoint_id: String,
    pub instance_id: String,
    pub session_id: Option<String>,
    pub attempt: u32,
    pub passed: bool,
    pub output: String,
    pub report: Option<VerificationReport>,
    pub failure: Option<FailureKind>,
    pub duration_ms: u64,
}

struct AttemptResult {
    output: String,
    report: Option<VerificationReport>,
    failure: Option<FailureKind>,
}

pub struct IsolationExecutor {
    registry: Arc<InstanceRegistry>,
    worker: Arc<dyn ExecutionWorker>,
    prompts: Arc<PromptRenderer>,
    journal: Option<AttemptJournal>,
    config: ExecutionConfig,
}

impl IsolationExecutor {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        worker: Arc<dyn ExecutionWorker>,
        prompts: Arc<PromptRenderer>,
        journal: Option<AttemptJournal>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            worker,
            prompts,
            journal,
            config,
        }
    }

    /// Run one isolated attempt of `checkpoint`.
    ///
    /// Fails only when the attempt could not start (capacity, a live
    /// instance already bound to the checkpoint, an unrenderable brief).
    /// Worker errors, timeouts and unverified criteria come back as a
    /// failed outcome.
    #[instrument(skip_all, fields(checkpoint_id = %checkpoint.id, attempt = checkpoint.retry_count + 1))]
    pub async fn execute_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        context: &WorkingContext,
    ) -> Result<ExecutionOutcome> {
        let attempt = checkpoint.retry_count + 1;
        let started_at = self.registry.now();
        let started = Instant::now();
        let instance_id = new_id("inst");

        self.registry.register(
            &instance_id,
            Registration {
                kind: Some(InstanceKind::Checkpoint),
                parent_id: context.parent_instance.clone(),
                task_id: context.task_id.clone().or_else(|| Some(checkpoint.task_id.clone())),
                checkpoint_id: Some(checkpoint.id.clone()),
                ..Registration::default()
            },
        )?;

        let brief = match self
            .prompts
            .render_checkpoint(checkpoint, &context.working_dir)
        {
            Ok(brief) => brief,
            Err(err) => {
                let err = Error::from(err.context("render checkpoint brief"));
                self.registry.set_status(&instance_id, InstanceStatus::Errored)?;
                return Err(err);
            }
        };

        let mut session_id = None;
        let result = match self
            .run_attempt(&instance_id, checkpoint, &brief, context, &mut session_id)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                if let Err(log_err) =
                    self.registry
                        .log(&instance_id, LogLevel::Error, format!("attempt aborted: {err}"))
                {
                    warn!(error = %log_err, "instance log write failed");
                }
                AttemptResult {
                    output: String::new(),
                    report: None,
                    failure: Some(FailureKind::Worker(err.to_string())),
                }
            }
        };

        // Teardown happens on every path, before the outcome is visible.
        if let Some(session) = &session_id
            && let Err(err) = self.worker.terminate(session).await
        {
            warn!(session_id = %session, error = %err, "session teardown failed");
            if let Err(log_err) =
                self.registry
                    .log(&instance_id, LogLevel::Warn, format!("teardown failed: {err}"))
            {
                warn!(error = %log_err, "instance log write failed");
            }
        }
        let passed = result.failure.is_none();
        let terminal = if passed {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Errored
        };
        self.registry.set_status(&instance_id, terminal)?;

        let outcome = ExecutionOutcome {
            checkpoint_id: checkpoint.id.clone(),
            instance_id,
            session_id,
            attempt,
            passed,
            output: result.output,
            report: result.report,
            failure: result.failure,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        self.journal_attempt(&outcome, started_at);
        info!(passed, duration_ms = outcome.duration_ms, "attempt finished");
        Ok(outcome)
    }

    async fn run_attempt(
        &self,
        instance_id: &str,
        checkpoint: &Checkpoint,
        brief: &str,
        context: &WorkingContext,
        session_slot: &mut Option<String>,
    ) -> Result<AttemptResult> {
        let session = self
            .worker
            .submit(&SessionContext {
                working_dir: context.working_dir.clone(),
                label: checkpoint.name.clone(),
            })
            .await?;
        *session_slot = Some(session.clone());
        self.registry.update(instance_id, |instance| {
            instance.session_id = Some(session.clone());
            Ok(())
        })?;

        self.worker.execute(&session, brief).await?;
        self.registry
            .append_message(instance_id, MessageRole::Orchestrator, brief)?;

        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut finished = None;
        for _ in 0..self.config.poll_max_attempts {
            let status = self.worker.poll_status(&session).await?;
            self.registry.record_heartbeat(
                instance_id,
                Heartbeat {
                    at: self.registry.now(),
                    checkpoint_id: Some(checkpoint.id.clone()),
                    status: format!("{:?}", status.status).to_lowercase(),
                    message: status.error.clone(),
                },
            )?;
            match status.status {
                state if state.is_finished() => {
                    finished = Some(status);
                    break;
                }
                SessionState::Errored => {
                    let message = status
                        .error
                        .unwrap_or_else(|| "session errored".to_string());
                    self.registry
                        .log(instance_id, LogLevel::Error, message.clone())?;
                    return Ok(AttemptResult {
                        output: status.last_output,
                        report: None,
                        failure: Some(FailureKind::Worker(message)),
                    });
                }
                _ => tokio::time::sleep(interval).await,
            }
        }

        let Some(status) = finished else {
            let polls = self.config.poll_max_attempts;
            self.registry.log(
                instance_id,
                LogLevel::Error,
                Error::Timeout { attempts: polls }.to_string(),
            )?;
            return Ok(AttemptResult {
                output: String::new(),
                report: None,
                failure: Some(FailureKind::Timeout { polls }),
            });
        };

        let messages = self.worker.list_messages(&session).await?;
        let output = if messages.is_empty() {
            status.last_output
        } else {
            messages.join("\n")
        };
        self.registry
            .append_message(instance_id, MessageRole::Worker, &output)?;

        let verifier = ExecutionVerifier::new(Arc::new(LocalArtifacts::new(&context.working_dir)));
        let probe = SessionProbe {
            worker: self.worker.as_ref(),
            session_id: &session,
        };
        let report = verifier
            .verify_criteria(&output, &checkpoint.pass_criteria, &probe)
            .await;
        let failure = (!report.passed).then(|| FailureKind::Verification {
            failed_criteria: report.failed_criteria(),
        });
        Ok(AttemptResult {
            output,
            report: Some(report),
            failure,
        })
    }

    fn journal_attempt(&self, outcome: &ExecutionOutcome, started_at: Timestamp) {
        let Some(journal) = &self.journal else {
            return;
        };
        let meta = AttemptMeta {
            checkpoint_id: outcome.checkpoint_id.clone(),
            attempt: outcome.attempt,
            instance_id: outcome.instance_id.clone(),
            session_id: outcome.session_id.clone(),
            passed: outcome.passed,
            failure: outcome.failure.as_ref().map(ToString::to_string),
            started_at,
            ended_at: self.registry.now(),
            duration_ms: outcome.duration_ms,
        };
        let record = AttemptRecord {
            meta: &meta,
            output: &outcome.output,
            verification: outcome.report.as_ref(),
        };
        if let Err(err) = journal.write(&record) {
            warn!(checkpoint_id = %outcome.checkpoint_id, error = %format!("{err:#}"), "attempt journal write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::events::EventBus;
    use crate::io::config::RegistryConfig;
    use crate::io::store::MemoryRepository;
    use crate::test_support::{
        ManualClock, PASSING_OUTPUT, ScriptedSession, ScriptedWorker, checkpoint, fast_config,
    };

    fn executor(
        worker: Arc<ScriptedWorker>,
        max_instances: usize,
        journal: Option<AttemptJournal>,
    ) -> (IsolationExecutor, Arc<InstanceRegistry>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let registry = Arc::new(InstanceRegistry::new(
            Arc::new(MemoryRepository::new()),
            RegistryConfig {
                max_instances,
                ..RegistryConfig::default()
            },
            clock,
            EventBus::default(),
        ));
        let executor = IsolationExecutor::new(
            registry.clone(),
            worker,
            Arc::new(PromptRenderer::new()),
            journal,
            fast_config().execution,
        );
        (executor, registry)
    }

    fn context() -> WorkingContext {
        WorkingContext {
            working_dir: std::env::temp_dir(),
            task_id: Some("task-1".to_string()),
            parent_instance: None,
        }
    }

    #[tokio::test]
    async fn passing_attempt_terminates_session_and_completes_instance() {
        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedSession::passing(PASSING_OUTPUT)]));
        let (executor, registry) = executor(worker.clone(), 5, None);
        let outcome = executor
            .execute_checkpoint(&checkpoint("cp-1", "task-1"), &context())
            .await
            .expect("execute");
        assert!(outcome.passed, "{outcome:?}");
        assert_eq!(worker.terminated(), vec!["session-1".to_string()]);
        let instance = registry.require(&outcome.instance_id).expect("instance");
        assert_eq!(instance.status, InstanceStatus::Completed);
        assert_eq!(instance.kind, InstanceKind::Checkpoint);
        assert!(!instance.heartbeats.is_empty());
    }

    #[tokio::test]
    async fn brief_carries_only_this_checkpoint() {
        let worker = Arc::new(ScriptedWorker::new(vec![
            ScriptedSession::passing(PASSING_OUTPUT),
            ScriptedSession::passing(PASSING_OUTPUT),
        ]));
        let (executor, _) = executor(worker.clone(), 5, None);
        let mut first = checkpoint("cp-1", "task-1");
        first.objective = "write the alpha module".to_string();
        let mut second = checkpoint("cp-2", "task-1");
        second.objective = "write the beta module".to_string();
        executor.execute_checkpoint(&first, &context()).await.expect("first");
        executor.execute_checkpoint(&second, &context()).await.expect("second");

        let executed = worker.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[1].0, "session-2");
        assert!(executed[1].1.contains("beta"));
        assert!(!executed[1].1.contains("alpha"));
        assert!(!executed[1].1.contains("STEP_OK completed"));
        assert_eq!(worker.max_live(), 1);
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_is_a_timeout() {
        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedSession::running_forever()]));
        let (executor, registry) = executor(worker.clone(), 5, None);
        let outcome = executor
            .execute_checkpoint(&checkpoint("cp-1", "task-1"), &context())
            .await
            .expect("execute");
        assert!(!outcome.passed);
        assert_eq!(outcome.failure, Some(FailureKind::Timeout { polls: 5 }));
        assert_eq!(worker.terminated().len(), 1);
        let instance = registry.require(&outcome.instance_id).expect("instance");
        assert_eq!(instance.status, InstanceStatus::Errored);
        assert!(instance.log.iter().any(|l| l.message.contains("timed out")));
    }

    #[tokio::test]
    async fn submit_failure_still_marks_instance_terminal() {
        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedSession::rejected("no capacity")]));
        let (executor, registry) = executor(worker.clone(), 5, None);
        let outcome = executor
            .execute_checkpoint(&checkpoint("cp-1", "task-1"), &context())
            .await
            .expect("execute");
        assert!(matches!(outcome.failure, Some(FailureKind::Worker(_))));
        assert!(outcome.session_id.is_none());
        assert_eq!(
            registry.require(&outcome.instance_id).expect("instance").status,
            InstanceStatus::Errored
        );
    }

    #[tokio::test]
    async fn registry_capacity_refuses_the_attempt() {
        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedSession::passing(PASSING_OUTPUT)]));
        let (executor, registry) = executor(worker.clone(), 1, None);
        registry
            .register("busy", Registration::default())
            .expect("fill capacity");
        let err = executor
            .execute_checkpoint(&checkpoint("cp-1", "task-1"), &context())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 1 }));
        assert_eq!(worker.submit_attempts(), 0);
    }

    #[tokio::test]
    async fn attempts_are_journaled() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = Arc::new(ScriptedWorker::new(vec![ScriptedSession::failing()]));
        let journal = AttemptJournal::new(temp.path(), 10_000);
        let (executor, _) = executor(worker, 5, Some(journal));
        let outcome = executor
            .execute_checkpoint(&checkpoint("cp-1", "task-1"), &context())
            .await
            .expect("execute");
        assert!(!outcome.passed);
        let dir = temp.path().join("cp-1").join("1");
        assert!(dir.join("meta.json").exists());
        assert!(dir.join("verification.json").exists());
        let output = std::fs::read_to_string(dir.join("output.log")).expect("output");
        assert!(output.contains("build broke"));
    }
}

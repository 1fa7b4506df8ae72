//! Task supervisor: drives a task's checkpoints in order.
//!
//! A task run is owned by a task-kind control instance whose
//! `checkpoint_index` is the current-checkpoint pointer. Pausing that
//! instance stops dispatch at the next checkpoint boundary; resuming and
//! calling [`TaskSupervisor::drive`] continues from the pointer. Rollback
//! moves the pointer back one position.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::lifecycle::{
    CheckpointEvent, TaskEvent, check_instance_status, next_checkpoint_status,
};
use crate::core::retry::RetryVerdict;
use crate::core::selector::{Blocked, blocking_all_passed, dependencies_satisfied};
use crate::core::types::{
    Checkpoint, CheckpointStatus, Heartbeat, Instance, InstanceKind, InstanceStatus, LogLevel,
    TaskStatus, new_id,
};
use crate::entities::EntityStore;
use crate::error::{Error, Result};
use crate::escalation::{Escalator, TICKET_KEY};
use crate::events::{EventBus, OrchestratorEvent};
use crate::isolation::{IsolationExecutor, WorkingContext};
use crate::registry::{InstanceRegistry, Registration};

const WORKING_DIR_KEY: &str = "working_dir";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskRunState {
    /// Every blocking checkpoint passed.
    Completed,
    /// The control instance was paused; `drive` continues from the pointer.
    Paused,
    /// A blocking checkpoint exhausted its retries and the task halted.
    Escalated {
        checkpoint_id: String,
        ticket_id: Option<String>,
    },
    /// The checkpoint at the pointer has a dependency that did not pass.
    Blocked {
        checkpoint_id: String,
        dependency: String,
    },
    /// The control instance is finished and will not be driven again.
    Stopped { status: InstanceStatus },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRun {
    pub instance_id: String,
    pub task_id: String,
    pub checkpoint_index: usize,
    #[serde(flatten)]
    pub state: TaskRunState,
}

enum CheckpointVerdict {
    Passed,
    Paused,
    Exhausted { ticket_id: String },
}

pub struct TaskSupervisor {
    entities: Arc<EntityStore>,
    registry: Arc<InstanceRegistry>,
    executor: IsolationExecutor,
    escalator: Arc<Escalator>,
    events: EventBus,
    retry_delay: Duration,
}

impl TaskSupervisor {
    pub fn new(
        entities: Arc<EntityStore>,
        registry: Arc<InstanceRegistry>,
        executor: IsolationExecutor,
        escalator: Arc<Escalator>,
        events: EventBus,
        retry_delay: Duration,
    ) -> Self {
        Self {
            entities,
            registry,
            executor,
            escalator,
            events,
            retry_delay,
        }
    }

    /// Register a control instance for `task_id` without driving it.
    pub fn start(&self, task_id: &str, working_dir: PathBuf) -> Result<Instance> {
        let task = self.entities.get_task(task_id)?;
        if let Some(live) = self.registry.live_for_task(task_id) {
            return Err(Error::validation(format!(
                "task '{task_id}' is already driven by instance '{}'",
                live.id
            )));
        }
        let event = match task.status {
            TaskStatus::Pending => Some(TaskEvent::Start),
            TaskStatus::InProgress => None,
            TaskStatus::Failed | TaskStatus::Escalated => Some(TaskEvent::Reopen),
            TaskStatus::Completed => {
                return Err(Error::validation(format!("task '{task_id}' is already completed")));
            }
        };

        let instance = self.registry.register(
            &new_id("inst"),
            Registration {
                kind: Some(InstanceKind::Task),
                task_id: Some(task_id.to_string()),
                metadata: BTreeMap::from([(
                    WORKING_DIR_KEY.to_string(),
                    working_dir.display().to_string(),
                )]),
                ..Registration::default()
            },
        )?;
        if let Some(event) = event
            && let Err(err) = self.entities.apply_task_event(task_id, event)
        {
            self.registry.remove(&instance.id)?;
            return Err(err);
        }
        info!(task_id, instance_id = %instance.id, "task run started");
        Ok(instance)
    }

    /// Start a task and drive it until it completes, pauses or halts.
    pub async fn run_task(&self, task_id: &str, working_dir: PathBuf) -> Result<TaskRun> {
        let instance = self.start(task_id, working_dir)?;
        self.drive(&instance.id).await
    }

    /// Continue a task run from its stored pointer.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn drive(&self, instance_id: &str) -> Result<TaskRun> {
        loop {
            let instance = self.registry.require(instance_id)?;
            if instance.kind != InstanceKind::Task {
                return Err(Error::validation(format!(
                    "instance '{instance_id}' is not a task control instance"
                )));
            }
            let task_id = instance
                .task_id
                .clone()
                .ok_or_else(|| Error::validation(format!("instance '{instance_id}' has no task")))?;
            let run = |state| TaskRun {
                instance_id: instance.id.clone(),
                task_id: task_id.clone(),
                checkpoint_index: instance.checkpoint_index,
                state,
            };
            match instance.status {
                InstanceStatus::Active => {}
                InstanceStatus::Paused => return Ok(run(TaskRunState::Paused)),
                status => return Ok(run(TaskRunState::Stopped { status })),
            }

            let checkpoints = self.entities.task_checkpoints(&task_id)?;
            let index = instance.checkpoint_index;
            let Some(checkpoint) = checkpoints.get(index) else {
                self.finish(&instance, &task_id, &checkpoints)?;
                return Ok(run(TaskRunState::Completed));
            };

            match checkpoint.status {
                CheckpointStatus::Pass => {
                    self.advance_pointer(instance_id, index)?;
                    continue;
                }
                status if status.is_exhausted() => {
                    let ticket_id = self.ensure_ticket(checkpoint).await?;
                    if !checkpoint.blocking {
                        self.advance_pointer(instance_id, index)?;
                        continue;
                    }
                    self.halt(&instance, &task_id)?;
                    return Ok(run(TaskRunState::Escalated {
                        checkpoint_id: checkpoint.id.clone(),
                        ticket_id: Some(ticket_id),
                    }));
                }
                CheckpointStatus::InProgress | CheckpointStatus::Fail => {
                    if self.registry.active_for_checkpoint(&checkpoint.id).is_some() {
                        return Err(Error::validation(format!(
                            "checkpoint '{}' already has an attempt in flight",
                            checkpoint.id
                        )));
                    }
                    // Left behind by an interrupted attempt.
                    self.entities
                        .apply_checkpoint_event(&checkpoint.id, CheckpointEvent::Reset)?;
                    continue;
                }
                _ => {}
            }

            if let Err(blocked) = dependencies_satisfied(checkpoint, &checkpoints) {
                let (Blocked::Dependency { dependency, .. }
                | Blocked::MissingDependency { dependency, .. }) = blocked;
                self.registry.log(
                    instance_id,
                    LogLevel::Warn,
                    format!("checkpoint {} blocked on {dependency}", checkpoint.id),
                )?;
                return Ok(run(TaskRunState::Blocked {
                    checkpoint_id: checkpoint.id.clone(),
                    dependency,
                }));
            }

            let context = WorkingContext {
                working_dir: instance
                    .metadata
                    .get(WORKING_DIR_KEY)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
                task_id: Some(task_id.clone()),
                parent_instance: Some(instance.id.clone()),
            };
            match self.run_checkpoint(instance_id, checkpoint.clone(), &context).await? {
                CheckpointVerdict::Passed => self.advance_pointer(instance_id, index)?,
                CheckpointVerdict::Paused => {
                    return Ok(run(TaskRunState::Paused));
                }
                CheckpointVerdict::Exhausted { ticket_id } => {
                    if checkpoint.blocking {
                        self.halt(&instance, &task_id)?;
                        return Ok(run(TaskRunState::Escalated {
                            checkpoint_id: checkpoint.id.clone(),
                            ticket_id: Some(ticket_id),
                        }));
                    }
                    warn!(checkpoint_id = %checkpoint.id, "non-blocking checkpoint escalated, continuing");
                    self.advance_pointer(instance_id, index)?;
                }
            }
        }
    }

    /// Attempt `checkpoint` until it passes, exhausts its retries, or the
    /// run is paused between attempts.
    async fn run_checkpoint(
        &self,
        instance_id: &str,
        checkpoint: Checkpoint,
        context: &WorkingContext,
    ) -> Result<CheckpointVerdict> {
        let id = checkpoint.id;
        loop {
            let checkpoint = self
                .entities
                .apply_checkpoint_event(&id, CheckpointEvent::Start)?;
            let outcome = match self.executor.execute_checkpoint(&checkpoint, context).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.entities
                        .apply_checkpoint_event(&id, CheckpointEvent::Reset)?;
                    return Err(err);
                }
            };
            let failure = outcome.failure.as_ref().map(ToString::to_string);
            self.registry.record_heartbeat(
                instance_id,
                Heartbeat {
                    at: self.registry.now(),
                    checkpoint_id: Some(id.clone()),
                    status: if outcome.passed { "pass" } else { "fail" }.to_string(),
                    message: failure.clone(),
                },
            )?;

            if outcome.passed {
                let checkpoint = self.entities.apply_checkpoint_event(&id, CheckpointEvent::Pass)?;
                self.entities.log_checkpoint(
                    &id,
                    LogLevel::Info,
                    format!("attempt {} passed", outcome.attempt),
                )?;
                self.finished(&checkpoint);
                return Ok(CheckpointVerdict::Passed);
            }

            let reason = failure.unwrap_or_else(|| "attempt failed".to_string());
            self.entities.log_checkpoint(
                &id,
                LogLevel::Error,
                format!("attempt {} failed: {reason}", outcome.attempt),
            )?;
            let (verdict, checkpoint) = self.entities.record_checkpoint_failure(&id)?;

            match verdict {
                RetryVerdict::Retry { failures, remaining } => {
                    info!(checkpoint_id = %id, failures, remaining, "scheduling fresh attempt");
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    if self.registry.require(instance_id)?.status == InstanceStatus::Paused {
                        return Ok(CheckpointVerdict::Paused);
                    }
                }
                RetryVerdict::Exhausted { failures } => {
                    warn!(checkpoint_id = %id, failures, "retries exhausted");
                    let ticket_id = self.file_ticket(&checkpoint, &reason).await?;
                    self.finished(&self.entities.get_checkpoint(&id)?);
                    return Ok(CheckpointVerdict::Exhausted { ticket_id });
                }
            }
        }
    }

    /// Escalate an exhausted checkpoint and remember its ticket.
    async fn file_ticket(&self, checkpoint: &Checkpoint, reason: &str) -> Result<String> {
        let ticket_id = self.escalator.escalate_checkpoint(checkpoint, reason).await?;
        self.entities.update_checkpoint(&checkpoint.id, |checkpoint| {
            checkpoint.ticket_id = Some(ticket_id.clone());
            Ok(())
        })?;
        self.entities.log_checkpoint(
            &checkpoint.id,
            LogLevel::Warn,
            format!(
                "escalated after {} failures, ticket {ticket_id}",
                checkpoint.retry_count
            ),
        )?;
        Ok(ticket_id)
    }

    /// Ticket of an exhausted checkpoint, filing it now if an earlier
    /// escalation never completed.
    async fn ensure_ticket(&self, checkpoint: &Checkpoint) -> Result<String> {
        match &checkpoint.ticket_id {
            Some(ticket_id) => Ok(ticket_id.clone()),
            None => {
                warn!(checkpoint_id = %checkpoint.id, "exhausted checkpoint has no ticket, escalating");
                self.file_ticket(checkpoint, "retries exhausted; earlier escalation did not complete")
                    .await
            }
        }
    }

    fn finished(&self, checkpoint: &Checkpoint) {
        self.events.emit(OrchestratorEvent::CheckpointFinished {
            checkpoint_id: checkpoint.id.clone(),
            status: checkpoint.status,
            retry_count: checkpoint.retry_count,
        });
    }

    /// Move the pointer past `from`, unless a rollback already moved it.
    fn advance_pointer(&self, instance_id: &str, from: usize) -> Result<()> {
        let now = self.registry.now();
        self.registry.update(instance_id, |instance| {
            if instance.checkpoint_index == from {
                instance.checkpoint_index = from + 1;
            }
            instance.last_activity = now;
            Ok(())
        })
    }

    fn finish(&self, instance: &Instance, task_id: &str, checkpoints: &[Checkpoint]) -> Result<()> {
        if !blocking_all_passed(checkpoints) {
            return Err(Error::validation(format!(
                "task '{task_id}' reached its end with blocking checkpoints not passed"
            )));
        }
        if self.entities.get_task(task_id)?.status == TaskStatus::InProgress {
            self.entities.apply_task_event(task_id, TaskEvent::Complete)?;
        }
        self.registry
            .set_status(&instance.id, InstanceStatus::Completed)?;
        info!(task_id, "task completed");
        Ok(())
    }

    fn halt(&self, instance: &Instance, task_id: &str) -> Result<()> {
        if self.entities.get_task(task_id)?.status == TaskStatus::InProgress {
            self.entities.apply_task_event(task_id, TaskEvent::Escalate)?;
        }
        self.registry
            .set_status(&instance.id, InstanceStatus::Escalated)?;
        warn!(task_id, "task halted on a blocking checkpoint");
        Ok(())
    }

    /// Freeze dispatch for an instance. Position and history are kept.
    pub fn pause(&self, instance_id: &str) -> Result<Instance> {
        let instance = self.registry.set_status(instance_id, InstanceStatus::Paused)?;
        self.registry.log(instance_id, LogLevel::Info, "paused")?;
        Ok(instance)
    }

    /// Re-activate a paused instance. Task runs continue via `drive`.
    pub fn resume(&self, instance_id: &str) -> Result<Instance> {
        let current = self.registry.require(instance_id)?;
        if current.status != InstanceStatus::Paused {
            return Err(Error::validation(format!(
                "instance '{instance_id}' is '{}', not paused",
                current.status.as_str()
            )));
        }
        let instance = self.registry.set_status(instance_id, InstanceStatus::Active)?;
        self.registry.log(instance_id, LogLevel::Info, "resumed")?;
        Ok(instance)
    }

    /// Move the pointer back one checkpoint and reset it and everything
    /// after it to `pending`.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub fn rollback(&self, instance_id: &str) -> Result<Instance> {
        let instance = self.registry.require(instance_id)?;
        if instance.kind != InstanceKind::Task {
            return Err(Error::validation("rollback applies to task control instances"));
        }
        if instance.checkpoint_index == 0 {
            return Err(Error::validation("already at the first checkpoint"));
        }
        check_instance_status(instance.status, InstanceStatus::Active)?;
        let task_id = instance
            .task_id
            .clone()
            .ok_or_else(|| Error::validation(format!("instance '{instance_id}' has no task")))?;
        let checkpoints = self.entities.task_checkpoints(&task_id)?;
        if let Some(busy) = checkpoints
            .iter()
            .find(|c| self.registry.active_for_checkpoint(&c.id).is_some())
        {
            return Err(Error::validation(format!(
                "checkpoint '{}' has an attempt in flight",
                busy.id
            )));
        }

        let target = (instance.checkpoint_index - 1).min(checkpoints.len().saturating_sub(1));
        for checkpoint in &checkpoints[target..] {
            self.entities.update_checkpoint(&checkpoint.id, |cp| {
                if cp.status != CheckpointStatus::Pending {
                    cp.status = next_checkpoint_status(cp.status, CheckpointEvent::Reset)?;
                }
                cp.retry_count = 0;
                cp.needs_escalation = false;
                Ok(())
            })?;
            self.entities
                .log_checkpoint(&checkpoint.id, LogLevel::Info, "reset by rollback")?;
        }

        let task = self.entities.get_task(&task_id)?;
        match task.status {
            TaskStatus::Pending => {
                self.entities.apply_task_event(&task_id, TaskEvent::Start)?;
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Escalated => {
                self.entities.apply_task_event(&task_id, TaskEvent::Reopen)?;
            }
            TaskStatus::InProgress => {}
        }

        let now = self.registry.now();
        let instance = self.registry.update(instance_id, |instance| {
            instance.checkpoint_index = target;
            instance.status = InstanceStatus::Active;
            instance.last_activity = now;
            Ok(instance.clone())
        })?;
        self.registry.log(
            instance_id,
            LogLevel::Info,
            format!("rolled back to checkpoint {}", target + 1),
        )?;
        info!(target, "rolled back");
        Ok(instance)
    }

    /// Manual escalation: open a ticket and mark the instance escalated.
    pub async fn escalate_instance(&self, instance_id: &str, reason: &str) -> Result<String> {
        let instance = self.registry.require(instance_id)?;
        check_instance_status(instance.status, InstanceStatus::Escalated)?;
        let ticket_id = self.escalator.escalate_instance(&instance, reason).await?;
        self.registry.update(instance_id, |instance| {
            instance.status = InstanceStatus::Escalated;
            instance
                .metadata
                .insert(TICKET_KEY.to_string(), ticket_id.clone());
            Ok(())
        })?;
        self.registry.log(
            instance_id,
            LogLevel::Warn,
            format!("escalated: {reason} (ticket {ticket_id})"),
        )?;
        if instance.kind == InstanceKind::Task
            && let Some(task_id) = &instance.task_id
            && self.entities.get_task(task_id)?.status == TaskStatus::InProgress
        {
            self.entities.apply_task_event(task_id, TaskEvent::Escalate)?;
        }
        Ok(ticket_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityRepositories;
    use crate::io::config::{EscalationConfig, RegistryConfig, ValidationConfig};
    use crate::io::prompt::PromptRenderer;
    use crate::io::store::{MemoryRepository, Repository};
    use crate::test_support::{
        FlakyTracker, Harness, PASSING_OUTPUT, ScriptedSession, checkpoint, fast_config, task,
    };

    struct Fixture {
        harness: Harness,
        supervisor: TaskSupervisor,
        entities: Arc<EntityStore>,
        registry: Arc<InstanceRegistry>,
        tracker: Arc<FlakyTracker>,
    }

    fn fixture(sessions: Vec<ScriptedSession>, checkpoints: Vec<Checkpoint>) -> Fixture {
        let harness = Harness::new(sessions);
        let config = fast_config();
        let tasks = Arc::new(MemoryRepository::new());
        let stored = Arc::new(MemoryRepository::new());
        let ids: Vec<&str> = checkpoints.iter().map(|c| c.id.as_str()).collect();
        tasks.put(&task("task-1", &ids)).expect("task");
        for cp in &checkpoints {
            stored.put(cp).expect("checkpoint");
        }
        let events = EventBus::default();
        let prompts = Arc::new(PromptRenderer::new());
        let entities = Arc::new(EntityStore::new(
            EntityRepositories {
                drafts: Arc::new(MemoryRepository::new()),
                tasks,
                checkpoints: stored,
            },
            harness.reasoner.clone(),
            prompts.clone(),
            ValidationConfig::default(),
            config.execution.clone(),
            harness.clock.clone(),
        ));
        let registry = Arc::new(InstanceRegistry::new(
            Arc::new(MemoryRepository::new()),
            RegistryConfig::default(),
            harness.clock.clone(),
            events.clone(),
        ));
        let executor = IsolationExecutor::new(
            registry.clone(),
            harness.worker.clone(),
            prompts,
            None,
            config.execution,
        );
        let tracker = Arc::new(FlakyTracker::new(harness.tracker.clone()));
        let escalator = Arc::new(Escalator::new(
            tracker.clone(),
            EscalationConfig::default(),
            events.clone(),
        ));
        let supervisor = TaskSupervisor::new(
            entities.clone(),
            registry.clone(),
            executor,
            escalator,
            events,
            Duration::ZERO,
        );
        Fixture {
            harness,
            supervisor,
            entities,
            registry,
            tracker,
        }
    }

    fn non_blocking(id: &str) -> Checkpoint {
        Checkpoint {
            blocking: false,
            ..checkpoint(id, "task-1")
        }
    }

    #[tokio::test]
    async fn retries_until_pass_then_completes() {
        let fx = fixture(
            vec![
                ScriptedSession::failing(),
                ScriptedSession::passing(PASSING_OUTPUT),
                ScriptedSession::passing(PASSING_OUTPUT),
            ],
            vec![checkpoint("cp-1", "task-1"), checkpoint("cp-2", "task-1")],
        );
        let run = fx
            .supervisor
            .run_task("task-1", fx.harness.working_dir())
            .await
            .expect("run");
        assert_eq!(run.state, TaskRunState::Completed);
        assert_eq!(run.checkpoint_index, 2);
        let first = fx.entities.get_checkpoint("cp-1").expect("cp-1");
        assert_eq!(first.status, CheckpointStatus::Pass);
        assert_eq!(first.retry_count, 1);
        assert_eq!(
            fx.entities.get_task("task-1").expect("task").status,
            TaskStatus::Completed
        );
        assert_eq!(fx.harness.worker.max_live(), 1);
        assert_eq!(fx.harness.worker.live(), 0);
    }

    #[tokio::test]
    async fn blocking_exhaustion_halts_with_one_ticket() {
        let fx = fixture(
            vec![ScriptedSession::failing(); 3],
            vec![checkpoint("cp-1", "task-1"), checkpoint("cp-2", "task-1")],
        );
        let run = fx
            .supervisor
            .run_task("task-1", fx.harness.working_dir())
            .await
            .expect("run");
        let TaskRunState::Escalated { checkpoint_id, ticket_id } = run.state else {
            panic!("expected escalation, got {:?}", run.state);
        };
        assert_eq!(checkpoint_id, "cp-1");
        let cp = fx.entities.get_checkpoint("cp-1").expect("cp-1");
        assert_eq!(cp.status, CheckpointStatus::FailedMaxRetries);
        assert_eq!(cp.retry_count, 3);
        assert!(cp.needs_escalation);
        assert_eq!(cp.ticket_id, ticket_id);
        assert_eq!(fx.harness.tracker.tickets().len(), 1);
        assert_eq!(
            fx.entities.get_checkpoint("cp-2").expect("cp-2").status,
            CheckpointStatus::Pending
        );
        assert_eq!(
            fx.entities.get_task("task-1").expect("task").status,
            TaskStatus::Escalated
        );
    }

    #[tokio::test]
    async fn failed_escalation_is_retried_on_the_next_drive() {
        let fx = fixture(
            vec![ScriptedSession::failing(); 3],
            vec![checkpoint("cp-1", "task-1")],
        );
        fx.tracker.fail_next_creates(1);
        let instance = fx
            .supervisor
            .start("task-1", fx.harness.working_dir())
            .expect("start");
        assert!(fx.supervisor.drive(&instance.id).await.is_err());
        let cp = fx.entities.get_checkpoint("cp-1").expect("cp-1");
        assert_eq!(cp.status, CheckpointStatus::FailedMaxRetries);
        assert_eq!(cp.ticket_id, None);
        assert!(fx.harness.tracker.tickets().is_empty());

        let run = fx.supervisor.drive(&instance.id).await.expect("drive");
        let TaskRunState::Escalated { ticket_id, .. } = run.state else {
            panic!("expected escalation, got {:?}", run.state);
        };
        assert!(ticket_id.is_some());
        assert_eq!(fx.harness.tracker.tickets().len(), 1);
        assert_eq!(
            fx.entities.get_checkpoint("cp-1").expect("cp-1").ticket_id,
            ticket_id
        );
        assert_eq!(fx.harness.worker.submit_attempts(), 3);
    }

    #[tokio::test]
    async fn non_blocking_exhaustion_continues() {
        let mut sessions = vec![ScriptedSession::failing(); 3];
        sessions.push(ScriptedSession::passing(PASSING_OUTPUT));
        let fx = fixture(sessions, vec![non_blocking("cp-1"), checkpoint("cp-2", "task-1")]);
        let run = fx
            .supervisor
            .run_task("task-1", fx.harness.working_dir())
            .await
            .expect("run");
        assert_eq!(run.state, TaskRunState::Completed);
        assert_eq!(fx.harness.tracker.tickets().len(), 1);
    }

    #[tokio::test]
    async fn paused_run_resumes_from_pointer() {
        let fx = fixture(
            vec![ScriptedSession::passing(PASSING_OUTPUT); 2],
            vec![checkpoint("cp-1", "task-1"), checkpoint("cp-2", "task-1")],
        );
        let instance = fx
            .supervisor
            .start("task-1", fx.harness.working_dir())
            .expect("start");
        fx.supervisor.pause(&instance.id).expect("pause");
        let run = fx.supervisor.drive(&instance.id).await.expect("drive");
        assert_eq!(run.state, TaskRunState::Paused);
        assert_eq!(fx.harness.worker.submit_attempts(), 0);

        fx.supervisor.resume(&instance.id).expect("resume");
        let run = fx.supervisor.drive(&instance.id).await.expect("drive");
        assert_eq!(run.state, TaskRunState::Completed);
    }

    #[tokio::test]
    async fn rollback_resets_previous_and_later_checkpoints() {
        let fx = fixture(
            vec![ScriptedSession::passing(PASSING_OUTPUT); 2],
            vec![checkpoint("cp-1", "task-1"), checkpoint("cp-2", "task-1")],
        );
        let instance = fx
            .supervisor
            .start("task-1", fx.harness.working_dir())
            .expect("start");
        fx.registry
            .update(&instance.id, |i| {
                i.checkpoint_index = 2;
                Ok(())
            })
            .expect("move pointer");
        fx.entities
            .update_checkpoint("cp-2", |cp| {
                cp.status = CheckpointStatus::FailedMaxRetries;
                cp.retry_count = 3;
                cp.needs_escalation = true;
                Ok(())
            })
            .expect("seed");

        let rolled = fx.supervisor.rollback(&instance.id).expect("rollback");
        assert_eq!(rolled.checkpoint_index, 1);
        let cp = fx.entities.get_checkpoint("cp-2").expect("cp-2");
        assert_eq!(cp.status, CheckpointStatus::Pending);
        assert_eq!(cp.retry_count, 0);
        assert!(!cp.needs_escalation);
    }

    #[tokio::test]
    async fn rollback_at_first_checkpoint_is_rejected() {
        let fx = fixture(Vec::new(), vec![checkpoint("cp-1", "task-1")]);
        let instance = fx
            .supervisor
            .start("task-1", fx.harness.working_dir())
            .expect("start");
        assert!(matches!(
            fx.supervisor.rollback(&instance.id),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn second_run_of_live_task_is_rejected() {
        let fx = fixture(Vec::new(), vec![checkpoint("cp-1", "task-1")]);
        fx.supervisor
            .start("task-1", fx.harness.working_dir())
            .expect("start");
        assert!(matches!(
            fx.supervisor.start("task-1", fx.harness.working_dir()),
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unmet_dependency_blocks() {
        let mut second = checkpoint("cp-2", "task-1");
        second.dependencies = vec!["cp-missing".to_string()];
        let fx = fixture(
            vec![ScriptedSession::passing(PASSING_OUTPUT)],
            vec![checkpoint("cp-1", "task-1"), second],
        );
        let run = fx
            .supervisor
            .run_task("task-1", fx.harness.working_dir())
            .await
            .expect("run");
        assert_eq!(
            run.state,
            TaskRunState::Blocked {
                checkpoint_id: "cp-2".to_string(),
                dependency: "cp-missing".to_string(),
            }
        );
        assert_eq!(run.checkpoint_index, 1);
    }

    #[tokio::test]
    async fn manual_escalation_opens_ticket_and_escalates_task() {
        let fx = fixture(Vec::new(), vec![checkpoint("cp-1", "task-1")]);
        let instance = fx
            .supervisor
            .start("task-1", fx.harness.working_dir())
            .expect("start");
        let ticket = fx
            .supervisor
            .escalate_instance(&instance.id, "stuck")
            .await
            .expect("escalate");
        let stored = fx.registry.require(&instance.id).expect("instance");
        assert_eq!(stored.status, InstanceStatus::Escalated);
        assert_eq!(stored.metadata.get("ticket_id"), Some(&ticket));
        assert_eq!(
            fx.entities.get_task("task-1").expect("task").status,
            TaskStatus::Escalated
        );
    }
}

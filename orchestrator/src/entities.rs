//! Entity store: durable drafts, tasks and checkpoints behind explicit
//! state machines.
//!
//! Every mutation is a read-modify-write under one write gate, applied to a
//! copy and persisted before it becomes visible. The gate is never held
//! across an `.await`; breakdown moves the draft into `task_breakdown`
//! first, which keeps a second breakdown of the same draft out.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::clock::Clock;
use crate::core::lifecycle::{
    CheckpointEvent, DraftEvent, EntityEvent, EntityState, TaskEvent, next_checkpoint_status,
    next_draft_state, next_task_status,
};
use crate::core::plan::{materialize, parse_plan};
use crate::core::retry::{RetryVerdict, record_failure};
use crate::core::types::{
    Checkpoint, CheckpointStatus, Draft, DraftState, LogLevel, StateChange, Task, ValidationCheck,
    new_id,
};
use crate::error::{Error, Result};
use crate::io::config::{ExecutionConfig, ValidationConfig};
use crate::io::prompt::PromptRenderer;
use crate::io::reasoner::Reasoner;
use crate::io::store::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSet {
    pub draft_id: String,
    pub passed: bool,
    pub checks: Vec<ValidationCheck>,
}

type ValidationRule = fn(&Draft, &ValidationConfig) -> ValidationCheck;

const VALIDATION_RULES: [ValidationRule; 4] = [
    content_present,
    description_present,
    content_size,
    required_sections,
];

fn check(name: &str, passed: bool, details: impl Into<String>) -> ValidationCheck {
    ValidationCheck {
        name: name.to_string(),
        passed,
        details: details.into(),
    }
}

fn content_present(draft: &Draft, _: &ValidationConfig) -> ValidationCheck {
    let passed = !draft.content.trim().is_empty();
    check("content_present", passed, if passed { "content provided" } else { "content is empty" })
}

fn description_present(draft: &Draft, _: &ValidationConfig) -> ValidationCheck {
    let passed = !draft.description.trim().is_empty();
    check(
        "description_present",
        passed,
        if passed { "description provided" } else { "description is empty" },
    )
}

fn content_size(draft: &Draft, config: &ValidationConfig) -> ValidationCheck {
    let size = draft.content.len();
    check(
        "content_size",
        size <= config.max_content_bytes,
        format!("{size} of {} bytes", config.max_content_bytes),
    )
}

fn required_sections(draft: &Draft, config: &ValidationConfig) -> ValidationCheck {
    let missing: Vec<&str> = config
        .required_sections
        .iter()
        .filter(|section| !draft.content.contains(section.as_str()))
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        check("required_sections", true, "all required sections present")
    } else {
        check(
            "required_sections",
            false,
            format!("missing sections: {}", missing.join(", ")),
        )
    }
}

pub struct EntityRepositories {
    pub drafts: Arc<dyn Repository<Draft>>,
    pub tasks: Arc<dyn Repository<Task>>,
    pub checkpoints: Arc<dyn Repository<Checkpoint>>,
}

pub struct EntityStore {
    drafts: Arc<dyn Repository<Draft>>,
    tasks: Arc<dyn Repository<Task>>,
    checkpoints: Arc<dyn Repository<Checkpoint>>,
    reasoner: Arc<dyn Reasoner>,
    prompts: Arc<PromptRenderer>,
    validation: ValidationConfig,
    execution: ExecutionConfig,
    clock: Arc<dyn Clock>,
    writes: Mutex<()>,
}

impl EntityStore {
    pub fn new(
        repos: EntityRepositories,
        reasoner: Arc<dyn Reasoner>,
        prompts: Arc<PromptRenderer>,
        validation: ValidationConfig,
        execution: ExecutionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            drafts: repos.drafts,
            tasks: repos.tasks,
            checkpoints: repos.checkpoints,
            reasoner,
            prompts,
            validation,
            execution,
            clock,
            writes: Mutex::new(()),
        }
    }

    fn gate(&self) -> std::sync::MutexGuard<'_, ()> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(skip_all)]
    pub fn create_draft(&self, content: &str, description: &str) -> Result<Draft> {
        if content.trim().is_empty() {
            return Err(Error::validation("draft content must not be empty"));
        }
        let now = self.clock.now();
        let draft = Draft {
            id: new_id("draft"),
            content: content.to_string(),
            description: description.trim().to_string(),
            state: DraftState::Created,
            validations: Vec::new(),
            task_id: None,
            merged_by: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        };
        self.drafts.put(&draft)?;
        info!(draft_id = %draft.id, "draft created");
        Ok(draft)
    }

    pub fn get_draft(&self, id: &str) -> Result<Draft> {
        self.drafts.get(id).ok_or_else(|| Error::not_found("draft", id))
    }

    /// Drafts in `state` (or all), newest first.
    pub fn list_drafts(&self, state: Option<DraftState>) -> Vec<Draft> {
        let mut drafts: Vec<Draft> = self
            .drafts
            .list()
            .into_iter()
            .filter(|d| state.is_none_or(|s| d.state == s))
            .collect();
        drafts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        drafts
    }

    pub fn draft_history(&self, id: &str) -> Result<Vec<StateChange>> {
        Ok(self.get_draft(id)?.history)
    }

    fn update_draft_with<R>(&self, id: &str, f: impl FnOnce(&mut Draft) -> Result<R>) -> Result<R> {
        let _gate = self.gate();
        let mut draft = self.get_draft(id)?;
        let result = f(&mut draft)?;
        draft.updated_at = self.clock.now();
        self.drafts.put(&draft)?;
        Ok(result)
    }

    fn transition(&self, draft: &mut Draft, event: DraftEvent) -> Result<DraftState> {
        let next = next_draft_state(draft.state, event)?;
        draft.history.push(StateChange {
            from: draft.state.as_str().to_string(),
            to: next.as_str().to_string(),
            event: event.as_str().to_string(),
            at: self.clock.now(),
        });
        draft.state = next;
        Ok(next)
    }

    /// Replace the content of a draft that has not been validated yet. A
    /// failed draft is revised back to `created`.
    pub fn update_draft(&self, id: &str, content: &str) -> Result<Draft> {
        if content.trim().is_empty() {
            return Err(Error::validation("draft content must not be empty"));
        }
        self.update_draft_with(id, |draft| {
            match draft.state {
                DraftState::Created => {}
                DraftState::Failed => {
                    self.transition(draft, DraftEvent::Revise)?;
                }
                other => {
                    return Err(Error::validation(format!(
                        "draft '{}' cannot be edited in state '{}'",
                        draft.id,
                        other.as_str()
                    )));
                }
            }
            draft.content = content.to_string();
            draft.validations.clear();
            Ok(draft.clone())
        })
    }

    #[instrument(skip_all, fields(draft_id = %id))]
    pub fn validate(&self, id: &str) -> Result<ValidationSet> {
        self.update_draft_with(id, |draft| {
            self.transition(draft, DraftEvent::StartValidation)?;
            let checks: Vec<ValidationCheck> = VALIDATION_RULES
                .iter()
                .map(|rule| rule(draft, &self.validation))
                .collect();
            let passed = checks.iter().all(|c| c.passed);
            let event = if passed {
                DraftEvent::ValidationPassed
            } else {
                DraftEvent::ValidationFailed
            };
            self.transition(draft, event)?;
            draft.validations = checks.clone();
            info!(passed, "draft validated");
            Ok(ValidationSet {
                draft_id: draft.id.clone(),
                passed,
                checks,
            })
        })
    }

    /// Ask the reasoning collaborator for a task plan and persist it.
    ///
    /// A rejected plan (or a collaborator failure) returns the draft to
    /// `validated` and is reported as the error.
    #[instrument(skip_all, fields(draft_id = %id))]
    pub async fn breakdown(&self, id: &str) -> Result<Task> {
        let draft = self.update_draft_with(id, |draft| {
            self.transition(draft, DraftEvent::StartBreakdown)?;
            Ok(draft.clone())
        })?;

        match self.plan_task(&draft).await {
            Ok((task, checkpoints)) => {
                {
                    let _gate = self.gate();
                    for checkpoint in &checkpoints {
                        self.checkpoints.put(checkpoint)?;
                    }
                    self.tasks.put(&task)?;
                }
                self.update_draft_with(id, |draft| {
                    self.transition(draft, DraftEvent::BreakdownComplete)?;
                    draft.task_id = Some(task.id.clone());
                    Ok(())
                })?;
                info!(task_id = %task.id, checkpoints = checkpoints.len(), "draft broken down");
                Ok(task)
            }
            Err(err) => {
                warn!(error = %err, "breakdown rejected");
                self.update_draft_with(id, |draft| {
                    self.transition(draft, DraftEvent::BreakdownFailed)?;
                    Ok(())
                })?;
                Err(err)
            }
        }
    }

    async fn plan_task(&self, draft: &Draft) -> Result<(Task, Vec<Checkpoint>)> {
        let prompt = self
            .prompts
            .render_breakdown(draft)
            .map_err(|err| Error::from(err.context("render breakdown prompt")))?;
        let raw = self.reasoner.decompose(&prompt).await?;
        let plan = parse_plan(&raw)?;
        materialize(
            plan,
            &draft.id,
            self.execution.default_max_retries,
            self.clock.now(),
        )
    }

    /// `execution_complete`, guarded on every checkpoint having passed.
    pub fn complete_execution(&self, id: &str) -> Result<Draft> {
        let draft = self.get_draft(id)?;
        let task_id = draft
            .task_id
            .as_deref()
            .ok_or_else(|| Error::validation(format!("draft '{id}' has no task")))?;
        let checkpoints = self.task_checkpoints(task_id)?;
        if let Some(open) = checkpoints
            .iter()
            .find(|c| c.status != CheckpointStatus::Pass)
        {
            return Err(Error::validation(format!(
                "checkpoint '{}' is '{}', every checkpoint must pass first",
                open.id,
                open.status.as_str()
            )));
        }
        self.update_draft_with(id, |draft| {
            self.transition(draft, DraftEvent::ExecutionComplete)?;
            Ok(draft.clone())
        })
    }

    /// Merge a `ready_for_merge` draft, recording who approved it.
    pub fn merge(&self, id: &str, approver: &str) -> Result<Draft> {
        let approver = approver.trim();
        if approver.is_empty() {
            return Err(Error::validation("merge requires an approver"));
        }
        self.update_draft_with(id, |draft| {
            self.transition(draft, DraftEvent::Merge)?;
            draft.merged_by = Some(approver.to_string());
            info!(draft_id = %draft.id, approver, "draft merged");
            Ok(draft.clone())
        })
    }

    /// Apply `event` to whichever entity `entity_id` names.
    pub fn advance(&self, entity_id: &str, event: EntityEvent) -> Result<EntityState> {
        match event {
            EntityEvent::Draft(DraftEvent::ExecutionComplete) => {
                Ok(EntityState::Draft(self.complete_execution(entity_id)?.state))
            }
            EntityEvent::Draft(DraftEvent::Merge) => Err(Error::validation(
                "merge needs an approver; use the merge operation",
            )),
            EntityEvent::Draft(event) => self.update_draft_with(entity_id, |draft| {
                Ok(EntityState::Draft(self.transition(draft, event)?))
            }),
            EntityEvent::Task(event) => Ok(EntityState::Task(
                self.apply_task_event(entity_id, event)?.status,
            )),
            EntityEvent::Checkpoint(CheckpointEvent::Fail) => Ok(EntityState::Checkpoint(
                self.record_checkpoint_failure(entity_id)?.1.status,
            )),
            EntityEvent::Checkpoint(event) => Ok(EntityState::Checkpoint(
                self.apply_checkpoint_event(entity_id, event)?.status,
            )),
        }
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks.get(id).ok_or_else(|| Error::not_found("task", id))
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.tasks.list()
    }

    /// Checkpoints of a task in plan order.
    pub fn task_checkpoints(&self, task_id: &str) -> Result<Vec<Checkpoint>> {
        let task = self.get_task(task_id)?;
        task.checkpoints
            .iter()
            .map(|id| self.get_checkpoint(id))
            .collect()
    }

    pub fn apply_task_event(&self, id: &str, event: TaskEvent) -> Result<Task> {
        let _gate = self.gate();
        let mut task = self.get_task(id)?;
        task.status = next_task_status(task.status, event)?;
        task.updated_at = self.clock.now();
        self.tasks.put(&task)?;
        info!(task_id = %id, status = task.status.as_str(), "task status changed");
        Ok(task)
    }

    pub fn get_checkpoint(&self, id: &str) -> Result<Checkpoint> {
        self.checkpoints
            .get(id)
            .ok_or_else(|| Error::not_found("checkpoint", id))
    }

    /// Read-modify-write of one checkpoint.
    pub fn update_checkpoint<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Checkpoint) -> Result<R>,
    ) -> Result<R> {
        let _gate = self.gate();
        let mut checkpoint = self.get_checkpoint(id)?;
        let result = f(&mut checkpoint)?;
        checkpoint.updated_at = self.clock.now();
        self.checkpoints.put(&checkpoint)?;
        Ok(result)
    }

    /// Apply a lifecycle event to a checkpoint.
    ///
    /// Failure events (`fail`, `schedule_retry`, `exhaust`) are refused here:
    /// they carry retry accounting and go through
    /// [`EntityStore::record_checkpoint_failure`].
    pub fn apply_checkpoint_event(&self, id: &str, event: CheckpointEvent) -> Result<Checkpoint> {
        if matches!(
            event,
            CheckpointEvent::Fail | CheckpointEvent::ScheduleRetry | CheckpointEvent::Exhaust
        ) {
            return Err(Error::validation(format!(
                "checkpoint event '{}' is applied by failure accounting only",
                event.as_str()
            )));
        }
        let now = self.clock.now();
        let limit = self.execution.checkpoint_log_limit;
        self.update_checkpoint(id, |checkpoint| {
            let from = checkpoint.status;
            checkpoint.status = next_checkpoint_status(from, event)?;
            checkpoint.log(
                now,
                LogLevel::Info,
                format!("{} -> {} ({})", from.as_str(), checkpoint.status.as_str(), event.as_str()),
                limit,
            );
            Ok(checkpoint.clone())
        })
    }

    /// Count one failed attempt: `retry_pending` while retries remain,
    /// `failed_max_retries` (flagged for escalation) once they run out.
    pub fn record_checkpoint_failure(&self, id: &str) -> Result<(RetryVerdict, Checkpoint)> {
        let now = self.clock.now();
        let limit = self.execution.checkpoint_log_limit;
        self.update_checkpoint(id, |checkpoint| {
            let from = checkpoint.status;
            let verdict = record_failure(checkpoint)?;
            checkpoint.log(
                now,
                LogLevel::Info,
                format!(
                    "{} -> {} (fail, {} of {})",
                    from.as_str(),
                    checkpoint.status.as_str(),
                    checkpoint.retry_count,
                    checkpoint.max_retries
                ),
                limit,
            );
            Ok((verdict, checkpoint.clone()))
        })
    }

    /// Append a line to a checkpoint's bounded log.
    pub fn log_checkpoint(&self, id: &str, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let now = self.clock.now();
        let limit = self.execution.checkpoint_log_limit;
        let message = message.into();
        self.update_checkpoint(id, |checkpoint| {
            checkpoint.log(now, level, message, limit);
            Ok(())
        })
    }
}

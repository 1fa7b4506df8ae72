//! State machines for drafts, tasks and checkpoints.
//!
//! Each `next_*` function is total over (state, event): defined pairs return
//! the next state, everything else is an [`Error::InvalidTransition`].
//! Guards that need data beyond the state (e.g. "every checkpoint passed")
//! are enforced by the entity store before the event is applied.

use serde::{Deserialize, Serialize};

use crate::core::types::{CheckpointStatus, DraftState, InstanceStatus, TaskStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftEvent {
    StartValidation,
    ValidationPassed,
    ValidationFailed,
    Revise,
    StartBreakdown,
    BreakdownComplete,
    BreakdownFailed,
    ExecutionComplete,
    Reopen,
    Merge,
}

impl DraftEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartValidation => "start_validation",
            Self::ValidationPassed => "validation_passed",
            Self::ValidationFailed => "validation_failed",
            Self::Revise => "revise",
            Self::StartBreakdown => "start_breakdown",
            Self::BreakdownComplete => "breakdown_complete",
            Self::BreakdownFailed => "breakdown_failed",
            Self::ExecutionComplete => "execution_complete",
            Self::Reopen => "reopen",
            Self::Merge => "merge",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Start,
    Complete,
    Fail,
    Escalate,
    Reopen,
}

impl TaskEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Complete => "complete",
            Self::Fail => "fail",
            Self::Escalate => "escalate",
            Self::Reopen => "reopen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointEvent {
    Start,
    Pass,
    Fail,
    ScheduleRetry,
    Exhaust,
    Escalate,
    Reset,
}

impl CheckpointEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::ScheduleRetry => "schedule_retry",
            Self::Exhaust => "exhaust",
            Self::Escalate => "escalate",
            Self::Reset => "reset",
        }
    }
}

/// Event addressed to any entity kind, as accepted by `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "event", rename_all = "snake_case")]
pub enum EntityEvent {
    Draft(DraftEvent),
    Task(TaskEvent),
    Checkpoint(CheckpointEvent),
}

/// State reached after `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "state", rename_all = "snake_case")]
pub enum EntityState {
    Draft(DraftState),
    Task(TaskStatus),
    Checkpoint(CheckpointStatus),
}

fn invalid(entity: &str, state: &str, event: &str) -> Error {
    Error::InvalidTransition {
        entity: entity.to_string(),
        state: state.to_string(),
        event: event.to_string(),
    }
}

pub fn next_draft_state(current: DraftState, event: DraftEvent) -> Result<DraftState> {
    use DraftEvent as E;
    use DraftState as S;

    let next = match (current, event) {
        (S::Created, E::StartValidation) => S::Validating,
        (S::Validating, E::ValidationPassed) => S::Validated,
        (S::Validating, E::ValidationFailed) => S::Failed,
        (S::Failed, E::Revise) => S::Created,
        (S::Validated, E::StartBreakdown) => S::TaskBreakdown,
        (S::TaskBreakdown, E::BreakdownComplete) => S::InExecution,
        (S::TaskBreakdown, E::BreakdownFailed) => S::Validated,
        (S::InExecution, E::ExecutionComplete) => S::ReadyForMerge,
        (S::ReadyForMerge, E::Reopen) => S::InExecution,
        (S::ReadyForMerge, E::Merge) => S::Merged,
        _ => return Err(invalid("draft", current.as_str(), event.as_str())),
    };
    Ok(next)
}

pub fn next_task_status(current: TaskStatus, event: TaskEvent) -> Result<TaskStatus> {
    use TaskEvent as E;
    use TaskStatus as S;

    let next = match (current, event) {
        (S::Pending, E::Start) => S::InProgress,
        (S::InProgress, E::Complete) => S::Completed,
        (S::InProgress, E::Fail) => S::Failed,
        (S::InProgress, E::Escalate) => S::Escalated,
        (S::Completed | S::Failed | S::Escalated, E::Reopen) => S::InProgress,
        _ => return Err(invalid("task", current.as_str(), event.as_str())),
    };
    Ok(next)
}

pub fn next_checkpoint_status(
    current: CheckpointStatus,
    event: CheckpointEvent,
) -> Result<CheckpointStatus> {
    use CheckpointEvent as E;
    use CheckpointStatus as S;

    let next = match (current, event) {
        (S::Pending | S::RetryPending, E::Start) => S::InProgress,
        (S::InProgress, E::Pass) => S::Pass,
        (S::InProgress, E::Fail) => S::Fail,
        (S::Fail, E::ScheduleRetry) => S::RetryPending,
        (S::Fail, E::Exhaust) => S::FailedMaxRetries,
        (S::Fail | S::FailedMaxRetries, E::Escalate) => S::Escalated,
        (
            S::InProgress | S::Pass | S::Fail | S::RetryPending | S::FailedMaxRetries | S::Escalated,
            E::Reset,
        ) => S::Pending,
        _ => return Err(invalid("checkpoint", current.as_str(), event.as_str())),
    };
    Ok(next)
}

/// Instance status changes. Completed and errored are final; escalated
/// instances may be re-activated once a human has intervened.
pub fn check_instance_status(current: InstanceStatus, next: InstanceStatus) -> Result<()> {
    use InstanceStatus as S;

    let allowed = match (current, next) {
        (a, b) if a == b => true,
        (S::Active, S::Paused | S::Errored | S::Completed | S::Escalated) => true,
        (S::Paused, S::Active | S::Errored | S::Completed | S::Escalated) => true,
        (S::Escalated, S::Active | S::Completed | S::Errored) => true,
        _ => false,
    };
    if allowed {
        return Ok(());
    }
    Err(invalid("instance", current.as_str(), next.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_instances_stay_finished() {
        assert!(check_instance_status(InstanceStatus::Completed, InstanceStatus::Active).is_err());
        assert!(check_instance_status(InstanceStatus::Errored, InstanceStatus::Paused).is_err());
        assert!(check_instance_status(InstanceStatus::Paused, InstanceStatus::Active).is_ok());
        assert!(check_instance_status(InstanceStatus::Active, InstanceStatus::Active).is_ok());
    }

    #[test]
    fn draft_happy_path_reaches_merged() {
        let mut state = DraftState::Created;
        for event in [
            DraftEvent::StartValidation,
            DraftEvent::ValidationPassed,
            DraftEvent::StartBreakdown,
            DraftEvent::BreakdownComplete,
            DraftEvent::ExecutionComplete,
            DraftEvent::Merge,
        ] {
            state = next_draft_state(state, event).expect("transition");
        }
        assert_eq!(state, DraftState::Merged);
    }

    #[test]
    fn undefined_draft_transition_is_rejected() {
        let err = next_draft_state(DraftState::Created, DraftEvent::Merge).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(err.to_string().contains("created"));
        assert!(err.to_string().contains("merge"));
    }

    #[test]
    fn merged_draft_accepts_no_events() {
        for event in [
            DraftEvent::StartValidation,
            DraftEvent::Revise,
            DraftEvent::Reopen,
            DraftEvent::Merge,
        ] {
            assert!(next_draft_state(DraftState::Merged, event).is_err());
        }
    }

    #[test]
    fn checkpoint_cannot_pass_without_starting() {
        assert!(next_checkpoint_status(CheckpointStatus::Pending, CheckpointEvent::Pass).is_err());
        assert!(
            next_checkpoint_status(CheckpointStatus::RetryPending, CheckpointEvent::Fail).is_err()
        );
    }

    #[test]
    fn checkpoint_retry_cycle() {
        let status = next_checkpoint_status(CheckpointStatus::Pending, CheckpointEvent::Start)
            .expect("start");
        let status = next_checkpoint_status(status, CheckpointEvent::Fail).expect("fail");
        let status =
            next_checkpoint_status(status, CheckpointEvent::ScheduleRetry).expect("retry");
        assert_eq!(status, CheckpointStatus::RetryPending);
        let status = next_checkpoint_status(status, CheckpointEvent::Start).expect("restart");
        assert_eq!(status, CheckpointStatus::InProgress);
    }

    #[test]
    fn pending_checkpoint_cannot_be_reset() {
        assert!(next_checkpoint_status(CheckpointStatus::Pending, CheckpointEvent::Reset).is_err());
    }

    #[test]
    fn task_reopens_after_escalation() {
        let status =
            next_task_status(TaskStatus::Escalated, TaskEvent::Reopen).expect("reopen");
        assert_eq!(status, TaskStatus::InProgress);
        assert!(next_task_status(TaskStatus::Pending, TaskEvent::Complete).is_err());
    }
}

//! Structural invariants for a task and its checkpoints.
//!
//! Returns a list of human-readable violations; empty means valid.

use std::collections::HashSet;

use crate::core::types::{Checkpoint, CheckpointStatus, Task};

pub fn validate_task(task: &Task, checkpoints: &[Checkpoint]) -> Vec<String> {
    let mut errors = Vec::new();

    if task.checkpoints.is_empty() {
        errors.push(format!("task '{}' has no checkpoints", task.id));
    }

    let mut seen = HashSet::new();
    for id in &task.checkpoints {
        if !seen.insert(id.as_str()) {
            errors.push(format!("task '{}' lists checkpoint '{}' twice", task.id, id));
        }
        if !checkpoints.iter().any(|c| &c.id == id) {
            errors.push(format!("task '{}' references missing checkpoint '{}'", task.id, id));
        }
    }

    for (position, checkpoint) in checkpoints.iter().enumerate() {
        errors.extend(validate_checkpoint(checkpoint));
        if checkpoint.task_id != task.id {
            errors.push(format!(
                "checkpoint '{}' belongs to task '{}', not '{}'",
                checkpoint.id, checkpoint.task_id, task.id
            ));
        }
        for dep in &checkpoint.dependencies {
            if dep == &checkpoint.id {
                errors.push(format!("checkpoint '{}' depends on itself", checkpoint.id));
                continue;
            }
            let earlier = checkpoints[..position].iter().any(|c| &c.id == dep);
            if !earlier {
                errors.push(format!(
                    "checkpoint '{}' depends on '{}', which does not precede it",
                    checkpoint.id, dep
                ));
            }
        }
    }

    errors
}

pub fn validate_checkpoint(checkpoint: &Checkpoint) -> Vec<String> {
    let mut errors = Vec::new();
    if checkpoint.max_retries == 0 {
        errors.push(format!("checkpoint '{}' has max_retries=0", checkpoint.id));
    }
    if checkpoint.retry_count > checkpoint.max_retries {
        errors.push(format!(
            "checkpoint '{}' retry_count {} exceeds max_retries {}",
            checkpoint.id, checkpoint.retry_count, checkpoint.max_retries
        ));
    }
    if checkpoint.status == CheckpointStatus::FailedMaxRetries
        && checkpoint.retry_count != checkpoint.max_retries
    {
        errors.push(format!(
            "checkpoint '{}' is failed_max_retries with retry_count {} of {}",
            checkpoint.id, checkpoint.retry_count, checkpoint.max_retries
        ));
    }
    if checkpoint.pass_criteria.is_empty() {
        errors.push(format!("checkpoint '{}' has no pass criteria", checkpoint.id));
    }
    errors
}

//! Checkpoint ordering helpers.

use crate::core::types::{Checkpoint, CheckpointStatus};

/// Why the checkpoint at the pointer cannot start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocked {
    /// A dependency has not passed yet.
    Dependency { checkpoint: String, dependency: String },
    /// The dependency itself is unknown to the task.
    MissingDependency { checkpoint: String, dependency: String },
}

/// Check that every dependency of `checkpoint` has passed.
pub fn dependencies_satisfied(checkpoint: &Checkpoint, all: &[Checkpoint]) -> Result<(), Blocked> {
    for dep in &checkpoint.dependencies {
        match all.iter().find(|c| &c.id == dep) {
            None => {
                return Err(Blocked::MissingDependency {
                    checkpoint: checkpoint.id.clone(),
                    dependency: dep.clone(),
                });
            }
            Some(found) if found.status != CheckpointStatus::Pass => {
                return Err(Blocked::Dependency {
                    checkpoint: checkpoint.id.clone(),
                    dependency: dep.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// A task completes when every blocking checkpoint has passed.
pub fn blocking_all_passed(checkpoints: &[Checkpoint]) -> bool {
    checkpoints
        .iter()
        .filter(|c| c.blocking)
        .all(|c| c.status == CheckpointStatus::Pass)
}

/// Progress summary: (passed, total).
pub fn progress(checkpoints: &[Checkpoint]) -> (usize, usize) {
    let passed = checkpoints
        .iter()
        .filter(|c| c.status == CheckpointStatus::Pass)
        .count();
    (passed, checkpoints.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::checkpoint;

    #[test]
    fn unmet_dependency_blocks() {
        let a = checkpoint("cp-a", "t");
        let mut b = checkpoint("cp-b", "t");
        b.dependencies = vec!["cp-a".to_string()];
        let all = vec![a.clone(), b.clone()];
        assert!(matches!(
            dependencies_satisfied(&b, &all),
            Err(Blocked::Dependency { .. })
        ));

        let mut passed = a;
        passed.status = CheckpointStatus::Pass;
        assert!(dependencies_satisfied(&b, &[passed, b.clone()]).is_ok());
    }

    #[test]
    fn unknown_dependency_is_reported() {
        let mut b = checkpoint("cp-b", "t");
        b.dependencies = vec!["cp-zzz".to_string()];
        assert!(matches!(
            dependencies_satisfied(&b, std::slice::from_ref(&b)),
            Err(Blocked::MissingDependency { .. })
        ));
    }

    #[test]
    fn non_blocking_failures_do_not_block_completion() {
        let mut a = checkpoint("cp-a", "t");
        a.status = CheckpointStatus::Pass;
        let mut b = checkpoint("cp-b", "t");
        b.blocking = false;
        b.status = CheckpointStatus::Escalated;
        assert!(blocking_all_passed(&[a.clone(), b]));
        assert_eq!(progress(&[a]), (1, 1));
    }
}

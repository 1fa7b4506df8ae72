//! Decision loop detection.

use crate::core::types::DecisionAction;

/// True when the last two actions repeat the two before them (`A,B,A,B`).
pub fn has_repeating_pattern(actions: &[DecisionAction]) -> bool {
    let n = actions.len();
    if n < 4 {
        return false;
    }
    actions[n - 2..] == actions[n - 4..n - 2]
}

/// Whether appending `next` would continue the detected cycle.
///
/// With history `.., A, B, A, B` the cycle continues with `A`.
pub fn continues_cycle(actions: &[DecisionAction], next: DecisionAction) -> bool {
    let n = actions.len();
    n >= 2 && actions[n - 2] == next
}

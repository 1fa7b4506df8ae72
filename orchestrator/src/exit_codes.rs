//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; a task run completed.
pub const OK: i32 = 0;
/// Invalid config, state or arguments, or any other error.
pub const INVALID: i32 = 1;
/// A task run halted on a blocking checkpoint that was escalated.
pub const ESCALATED: i32 = 2;
/// A task run stopped on an unmet checkpoint dependency.
pub const BLOCKED: i32 = 3;
/// A task run was paused before it finished.
pub const PAUSED: i32 = 4;

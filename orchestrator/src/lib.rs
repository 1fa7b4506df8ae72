//! Checkpoint orchestrator for AI worker sessions.
//!
//! Drafts are validated and broken down into tasks of ordered checkpoints.
//! Each checkpoint attempt runs in a fresh, isolated worker session and is
//! verified against its pass criteria; failures retry up to a limit and then
//! escalate to human review. A decision engine supervises free-running
//! worker sessions on a polling tick. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (lifecycles, retry policy,
//!   verification scoring, decision parsing). No I/O.
//! - **[`io`]**: Side-effecting operations (persistence, config, HTTP
//!   collaborators, prompt rendering, attempt journal).
//!
//! Component modules ([`entities`], [`registry`], [`isolation`],
//! [`supervisor`], [`scheduler`]) combine the two; [`app`] wires them.

pub mod app;
pub mod background;
pub mod clock;
pub mod core;
pub mod entities;
pub mod error;
pub mod escalation;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod isolation;
pub mod logging;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verifier;

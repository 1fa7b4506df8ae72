//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! records and return deterministic outputs suitable for tests.

pub mod context;
pub mod decision;
pub mod invariants;
pub mod lifecycle;
pub mod patterns;
pub mod plan;
pub mod report;
pub mod retry;
pub mod sanitize;
pub mod selector;
pub mod types;
pub mod verify;

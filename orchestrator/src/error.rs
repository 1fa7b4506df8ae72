//! Error taxonomy shared by every orchestration component.
//!
//! I/O helpers return `anyhow::Result` with context, the way the rest of the
//! crate's `io` modules do. Anything that escapes to a caller is converted
//! into [`Error`]; unexpected failures become [`Error::Internal`], which is
//! logged once with a generated correlation id and carries no detail in its
//! display form.

use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller input was rejected. Not retryable.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No transition is defined for this (state, event) pair.
    #[error("invalid transition: {entity} cannot apply '{event}' in state '{state}'")]
    InvalidTransition {
        entity: String,
        state: String,
        event: String,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// Registration refused because the registry is full.
    #[error("capacity exceeded: {limit} instances already registered")]
    CapacityExceeded { limit: usize },

    /// Worker call failed in a way that may succeed when retried.
    #[error("transient worker error: {0}")]
    TransientWorker(String),

    #[error("worker error: {0}")]
    Worker(String),

    /// Status polling exhausted its attempt budget.
    #[error("timed out after {attempts} status polls")]
    Timeout { attempts: u32 },

    /// Reasoning output that could not be mapped to an allowed action.
    #[error("malformed decision: {0}")]
    MalformedDecision(String),

    /// A task plan returned by the reasoning collaborator was rejected.
    #[error("task plan rejected: {0}")]
    Plan(String),

    #[error("internal failure (correlation id {correlation_id})")]
    Internal {
        correlation_id: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether retrying the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientWorker(_))
    }

    /// Stable short name used in logs and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::NotFound { .. } => "not_found",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::TransientWorker(_) => "transient_worker",
            Self::Worker(_) => "worker",
            Self::Timeout { .. } => "timeout",
            Self::MalformedDecision(_) => "malformed_decision",
            Self::Plan(_) => "plan",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Internal { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(source: anyhow::Error) -> Self {
        let correlation_id = Uuid::new_v4().to_string();
        error!(%correlation_id, error = format!("{source:#}"), "internal failure");
        Self::Internal {
            correlation_id,
            source,
        }
    }
}

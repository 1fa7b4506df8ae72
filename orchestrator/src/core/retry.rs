//! Retry bookkeeping, backoff schedule and circuit breaker.

use std::time::{Duration, Instant};

use crate::core::lifecycle::{CheckpointEvent, next_checkpoint_status};
use crate::core::types::Checkpoint;
use crate::error::Result;

/// What the policy decided after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Another isolated attempt should be scheduled.
    Retry { failures: u32, remaining: u32 },
    /// `retry_count` reached `max_retries`; escalate.
    Exhausted { failures: u32 },
}

/// Record a failed attempt on an `in_progress` checkpoint.
///
/// Moves the checkpoint through `fail` to either `retry_pending` or
/// `failed_max_retries`. `retry_count` never exceeds `max_retries`.
pub fn record_failure(checkpoint: &mut Checkpoint) -> Result<RetryVerdict> {
    let failed = next_checkpoint_status(checkpoint.status, CheckpointEvent::Fail)?;
    checkpoint.status = failed;
    checkpoint.retry_count = (checkpoint.retry_count + 1).min(checkpoint.max_retries);

    if checkpoint.retry_count < checkpoint.max_retries {
        checkpoint.status = next_checkpoint_status(failed, CheckpointEvent::ScheduleRetry)?;
        return Ok(RetryVerdict::Retry {
            failures: checkpoint.retry_count,
            remaining: checkpoint.max_retries - checkpoint.retry_count,
        });
    }

    checkpoint.status = next_checkpoint_status(failed, CheckpointEvent::Exhaust)?;
    checkpoint.needs_escalation = true;
    Ok(RetryVerdict::Exhausted {
        failures: checkpoint.retry_count,
    })
}

/// Exponential backoff: `initial * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure circuit breaker.
///
/// Opens after `threshold` consecutive failures and rejects calls until
/// `cool_down` elapses; the next call is then a half-open probe whose
/// outcome closes or re-opens the circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cool_down: Duration,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cool_down: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cool_down,
            failures: 0,
            opened_at: None,
        }
    }

    pub fn state(&self, now: Instant) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(opened) if now.duration_since(opened) >= self.cool_down => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    pub fn allows(&self, now: Instant) -> bool {
        self.state(now) != BreakerState::Open
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failures += 1;
        if self.failures >= self.threshold || self.opened_at.is_some() {
            self.opened_at = Some(now);
        }
    }
}

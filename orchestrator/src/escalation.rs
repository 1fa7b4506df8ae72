//! Routing exhausted failures to human review.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::core::types::{Checkpoint, Instance, LogEntry};
use crate::error::Result;
use crate::events::{EventBus, OrchestratorEvent};
use crate::io::config::EscalationConfig;
use crate::io::tracker::{IssuePatch, IssueTracker, NewIssue};

/// Instance metadata key holding the instance's review ticket.
pub const TICKET_KEY: &str = "ticket_id";

pub struct Escalator {
    tracker: Arc<dyn IssueTracker>,
    config: EscalationConfig,
    events: EventBus,
}

impl Escalator {
    pub fn new(tracker: Arc<dyn IssueTracker>, config: EscalationConfig, events: EventBus) -> Self {
        Self {
            tracker,
            config,
            events,
        }
    }

    /// Open (or, when one exists, update) the review ticket for a
    /// checkpoint. Returns the ticket id.
    #[instrument(skip_all, fields(checkpoint_id = %checkpoint.id))]
    pub async fn escalate_checkpoint(&self, checkpoint: &Checkpoint, reason: &str) -> Result<String> {
        let body = checkpoint_body(checkpoint, reason, self.config.log_tail_lines);
        let ticket_id = self
            .file_ticket(
                checkpoint.ticket_id.as_deref(),
                format!("Checkpoint {} needs human review", checkpoint.id),
                body,
            )
            .await?;
        info!(%ticket_id, failures = checkpoint.retry_count, "checkpoint escalated");
        self.events.emit(OrchestratorEvent::Escalated {
            subject_id: checkpoint.id.clone(),
            ticket_id: ticket_id.clone(),
        });
        Ok(ticket_id)
    }

    /// Escalate an instance. An instance that already carries a ticket in
    /// its `ticket_id` metadata gets a comment on that ticket.
    #[instrument(skip_all, fields(instance_id = %instance.id))]
    pub async fn escalate_instance(&self, instance: &Instance, reason: &str) -> Result<String> {
        let mut body = String::new();
        let _ = writeln!(body, "Instance: {}", instance.id);
        let _ = writeln!(body, "Kind: {:?}", instance.kind);
        let _ = writeln!(body, "Status: {}", instance.status.as_str());
        let _ = writeln!(body, "Decisions: {}", instance.decision_count);
        if let Some(checkpoint_id) = &instance.checkpoint_id {
            let _ = writeln!(body, "Checkpoint: {checkpoint_id}");
        }
        let recent = instance
            .recent_actions()
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        if !recent.is_empty() {
            let _ = writeln!(body, "Recent actions: {recent}");
        }
        let _ = writeln!(body, "Reason: {reason}");
        let start = instance.log.len().saturating_sub(self.config.log_tail_lines);
        append_log_tail(&mut body, &instance.log[start..]);

        let ticket_id = self
            .file_ticket(
                instance.metadata.get(TICKET_KEY).map(String::as_str),
                format!("Instance {} escalated", instance.id),
                body,
            )
            .await?;
        info!(%ticket_id, "instance escalated");
        self.events.emit(OrchestratorEvent::Escalated {
            subject_id: instance.id.clone(),
            ticket_id: ticket_id.clone(),
        });
        Ok(ticket_id)
    }

    async fn file_ticket(&self, existing: Option<&str>, title: String, body: String) -> Result<String> {
        let labels = self.config.labels.clone();
        match existing {
            Some(existing) => {
                self.tracker
                    .update_issue(
                        existing,
                        IssuePatch {
                            comment: Some(body),
                            add_labels: labels,
                            close: false,
                        },
                    )
                    .await?;
                Ok(existing.to_string())
            }
            None => {
                self.tracker
                    .create_issue(NewIssue {
                        title,
                        body,
                        labels,
                    })
                    .await
            }
        }
    }
}

fn checkpoint_body(checkpoint: &Checkpoint, reason: &str, tail: usize) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "Checkpoint: {} ({})", checkpoint.id, checkpoint.name);
    let _ = writeln!(body, "Task: {}", checkpoint.task_id);
    let _ = writeln!(
        body,
        "Failures: {} of {} allowed attempts",
        checkpoint.retry_count, checkpoint.max_retries
    );
    let _ = writeln!(body, "Blocking: {}", checkpoint.blocking);
    let _ = writeln!(body, "Reason: {reason}");
    append_log_tail(&mut body, checkpoint.recent_logs(tail));
    body
}

fn append_log_tail(body: &mut String, entries: &[LogEntry]) {
    if entries.is_empty() {
        return;
    }
    let _ = writeln!(body, "\nRecent log:");
    for entry in entries {
        let _ = writeln!(body, "{entry}");
    }
}

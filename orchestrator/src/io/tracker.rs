//! Human-review queue.
//!
//! [`FileIssueTracker`] keeps tickets as JSON documents in the state
//! directory so every escalation leaves an inspectable trail even without an
//! external tracker.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::core::types::{Timestamp, new_id};
use crate::error::{Error, Result};
use crate::io::store::{Document, JsonRepository, MemoryRepository, Repository};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuePatch {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub add_labels: Vec<String>,
    #[serde(default)]
    pub close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub open: bool,
    pub created_at: Timestamp,
    #[serde(default)]
    pub comments: Vec<String>,
}

impl Document for Ticket {
    const KIND: &'static str = "ticket";
    fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_issue(&self, issue: NewIssue) -> Result<String>;
    async fn update_issue(&self, issue_id: &str, patch: IssuePatch) -> Result<()>;
}

pub struct FileIssueTracker {
    tickets: Box<dyn Repository<Ticket>>,
    clock: Arc<dyn Clock>,
}

impl FileIssueTracker {
    pub fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        Ok(Self {
            tickets: Box::new(JsonRepository::open(dir)?),
            clock,
        })
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            tickets: Box::new(MemoryRepository::new()),
            clock,
        }
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        self.tickets.list()
    }
}

#[async_trait]
impl IssueTracker for FileIssueTracker {
    async fn create_issue(&self, issue: NewIssue) -> Result<String> {
        let ticket = Ticket {
            id: new_id("ticket"),
            title: issue.title,
            body: issue.body,
            labels: issue.labels,
            open: true,
            created_at: self.clock.now(),
            comments: Vec::new(),
        };
        self.tickets.put(&ticket)?;
        info!(ticket_id = %ticket.id, title = %ticket.title, "ticket opened");
        Ok(ticket.id)
    }

    async fn update_issue(&self, issue_id: &str, patch: IssuePatch) -> Result<()> {
        let mut ticket = self
            .tickets
            .get(issue_id)
            .ok_or_else(|| Error::not_found("ticket", issue_id))?;
        if let Some(comment) = patch.comment {
            ticket.comments.push(comment);
        }
        for label in patch.add_labels {
            if !ticket.labels.contains(&label) {
                ticket.labels.push(label);
            }
        }
        if patch.close {
            ticket.open = false;
        }
        self.tickets.put(&ticket)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ManualClock, epoch};

    #[tokio::test]
    async fn tickets_persist_and_accept_updates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::default());
        clock.advance_secs(90);
        let tracker = FileIssueTracker::open(temp.path(), clock.clone()).expect("open");
        let id = tracker
            .create_issue(NewIssue {
                title: "Checkpoint cp-1 needs review".to_string(),
                body: "failed 3 times".to_string(),
                labels: vec!["escalated".to_string()],
            })
            .await
            .expect("create");
        tracker
            .update_issue(
                &id,
                IssuePatch {
                    comment: Some("looking".to_string()),
                    add_labels: vec!["escalated".to_string(), "triaged".to_string()],
                    close: true,
                },
            )
            .await
            .expect("update");

        let reopened = FileIssueTracker::open(temp.path(), clock).expect("reopen");
        let tickets = reopened.tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].created_at, epoch() + chrono::Duration::seconds(90));
        assert_eq!(tickets[0].labels, vec!["escalated", "triaged"]);
        assert_eq!(tickets[0].comments, vec!["looking"]);
        assert!(!tickets[0].open);
    }

    #[tokio::test]
    async fn updating_unknown_ticket_is_not_found() {
        let tracker = FileIssueTracker::in_memory(Arc::new(ManualClock::default()));
        let err = tracker
            .update_issue("ticket-missing", IssuePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}

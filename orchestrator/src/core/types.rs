//! Entity records and shared value types.
//!
//! Everything here serializes to the on-disk JSON documents, so field names
//! and enum spellings are part of the persistence format.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

/// Generate a prefixed random id (`task-3f2c...`).
pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftState {
    Created,
    Validating,
    Validated,
    Failed,
    TaskBreakdown,
    InExecution,
    ReadyForMerge,
    Merged,
}

impl DraftState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Validating => "validating",
            Self::Validated => "validated",
            Self::Failed => "failed",
            Self::TaskBreakdown => "task_breakdown",
            Self::InExecution => "in_execution",
            Self::ReadyForMerge => "ready_for_merge",
            Self::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationCheck {
    pub name: String,
    pub passed: bool,
    pub details: String,
}

/// One entry of a draft's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub from: String,
    pub to: String,
    pub event: String,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub content: String,
    pub description: String,
    pub state: DraftState,
    #[serde(default)]
    pub validations: Vec<ValidationCheck>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub merged_by: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub history: Vec<StateChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Escalated,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub draft_id: String,
    pub name: String,
    pub objective: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Ordered checkpoint ids.
    pub checkpoints: Vec<String>,
    pub status: TaskStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    InProgress,
    Pass,
    Fail,
    RetryPending,
    FailedMaxRetries,
    Escalated,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::RetryPending => "retry_pending",
            Self::FailedMaxRetries => "failed_max_retries",
            Self::Escalated => "escalated",
        }
    }

    /// Retries are exhausted; only a human or a rollback moves it again.
    pub fn is_exhausted(self) -> bool {
        matches!(self, Self::FailedMaxRetries | Self::Escalated)
    }
}

/// A binary pass/fail criterion attached to a checkpoint.
///
/// `command`, `expected_patterns` and `required_files` are optional hints
/// for the verifier. When absent, expectations are derived from the
/// description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassCriterion {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expected_patterns: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_files: Vec<String>,
}

impl PassCriterion {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            command: None,
            expected_patterns: Vec::new(),
            required_files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: Timestamp,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "[{}] {} {}", self.at.to_rfc3339(), level, self.message)
    }
}

/// Append `entry` and drop the oldest entries beyond `limit`.
pub fn push_bounded<T>(items: &mut Vec<T>, entry: T, limit: usize) {
    items.push(entry);
    if items.len() > limit {
        let excess = items.len() - limit;
        items.drain(..excess);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    pub name: String,
    pub objective: String,
    #[serde(default)]
    pub instructions: Vec<String>,
    #[serde(default)]
    pub pass_criteria: Vec<PassCriterion>,
    pub status: CheckpointStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default)]
    pub parallelizable: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub needs_escalation: bool,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    pub updated_at: Timestamp,
}

fn default_true() -> bool {
    true
}

impl Checkpoint {
    pub fn log(&mut self, at: Timestamp, level: LogLevel, message: impl Into<String>, limit: usize) {
        push_bounded(
            &mut self.logs,
            LogEntry {
                at,
                level,
                message: message.into(),
            },
            limit,
        );
    }

    /// The last `count` log lines, oldest first.
    pub fn recent_logs(&self, count: usize) -> &[LogEntry] {
        let start = self.logs.len().saturating_sub(count);
        &self.logs[start..]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// Externally registered session driven by the decision engine.
    Worker,
    /// Session spawned by a `create_instance` decision.
    Helper,
    /// Isolated sandbox owned by the checkpoint executor.
    Checkpoint,
    /// Control record holding a task's checkpoint pointer.
    Task,
}

impl InstanceKind {
    /// Kinds the decision engine polls and decides for.
    pub fn is_scheduled(self) -> bool {
        matches!(self, Self::Worker | Self::Helper)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Paused,
    Errored,
    Completed,
    Escalated,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Errored => "errored",
            Self::Completed => "completed",
            Self::Escalated => "escalated",
        }
    }

    /// Statuses the cleanup sweep removes once the grace window passes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    /// No further work will be dispatched for this instance.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Escalated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Orchestrator,
    Worker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMessage {
    pub role: MessageRole,
    pub text: String,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub at: Timestamp,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    SendMessage,
    CreateInstance,
    MarkComplete,
    Escalate,
    Wait,
    DecomposeTask,
}

impl DecisionAction {
    pub const ALL: [DecisionAction; 6] = [
        Self::SendMessage,
        Self::CreateInstance,
        Self::MarkComplete,
        Self::Escalate,
        Self::Wait,
        Self::DecomposeTask,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendMessage => "send_message",
            Self::CreateInstance => "create_instance",
            Self::MarkComplete => "mark_complete",
            Self::Escalate => "escalate",
            Self::Wait => "wait",
            Self::DecomposeTask => "decompose_task",
        }
    }

    /// Allow-list lookup. Accepts `snake_case`, `kebab-case` and upper case.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|action| action.as_str() == normalized)
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded scheduling decision. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub action: DecisionAction,
    pub target_instance: String,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    /// Set when a gate overrode the reasoning collaborator.
    #[serde(default)]
    pub forced: bool,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub kind: InstanceKind,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub checkpoint_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub status: InstanceStatus,
    pub decision_count: u32,
    pub created_at: Timestamp,
    pub last_activity: Timestamp,
    pub status_changed_at: Timestamp,
    #[serde(default)]
    pub last_decision_at: Option<Timestamp>,
    /// Position of the current checkpoint for task-kind instances.
    #[serde(default)]
    pub checkpoint_index: usize,
    #[serde(default)]
    pub messages: Vec<InstanceMessage>,
    #[serde(default)]
    pub heartbeats: Vec<Heartbeat>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub repeating_pattern: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Instance {
    pub fn recent_actions(&self) -> Vec<DecisionAction> {
        self.decisions.iter().map(|d| d.action).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub executed: bool,
    pub evidence: Vec<String>,
    pub confidence: u8,
    pub errors: Vec<String>,
}

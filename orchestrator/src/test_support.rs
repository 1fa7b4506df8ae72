//! Test-only builders and scripted collaborators.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::app::Collaborators;
use crate::clock::Clock;
use crate::core::types::{
    Checkpoint, CheckpointStatus, Instance, InstanceKind, InstanceStatus, PassCriterion, Task,
    TaskStatus, Timestamp,
};
use crate::error::{Error, Result};
use crate::io::config::OrchestratorConfig;
use crate::io::paths::{StatePaths, init_state};
use crate::io::reasoner::Reasoner;
use crate::io::tracker::{FileIssueTracker, IssuePatch, IssueTracker, NewIssue};
use crate::io::worker::{ExecutionWorker, SessionContext, SessionState, WorkerStatus};

/// Output that satisfies the default [`checkpoint`] criterion.
pub const PASSING_OUTPUT: &str = "STEP_OK completed\nCRITERION 1: PASS";
/// Output that satisfies nothing.
pub const FAILING_OUTPUT: &str = "error: build broke\nCRITERION 1: FAIL";

/// Draft content carrying every default required section.
pub const DRAFT_CONTENT: &str = "## Task:\nAdd a parser\n\n## Acceptance Criteria:\n- parses toml\n\n## Technical Details:\nUse serde.\n";

pub fn epoch() -> Timestamp {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Deterministic pending checkpoint with one echo-verified criterion.
pub fn checkpoint(id: &str, task_id: &str) -> Checkpoint {
    Checkpoint {
        id: id.to_string(),
        task_id: task_id.to_string(),
        name: format!("{id} name"),
        objective: format!("{id} objective"),
        instructions: vec!["print the marker".to_string()],
        pass_criteria: vec![PassCriterion {
            command: Some("echo STEP_OK".to_string()),
            ..PassCriterion::described("marker echoed")
        }],
        status: CheckpointStatus::Pending,
        retry_count: 0,
        max_retries: 3,
        blocking: true,
        parallelizable: false,
        dependencies: Vec::new(),
        needs_escalation: false,
        ticket_id: None,
        logs: Vec::new(),
        updated_at: epoch(),
    }
}

pub fn task(id: &str, checkpoint_ids: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        draft_id: "draft-1".to_string(),
        name: format!("{id} name"),
        objective: format!("{id} objective"),
        acceptance_criteria: Vec::new(),
        checkpoints: checkpoint_ids.iter().map(|c| c.to_string()).collect(),
        status: TaskStatus::Pending,
        created_at: epoch(),
        updated_at: epoch(),
    }
}

/// Active worker instance whose session id equals its id.
pub fn instance(id: &str) -> Instance {
    Instance {
        id: id.to_string(),
        kind: InstanceKind::Worker,
        parent_id: None,
        task_id: None,
        checkpoint_id: None,
        session_id: Some(id.to_string()),
        status: InstanceStatus::Active,
        decision_count: 0,
        created_at: epoch(),
        last_activity: epoch(),
        status_changed_at: epoch(),
        last_decision_at: None,
        checkpoint_index: 0,
        messages: Vec::new(),
        heartbeats: Vec::new(),
        decisions: Vec::new(),
        log: Vec::new(),
        repeating_pattern: false,
        metadata: BTreeMap::new(),
    }
}

/// JSON task plan with `count` checkpoints using the default criterion.
pub fn plan_json(count: usize) -> String {
    let checkpoints: Vec<serde_json::Value> = (0..count)
        .map(|n| {
            serde_json::json!({
                "name": format!("step {n}"),
                "objective": format!("do step {n}"),
                "instructions": ["print the marker"],
                "pass_criteria": [{"description": "marker echoed", "command": "echo STEP_OK"}],
            })
        })
        .collect();
    serde_json::json!({
        "task": {"name": "Add parser", "objective": "Parse configs"},
        "checkpoints": checkpoints,
    })
    .to_string()
}

/// Config with millisecond polling and no retry delay.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.execution.poll_interval_ms = 1;
    config.execution.poll_max_attempts = 5;
    config.execution.retry_delay_ms = 0;
    config.execution.transient_retries = 0;
    config.execution.backoff_initial_ms = 1;
    config.execution.backoff_max_ms = 2;
    config
}

/// Initialized state directory inside a fresh tempdir.
pub fn temp_state() -> (tempfile::TempDir, StatePaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = StatePaths::new(temp.path());
    init_state(&paths, false).expect("init state");
    (temp, paths)
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(epoch())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Script for one worker session.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    /// States returned by successive polls; the last one repeats.
    pub states: Vec<SessionState>,
    pub messages: Vec<String>,
    pub error: Option<String>,
    /// `submit` fails permanently with this message.
    pub reject: Option<String>,
    /// `poll_status` fails with this message.
    pub poll_error: Option<String>,
}

impl ScriptedSession {
    pub fn passing(output: &str) -> Self {
        Self {
            states: vec![SessionState::Running, SessionState::Completed],
            messages: vec![output.to_string()],
            error: None,
            reject: None,
            poll_error: None,
        }
    }

    pub fn failing() -> Self {
        Self::passing(FAILING_OUTPUT)
    }

    pub fn running_forever() -> Self {
        Self {
            states: vec![SessionState::Running],
            messages: Vec::new(),
            ..Self::passing("")
        }
    }

    pub fn errored(message: &str) -> Self {
        Self {
            states: vec![SessionState::Errored],
            messages: Vec::new(),
            error: Some(message.to_string()),
            ..Self::passing("")
        }
    }

    pub fn rejected(message: &str) -> Self {
        Self {
            reject: Some(message.to_string()),
            ..Self::passing("")
        }
    }

    pub fn unreachable(message: &str) -> Self {
        Self {
            poll_error: Some(message.to_string()),
            ..Self::running_forever()
        }
    }
}

#[derive(Debug)]
struct LiveSession {
    script: ScriptedSession,
    polls: usize,
    terminated: bool,
}

#[derive(Debug, Default)]
struct WorkerState {
    queue: VecDeque<ScriptedSession>,
    sessions: HashMap<String, LiveSession>,
    next_id: usize,
    transient_failures: u32,
    transient_poll_failures: u32,
    submit_attempts: usize,
    live: usize,
    max_live: usize,
    contexts: Vec<SessionContext>,
    executed: Vec<(String, String)>,
    terminated: Vec<String>,
}

/// Worker that replays scripted sessions in submit order.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    state: Mutex<WorkerState>,
}

impl ScriptedWorker {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                queue: sessions.into(),
                ..WorkerState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, session: ScriptedSession) {
        self.state().queue.push_back(session);
    }

    /// Bind a script to an externally created session id.
    pub fn attach(&self, session_id: &str, script: ScriptedSession) {
        let mut state = self.state();
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.sessions.insert(
            session_id.to_string(),
            LiveSession {
                script,
                polls: 0,
                terminated: false,
            },
        );
    }

    /// Append a message to a session as if the worker produced it.
    pub fn push_message(&self, session_id: &str, text: &str) {
        if let Some(session) = self.state().sessions.get_mut(session_id) {
            session.script.messages.push(text.to_string());
        }
    }

    /// The next `count` submits fail with a transient error.
    pub fn fail_next_submits(&self, count: u32) {
        self.state().transient_failures = count;
    }

    /// The next `count` status polls fail with a transient error.
    pub fn fail_next_polls(&self, count: u32) {
        self.state().transient_poll_failures = count;
    }

    pub fn submit_attempts(&self) -> usize {
        self.state().submit_attempts
    }

    /// Highest number of simultaneously live sessions.
    pub fn max_live(&self) -> usize {
        self.state().max_live
    }

    pub fn live(&self) -> usize {
        self.state().live
    }

    pub fn contexts(&self) -> Vec<SessionContext> {
        self.state().contexts.clone()
    }

    /// `(session_id, text)` pairs sent through `execute`.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.state().executed.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }
}

#[async_trait]
impl ExecutionWorker for ScriptedWorker {
    async fn submit(&self, context: &SessionContext) -> Result<String> {
        let mut state = self.state();
        state.submit_attempts += 1;
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(Error::TransientWorker("scripted outage".to_string()));
        }
        let script = state
            .queue
            .pop_front()
            .ok_or_else(|| Error::Worker("no scripted session left".to_string()))?;
        if let Some(reason) = &script.reject {
            return Err(Error::Worker(reason.clone()));
        }
        state.next_id += 1;
        let id = format!("session-{}", state.next_id);
        state.contexts.push(context.clone());
        state.live += 1;
        state.max_live = state.max_live.max(state.live);
        state.sessions.insert(
            id.clone(),
            LiveSession {
                script,
                polls: 0,
                terminated: false,
            },
        );
        Ok(id)
    }

    async fn execute(&self, session_id: &str, text: &str) -> Result<()> {
        let mut state = self.state();
        if !state.sessions.contains_key(session_id) {
            return Err(Error::Worker(format!("unknown session {session_id}")));
        }
        state
            .executed
            .push((session_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn poll_status(&self, session_id: &str) -> Result<WorkerStatus> {
        let mut state = self.state();
        if state.transient_poll_failures > 0 {
            state.transient_poll_failures -= 1;
            return Err(Error::TransientWorker("scripted outage".to_string()));
        }
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Worker(format!("unknown session {session_id}")))?;
        if let Some(message) = &session.script.poll_error {
            return Err(Error::Worker(message.clone()));
        }
        let index = session.polls.min(session.script.states.len().saturating_sub(1));
        session.polls += 1;
        let status = session
            .script
            .states
            .get(index)
            .copied()
            .unwrap_or(SessionState::Running);
        Ok(WorkerStatus {
            status,
            last_output: session.script.messages.last().cloned().unwrap_or_default(),
            error: session.script.error.clone(),
        })
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<String>> {
        let state = self.state();
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| Error::Worker(format!("unknown session {session_id}")))?;
        Ok(session.script.messages.clone())
    }

    async fn terminate(&self, session_id: &str) -> Result<()> {
        let mut state = self.state();
        let newly_terminated = match state.sessions.get_mut(session_id) {
            Some(session) if !session.terminated => {
                session.terminated = true;
                true
            }
            _ => false,
        };
        if newly_terminated {
            state.live -= 1;
            state.terminated.push(session_id.to_string());
        }
        Ok(())
    }
}

/// Reasoner that replays scripted responses and records prompts.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    decisions: Mutex<VecDeque<Result<String>>>,
    plans: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    think_time: Mutex<Option<(Arc<ManualClock>, i64)>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_decision(&self, raw: &str) {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Ok(raw.to_string()));
    }

    /// Every `decide` call moves `clock` forward by `secs` before answering.
    pub fn think_for(&self, clock: Arc<ManualClock>, secs: i64) {
        *self.think_time.lock().unwrap_or_else(PoisonError::into_inner) = Some((clock, secs));
    }

    pub fn fail_next_decision(&self) {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Err(Error::Worker("reasoner offline".to_string())));
    }

    pub fn push_plan(&self, raw: &str) {
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(raw.to_string());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, prompt: &str) {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(prompt.to_string());
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn decide(&self, prompt: &str) -> Result<String> {
        self.record(prompt);
        if let Some((clock, secs)) = &*self.think_time.lock().unwrap_or_else(PoisonError::into_inner) {
            clock.advance_secs(*secs);
        }
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| Ok(r#"{"action": "wait", "reasoning": "nothing scripted"}"#.to_string()))
    }

    async fn decompose(&self, prompt: &str) -> Result<String> {
        self.record(prompt);
        self.plans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| Error::Worker("no plan scripted".to_string()))
    }
}

/// Tracker that refuses a scripted number of ticket creations before
/// delegating to an in-memory tracker.
pub struct FlakyTracker {
    inner: Arc<FileIssueTracker>,
    failing_creates: Mutex<u32>,
}

impl FlakyTracker {
    pub fn new(inner: Arc<FileIssueTracker>) -> Self {
        Self {
            inner,
            failing_creates: Mutex::new(0),
        }
    }

    pub fn fail_next_creates(&self, count: u32) {
        *self.failing_creates.lock().unwrap_or_else(PoisonError::into_inner) = count;
    }
}

#[async_trait]
impl IssueTracker for FlakyTracker {
    async fn create_issue(&self, issue: NewIssue) -> Result<String> {
        {
            let mut failing = self.failing_creates.lock().unwrap_or_else(PoisonError::into_inner);
            if *failing > 0 {
                *failing -= 1;
                return Err(Error::Worker("tracker offline".to_string()));
            }
        }
        self.inner.create_issue(issue).await
    }

    async fn update_issue(&self, issue_id: &str, patch: IssuePatch) -> Result<()> {
        self.inner.update_issue(issue_id, patch).await
    }
}

/// Scripted collaborators plus handles to inspect them.
pub struct Harness {
    pub worker: Arc<ScriptedWorker>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub tracker: Arc<FileIssueTracker>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        let clock = Arc::new(ManualClock::default());
        Self {
            worker: Arc::new(ScriptedWorker::new(sessions)),
            reasoner: Arc::new(ScriptedReasoner::new()),
            tracker: Arc::new(FileIssueTracker::in_memory(clock.clone())),
            clock,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            worker: self.worker.clone(),
            reasoner: self.reasoner.clone(),
            tracker: self.tracker.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        std::env::temp_dir()
    }
}

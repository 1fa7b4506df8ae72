//! Decision engine for scheduler-driven instances.
//!
//! Each tick observes every active worker/helper session concurrently. A
//! session whose status or output fingerprint changed gets a decision:
//! cooldown gate, decision cap, bounded context, reasoning collaborator,
//! parse, loop bias, record, dispatch.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use futures::future::join_all;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::context::bounded_window;
use crate::core::decision::parse_decision;
use crate::core::patterns::{continues_cycle, has_repeating_pattern};
use crate::core::types::{
    Decision, DecisionAction, Instance, InstanceKind, InstanceStatus, LogLevel, MessageRole,
    Timestamp, new_id, push_bounded,
};
use crate::entities::EntityStore;
use crate::error::{Error, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::io::config::SchedulerConfig;
use crate::io::prompt::{DecisionPromptInput, PromptRenderer};
use crate::io::reasoner::Reasoner;
use crate::io::worker::{ExecutionWorker, SessionContext, SessionState};
use crate::registry::{InstanceRegistry, Registration};
use crate::supervisor::TaskSupervisor;

const SEEN_MESSAGES_KEY: &str = "seen_messages";
const WORKING_DIR_KEY: &str = "working_dir";
const DRAFT_KEY: &str = "draft_id";

#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub instance_id: String,
    pub state: SessionState,
    /// Status or output differs from the previous observation.
    pub changed: bool,
    pub new_messages: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub observed: usize,
    pub changed: Vec<String>,
    /// Instance id to error message, for fetches that failed.
    pub errors: BTreeMap<String, String>,
    pub decisions: Vec<Decision>,
}

struct Proposal {
    action: DecisionAction,
    reasoning: String,
    payload: Option<String>,
    forced: bool,
}

pub struct DecisionEngine {
    registry: Arc<InstanceRegistry>,
    worker: Arc<dyn ExecutionWorker>,
    reasoner: Arc<dyn Reasoner>,
    prompts: Arc<PromptRenderer>,
    entities: Arc<EntityStore>,
    supervisor: Arc<TaskSupervisor>,
    config: SchedulerConfig,
    events: EventBus,
    fingerprints: Mutex<HashMap<String, String>>,
}

impl DecisionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<InstanceRegistry>,
        worker: Arc<dyn ExecutionWorker>,
        reasoner: Arc<dyn Reasoner>,
        prompts: Arc<PromptRenderer>,
        entities: Arc<EntityStore>,
        supervisor: Arc<TaskSupervisor>,
        config: SchedulerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            worker,
            reasoner,
            prompts,
            entities,
            supervisor,
            config,
            events,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    fn schedulable(instance: &Instance) -> bool {
        instance.kind.is_scheduled()
            && instance.status == InstanceStatus::Active
            && instance.session_id.is_some()
    }

    /// One scheduler tick: observe every schedulable instance, then decide
    /// for the ones that changed.
    #[instrument(skip_all)]
    pub async fn poll_once(&self) -> PollReport {
        let candidates: Vec<Instance> = self
            .registry
            .list()
            .into_iter()
            .filter(Self::schedulable)
            .collect();
        self.prune_fingerprints(&candidates);
        let mut report = PollReport {
            observed: candidates.len(),
            ..PollReport::default()
        };

        let observations = join_all(candidates.iter().map(|i| self.observe(i))).await;
        for (instance, observation) in candidates.iter().zip(observations) {
            match observation {
                Ok(observation) if observation.changed => report.changed.push(instance.id.clone()),
                Ok(_) => {}
                Err(err) => {
                    warn!(instance_id = %instance.id, error = %err, "observation failed");
                    if let Err(log_err) = self.registry.log(
                        &instance.id,
                        LogLevel::Warn,
                        format!("status fetch failed: {err}"),
                    ) {
                        warn!(instance_id = %instance.id, error = %log_err, "instance log write failed");
                    }
                    report.errors.insert(instance.id.clone(), err.to_string());
                }
            }
        }

        let decisions = join_all(report.changed.iter().map(|id| self.decide(id))).await;
        for (id, decision) in report.changed.iter().zip(decisions) {
            match decision {
                Ok(Some(decision)) => report.decisions.push(decision),
                Ok(None) => {}
                Err(err) => {
                    warn!(instance_id = %id, error = %err, "decision failed");
                    report.errors.insert(id.clone(), err.to_string());
                }
            }
        }
        debug!(
            observed = report.observed,
            changed = report.changed.len(),
            decisions = report.decisions.len(),
            "poll complete"
        );
        report
    }

    /// Forget fingerprints of instances that are no longer scheduled.
    fn prune_fingerprints(&self, candidates: &[Instance]) {
        let live: HashSet<&str> = candidates.iter().map(|i| i.id.as_str()).collect();
        self.fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id, _| live.contains(id.as_str()));
    }

    /// Number of instances with a remembered output fingerprint.
    pub fn tracked_fingerprints(&self) -> usize {
        self.fingerprints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Fetch status and messages for one instance and fold them in.
    pub async fn observe(&self, instance: &Instance) -> Result<Observation> {
        let session_id = instance
            .session_id
            .as_deref()
            .ok_or_else(|| Error::validation(format!("instance '{}' has no session", instance.id)))?;
        let status = self.worker.poll_status(session_id).await?;
        let messages = self.worker.list_messages(session_id).await?;

        let fingerprint = fingerprint(status.status, &status.last_output, &messages);
        let changed = {
            let mut seen = self
                .fingerprints
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            seen.insert(instance.id.clone(), fingerprint.clone()) != Some(fingerprint)
        };

        let seen = instance
            .metadata
            .get(SEEN_MESSAGES_KEY)
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        let fresh = messages.get(seen..).unwrap_or_default();
        for message in fresh {
            self.registry
                .append_message(&instance.id, MessageRole::Worker, message)?;
        }
        if !fresh.is_empty() {
            let total = messages.len().to_string();
            self.registry.update(&instance.id, |instance| {
                instance.metadata.insert(SEEN_MESSAGES_KEY.to_string(), total);
                Ok(())
            })?;
        }

        if status.status == SessionState::Errored {
            let reason = status
                .error
                .unwrap_or_else(|| "worker reported an error".to_string());
            self.registry
                .log(&instance.id, LogLevel::Error, format!("session errored: {reason}"))?;
            self.registry
                .set_status(&instance.id, InstanceStatus::Errored)?;
            return Ok(Observation {
                instance_id: instance.id.clone(),
                state: status.status,
                changed: false,
                new_messages: fresh.len(),
            });
        }

        Ok(Observation {
            instance_id: instance.id.clone(),
            state: status.status,
            changed,
            new_messages: fresh.len(),
        })
    }

    /// Reserve the cooldown slot. `None` when the instance is not eligible
    /// or decided too recently. The reserved instant becomes the decision's
    /// timestamp, so recorded decisions are always a full cooldown apart.
    fn reserve(&self, instance_id: &str) -> Result<Option<(Instance, Timestamp)>> {
        let now = self.registry.now();
        let cooldown = Duration::milliseconds(
            i64::try_from(self.config.decision_cooldown_ms).unwrap_or(i64::MAX),
        );
        self.registry.update(instance_id, |instance| {
            if !Self::schedulable(instance) {
                return Ok(None);
            }
            if let Some(last) = instance.last_decision_at
                && now - last < cooldown
            {
                return Ok(None);
            }
            instance.last_decision_at = Some(now);
            Ok(Some((instance.clone(), now)))
        })
    }

    /// Compute, record and dispatch one decision for `instance_id`.
    ///
    /// Returns `None` when a gate skipped the instance. Dispatch failures
    /// are written to the instance log and do not undo the decision.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn decide(&self, instance_id: &str) -> Result<Option<Decision>> {
        let Some((instance, reserved_at)) = self.reserve(instance_id)? else {
            debug!("decision skipped");
            return Ok(None);
        };

        let proposal = if instance.decision_count >= self.config.max_decisions_per_instance {
            Proposal {
                action: DecisionAction::Escalate,
                reasoning: format!(
                    "decision limit of {} reached",
                    self.config.max_decisions_per_instance
                ),
                payload: None,
                forced: true,
            }
        } else {
            let proposal = self.propose(&instance).await;
            self.bias_against_loop(&instance, proposal)
        };

        let decision = Decision {
            action: proposal.action,
            target_instance: instance.id.clone(),
            reasoning: proposal.reasoning,
            payload: proposal.payload,
            forced: proposal.forced,
            timestamp: reserved_at,
        };
        let limit = self.config.decision_history_limit;
        let recorded = decision.clone();
        self.registry.update(instance_id, |instance| {
            push_bounded(&mut instance.decisions, recorded, limit);
            instance.decision_count += 1;
            instance.repeating_pattern = has_repeating_pattern(&instance.recent_actions());
            Ok(())
        })?;
        info!(action = %decision.action, forced = decision.forced, "decision recorded");
        self.events.emit(OrchestratorEvent::DecisionRecorded {
            instance_id: instance_id.to_string(),
            action: decision.action,
            forced: decision.forced,
        });

        if let Err(err) = self.dispatch(&instance, &decision).await {
            warn!(action = %decision.action, error = %err, "dispatch failed");
            self.registry.log(
                instance_id,
                LogLevel::Error,
                format!("{} failed: {err}", decision.action),
            )?;
        }
        Ok(Some(decision))
    }

    /// Ask the reasoning collaborator. Anything unusable becomes `wait`.
    async fn propose(&self, instance: &Instance) -> Proposal {
        let wait = |reason: String| Proposal {
            action: DecisionAction::Wait,
            reasoning: reason,
            payload: None,
            forced: false,
        };
        let prompt = match self.decision_prompt(instance) {
            Ok(prompt) => prompt,
            Err(err) => return wait(format!("context unavailable: {err}")),
        };
        let raw = match self.reasoner.decide(&prompt).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "reasoner call failed");
                return wait(format!("reasoner unavailable: {err}"));
            }
        };
        let parsed = parse_decision(&raw);
        if let Some(reason) = &parsed.malformed {
            let err = Error::MalformedDecision(reason.clone());
            warn!(error = %err, "decision replaced with wait");
            if let Err(log_err) = self.registry.log(&instance.id, LogLevel::Warn, err.to_string()) {
                warn!(error = %log_err, "instance log write failed");
            }
            return wait(reason.clone());
        }
        Proposal {
            action: parsed.action,
            reasoning: parsed.reasoning,
            payload: parsed.payload,
            forced: false,
        }
    }

    fn decision_prompt(&self, instance: &Instance) -> Result<String> {
        let texts: Vec<String> = instance.messages.iter().map(|m| m.text.clone()).collect();
        let window = bounded_window(
            &texts,
            self.config.context_messages,
            self.config.context_budget_bytes,
        );
        let related = self.registry.get_related(&instance.id)?;
        let checkpoint = instance
            .checkpoint_id
            .as_deref()
            .and_then(|id| self.entities.get_checkpoint(id).ok());
        let prompt = self.prompts.render_decision(&DecisionPromptInput {
            instance,
            parent: related.parent.as_ref().map(|p| p.id.as_str()),
            children: related.children.iter().map(|c| c.id.as_str()).collect(),
            checkpoint: checkpoint.as_ref(),
            window: &window,
        })?;
        Ok(prompt)
    }

    fn bias_against_loop(&self, instance: &Instance, proposal: Proposal) -> Proposal {
        if proposal.action == DecisionAction::Wait
            || !instance.repeating_pattern
            || !continues_cycle(&instance.recent_actions(), proposal.action)
        {
            return proposal;
        }
        debug!(proposed = %proposal.action, "proposal continues a repeating pattern");
        Proposal {
            action: DecisionAction::Wait,
            reasoning: format!(
                "repeating pattern: replaced {} with wait ({})",
                proposal.action, proposal.reasoning
            ),
            payload: None,
            forced: true,
        }
    }

    async fn dispatch(&self, instance: &Instance, decision: &Decision) -> Result<()> {
        match decision.action {
            DecisionAction::Wait => Ok(()),
            DecisionAction::SendMessage => {
                let text = decision
                    .payload
                    .as_deref()
                    .ok_or_else(|| Error::validation("send_message needs a message"))?;
                self.send(instance, text).await
            }
            DecisionAction::CreateInstance => {
                let brief = decision.payload.as_deref().unwrap_or(&decision.reasoning);
                self.create_instance(instance, brief).await.map(|_| ())
            }
            DecisionAction::MarkComplete => {
                self.registry
                    .set_status(&instance.id, InstanceStatus::Completed)?;
                if instance.kind == InstanceKind::Helper
                    && let Some(session_id) = &instance.session_id
                {
                    self.worker.terminate(session_id).await?;
                }
                Ok(())
            }
            DecisionAction::Escalate => self
                .supervisor
                .escalate_instance(&instance.id, &decision.reasoning)
                .await
                .map(|_| ()),
            DecisionAction::DecomposeTask => self.decompose_task(instance).await,
        }
    }

    async fn send(&self, instance: &Instance, text: &str) -> Result<()> {
        let session_id = instance
            .session_id
            .as_deref()
            .ok_or_else(|| Error::validation(format!("instance '{}' has no session", instance.id)))?;
        self.worker.execute(session_id, text).await?;
        self.registry
            .append_message(&instance.id, MessageRole::Orchestrator, text)
    }

    /// Spawn a helper instance under `parent`. The registration is removed
    /// again if its session cannot be created.
    pub async fn create_instance(&self, parent: &Instance, brief: &str) -> Result<Instance> {
        let id = new_id("inst");
        let working_dir = parent
            .metadata
            .get(WORKING_DIR_KEY)
            .cloned()
            .unwrap_or_else(|| ".".to_string());
        self.registry.register(
            &id,
            Registration {
                kind: Some(InstanceKind::Helper),
                parent_id: Some(parent.id.clone()),
                task_id: parent.task_id.clone(),
                checkpoint_id: parent.checkpoint_id.clone(),
                metadata: BTreeMap::from([(WORKING_DIR_KEY.to_string(), working_dir.clone())]),
                ..Registration::default()
            },
        )?;

        let context = SessionContext {
            working_dir: PathBuf::from(working_dir),
            label: id.clone(),
        };
        let session_id = match self.worker.submit(&context).await {
            Ok(session_id) => session_id,
            Err(err) => {
                self.registry.remove(&id)?;
                return Err(err);
            }
        };
        let helper = self.registry.update(&id, |helper| {
            helper.session_id = Some(session_id.clone());
            Ok(helper.clone())
        })?;
        if !brief.trim().is_empty() {
            self.send(&helper, brief).await?;
        }
        info!(parent = %parent.id, helper = %id, "helper instance created");
        self.registry.require(&id)
    }

    async fn decompose_task(&self, instance: &Instance) -> Result<()> {
        let task = match (&instance.task_id, instance.metadata.get(DRAFT_KEY)) {
            (Some(task_id), _) => self.entities.get_task(task_id)?,
            (None, Some(draft_id)) => {
                let task = self.entities.breakdown(draft_id).await?;
                let task_id = task.id.clone();
                self.registry.update(&instance.id, |instance| {
                    instance.task_id = Some(task_id);
                    Ok(())
                })?;
                task
            }
            (None, None) => {
                return Err(Error::validation(format!(
                    "instance '{}' has neither a task nor a draft to decompose",
                    instance.id
                )));
            }
        };
        let checkpoints = self.entities.task_checkpoints(&task.id)?;
        let plan = self.prompts.render_plan(&task, &checkpoints)?;
        self.send(instance, &plan).await
    }
}

fn fingerprint(state: SessionState, last_output: &str, messages: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{state:?}").as_bytes());
    hasher.update([0x1f]);
    hasher.update(last_output.as_bytes());
    for message in messages {
        hasher.update([0x1e]);
        hasher.update(message.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Orchestrator;
    use crate::test_support::{
        DRAFT_CONTENT, Harness, ScriptedSession, fast_config, plan_json,
    };

    fn orchestrator(harness: &Harness, cooldown_ms: u64) -> Orchestrator {
        let mut config = fast_config();
        config.scheduler.decision_cooldown_ms = cooldown_ms;
        Orchestrator::in_memory(config, harness.collaborators())
    }

    fn register_worker(orch: &Orchestrator, harness: &Harness, id: &str) {
        harness
            .worker
            .attach(id, ScriptedSession::running_forever());
        orch.registry
            .register(id, Registration::default())
            .expect("register");
    }

    #[test]
    fn fingerprint_tracks_output_and_status() {
        let a = fingerprint(SessionState::Running, "x", &["m".to_string()]);
        assert_eq!(a, fingerprint(SessionState::Running, "x", &["m".to_string()]));
        assert_ne!(a, fingerprint(SessionState::Completed, "x", &["m".to_string()]));
        assert_ne!(a, fingerprint(SessionState::Running, "x", &["m".to_string(), "n".to_string()]));
    }

    #[tokio::test]
    async fn unchanged_output_triggers_no_second_decision() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        harness.worker.push_message("w1", "compiling");

        let first = orch.scheduler.poll_once().await;
        assert_eq!(first.decisions.len(), 1);
        let second = orch.scheduler.poll_once().await;
        assert!(second.changed.is_empty());
        assert!(second.decisions.is_empty());

        let instance = orch.registry.require("w1").expect("w1");
        assert_eq!(instance.messages.len(), 1);
        assert_eq!(instance.messages[0].role, MessageRole::Worker);
    }

    #[tokio::test]
    async fn cooldown_blocks_a_second_decision() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 30_000);
        register_worker(&orch, &harness, "w1");

        assert!(orch.scheduler.decide("w1").await.expect("first").is_some());
        assert!(orch.scheduler.decide("w1").await.expect("second").is_none());
        harness.clock.advance_secs(31);
        assert!(orch.scheduler.decide("w1").await.expect("third").is_some());
        assert_eq!(orch.registry.require("w1").expect("w1").decision_count, 2);
    }

    #[tokio::test]
    async fn slow_reasoner_keeps_decisions_a_cooldown_apart() {
        let harness = Harness::new(Vec::new());
        harness.reasoner.think_for(harness.clock.clone(), 25);
        let orch = orchestrator(&harness, 30_000);
        register_worker(&orch, &harness, "w1");

        let first = orch.scheduler.decide("w1").await.expect("first").expect("decided");
        harness.clock.advance_secs(5);
        let second = orch.scheduler.decide("w1").await.expect("second").expect("decided");

        let gap = second.timestamp - first.timestamp;
        assert!(gap >= Duration::milliseconds(30_000), "gap was {gap}");
        let recorded = orch.registry.require("w1").expect("w1").decisions;
        assert_eq!(recorded[0].timestamp, first.timestamp);
        assert_eq!(recorded[1].timestamp, second.timestamp);
    }

    #[tokio::test]
    async fn failed_observation_is_logged_on_the_instance() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        harness.worker.fail_next_polls(1);

        orch.scheduler.poll_once().await;

        let log = orch.registry.require("w1").expect("w1").log;
        assert!(log.iter().any(|entry| entry.message.contains("status fetch failed")));
    }

    #[tokio::test]
    async fn swept_instances_lose_their_fingerprints() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        for id in ["w1", "w2", "w3"] {
            register_worker(&orch, &harness, id);
        }
        orch.scheduler.poll_once().await;
        assert_eq!(orch.scheduler.tracked_fingerprints(), 3);

        harness
            .clock
            .advance_secs(orch.config.registry.idle_ttl_secs as i64 + 1);
        assert_eq!(orch.registry.sweep().len(), 3);
        orch.scheduler.poll_once().await;
        assert_eq!(orch.scheduler.tracked_fingerprints(), 0);
    }

    #[tokio::test]
    async fn malformed_and_failed_reasoning_become_wait() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        harness.reasoner.push_decision(r#"{"action": "delete_everything"}"#);
        harness.reasoner.fail_next_decision();

        let first = orch.scheduler.decide("w1").await.expect("decide").expect("decision");
        assert_eq!(first.action, DecisionAction::Wait);
        let second = orch.scheduler.decide("w1").await.expect("decide").expect("decision");
        assert_eq!(second.action, DecisionAction::Wait);
        let log = orch.registry.require("w1").expect("w1").log;
        assert!(log.iter().any(|e| e.message.contains("delete_everything")));
    }

    #[tokio::test]
    async fn decision_cap_forces_escalation() {
        let harness = Harness::new(Vec::new());
        let mut config = fast_config();
        config.scheduler.decision_cooldown_ms = 0;
        config.scheduler.max_decisions_per_instance = 2;
        let orch = Orchestrator::in_memory(config, harness.collaborators());
        register_worker(&orch, &harness, "w1");

        orch.scheduler.decide("w1").await.expect("one");
        orch.scheduler.decide("w1").await.expect("two");
        let forced = orch.scheduler.decide("w1").await.expect("three").expect("decision");
        assert_eq!(forced.action, DecisionAction::Escalate);
        assert!(forced.forced);
        let instance = orch.registry.require("w1").expect("w1");
        assert_eq!(instance.status, InstanceStatus::Escalated);
        assert_eq!(harness.tracker.tickets().len(), 1);
    }

    #[tokio::test]
    async fn repeating_pattern_biases_toward_wait() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        for _ in 0..3 {
            harness
                .reasoner
                .push_decision(r#"{"action": "send_message", "message": "try again"}"#);
            harness.reasoner.push_decision(r#"{"action": "wait"}"#);
        }

        for _ in 0..4 {
            let decision = orch.scheduler.decide("w1").await.expect("decide").expect("decision");
            assert!(!decision.forced);
        }
        assert!(orch.registry.require("w1").expect("w1").repeating_pattern);

        let fifth = orch.scheduler.decide("w1").await.expect("decide").expect("decision");
        assert_eq!(fifth.action, DecisionAction::Wait);
        assert!(fifth.forced);
        assert!(fifth.reasoning.contains("send_message"));
    }

    #[tokio::test]
    async fn send_message_reaches_the_session() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        harness
            .reasoner
            .push_decision(r#"{"action": "send_message", "reasoning": "nudge", "message": "run the tests"}"#);

        orch.scheduler.decide("w1").await.expect("decide");
        assert_eq!(
            harness.worker.executed(),
            vec![("w1".to_string(), "run the tests".to_string())]
        );
        let instance = orch.registry.require("w1").expect("w1");
        assert_eq!(instance.messages[0].role, MessageRole::Orchestrator);
    }

    #[tokio::test]
    async fn failed_helper_submit_leaves_no_registration() {
        let harness = Harness::new(vec![ScriptedSession::rejected("sandbox quota")]);
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        harness
            .reasoner
            .push_decision(r#"{"action": "create_instance", "message": "write docs"}"#);

        let decision = orch.scheduler.decide("w1").await.expect("decide").expect("decision");
        assert_eq!(decision.action, DecisionAction::CreateInstance);
        assert_eq!(orch.registry.len(), 1);
        let log = orch.registry.require("w1").expect("w1").log;
        assert!(log.iter().any(|e| e.message.contains("sandbox quota")));
    }

    #[tokio::test]
    async fn helper_is_linked_to_its_parent() {
        let harness = Harness::new(vec![ScriptedSession::running_forever()]);
        let orch = orchestrator(&harness, 0);
        register_worker(&orch, &harness, "w1");
        harness
            .reasoner
            .push_decision(r#"{"action": "create_instance", "message": "write docs"}"#);

        orch.scheduler.decide("w1").await.expect("decide");
        let related = orch.registry.get_related("w1").expect("related");
        assert_eq!(related.children.len(), 1);
        let helper = &related.children[0];
        assert_eq!(helper.kind, InstanceKind::Helper);
        assert_eq!(helper.session_id.as_deref(), Some("session-1"));
        assert!(
            harness
                .worker
                .executed()
                .contains(&("session-1".to_string(), "write docs".to_string()))
        );
    }

    #[tokio::test]
    async fn decompose_breaks_down_the_draft_and_forwards_the_plan() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        let draft = orch
            .entities
            .create_draft(DRAFT_CONTENT, "parser")
            .expect("draft");
        orch.entities.validate(&draft.id).expect("validate");
        harness.worker.attach("w1", ScriptedSession::running_forever());
        orch.registry
            .register(
                "w1",
                Registration {
                    metadata: BTreeMap::from([("draft_id".to_string(), draft.id.clone())]),
                    ..Registration::default()
                },
            )
            .expect("register");
        harness.reasoner.push_plan(&plan_json(2));
        harness
            .reasoner
            .push_decision(r#"{"action": "decompose_task"}"#);

        orch.scheduler.decide("w1").await.expect("decide");
        let instance = orch.registry.require("w1").expect("w1");
        let task_id = instance.task_id.expect("task linked");
        assert_eq!(orch.entities.task_checkpoints(&task_id).expect("cps").len(), 2);
        let executed = harness.worker.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].1.contains("step 0"));
    }

    #[tokio::test]
    async fn errored_session_moves_instance_to_errored() {
        let harness = Harness::new(Vec::new());
        let orch = orchestrator(&harness, 0);
        harness
            .worker
            .attach("w1", ScriptedSession::errored("sandbox crashed"));
        orch.registry
            .register("w1", Registration::default())
            .expect("register");
        harness.worker.attach("w2", ScriptedSession::unreachable("connection refused"));
        orch.registry
            .register("w2", Registration::default())
            .expect("register");

        let report = orch.scheduler.poll_once().await;
        assert_eq!(report.observed, 2);
        assert!(report.errors.contains_key("w2"));
        assert_eq!(
            orch.registry.require("w1").expect("w1").status,
            InstanceStatus::Errored
        );
        assert_eq!(
            orch.registry.require("w2").expect("w2").status,
            InstanceStatus::Active
        );
    }
}

//! Instance registry and capacity governor.
//!
//! A single `RwLock`-guarded table of instances, written through to an
//! instance repository. Every read-modify-write happens under the write
//! lock, so registration, the cleanup sweep and the decision engine can run
//! concurrently without lost updates. No lock is held across an `.await`.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::core::lifecycle::check_instance_status;
use crate::core::sanitize::{sanitize_metadata, sanitize_text};
use crate::core::types::{
    Heartbeat, Instance, InstanceKind, InstanceMessage, InstanceStatus, LogEntry, LogLevel,
    MessageRole, Timestamp, push_bounded,
};
use crate::error::{Error, Result};
use crate::events::{EventBus, OrchestratorEvent};
use crate::io::config::RegistryConfig;
use crate::io::store::Repository;

/// Caller-supplied registration details. Everything is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    pub kind: Option<InstanceKind>,
    pub parent_id: Option<String>,
    pub task_id: Option<String>,
    pub checkpoint_id: Option<String>,
    /// Worker session; defaults to the instance id for worker kinds.
    pub session_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Related {
    pub parent: Option<Instance>,
    pub children: Vec<Instance>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepReason {
    Idle,
    TerminalGraceElapsed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptInstance {
    pub id: String,
    pub reason: SweepReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Slow,
    Stalled,
    Paused,
    Finished,
}

const MAX_ID_CHARS: usize = 128;
const SLOW_AFTER_SECS: i64 = 5 * 60;
const STALLED_AFTER_SECS: i64 = 15 * 60;

pub fn health(instance: &Instance, now: Timestamp) -> Health {
    if instance.status.is_finished() {
        return Health::Finished;
    }
    if instance.status == InstanceStatus::Paused {
        return Health::Paused;
    }
    let idle = (now - instance.last_activity).num_seconds();
    if idle < SLOW_AFTER_SECS {
        Health::Healthy
    } else if idle < STALLED_AFTER_SECS {
        Health::Slow
    } else {
        Health::Stalled
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub id: String,
    pub kind: InstanceKind,
    pub status: InstanceStatus,
    pub health: Health,
    pub idle_secs: i64,
    pub decision_count: u32,
    pub checkpoint_id: Option<String>,
    pub checkpoint_index: usize,
    pub last_heartbeat: Option<Heartbeat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub total: usize,
    pub capacity: usize,
    pub by_status: BTreeMap<String, usize>,
    pub instances: Vec<InstanceSummary>,
}

pub struct InstanceRegistry {
    table: RwLock<BTreeMap<String, Instance>>,
    store: Arc<dyn Repository<Instance>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl InstanceRegistry {
    /// Build a registry, loading any instances already in `store`.
    pub fn new(
        store: Arc<dyn Repository<Instance>>,
        config: RegistryConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let table = store
            .list()
            .into_iter()
            .map(|instance| (instance.id.clone(), instance))
            .collect::<BTreeMap<_, _>>();
        debug!(count = table.len(), "registry loaded");
        Self {
            table: RwLock::new(table),
            store,
            config,
            clock,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Register a new instance. Fails fast when the number of live
    /// (not finished) instances has reached `max_instances`.
    #[instrument(skip_all, fields(instance_id = %id))]
    pub fn register(&self, id: &str, registration: Registration) -> Result<Instance> {
        let id = sanitize_text(id, MAX_ID_CHARS);
        if id.is_empty() || id.contains(['/', '\\']) {
            return Err(Error::validation("instance id must be a non-empty plain name"));
        }
        let kind = registration.kind.unwrap_or(InstanceKind::Worker);
        let now = self.clock.now();

        let instance = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            if table.contains_key(&id) {
                return Err(Error::validation(format!("instance '{id}' is already registered")));
            }
            let live = table.values().filter(|i| !i.status.is_finished()).count();
            if live >= self.config.max_instances {
                warn!(live, limit = self.config.max_instances, "registration refused");
                return Err(Error::CapacityExceeded {
                    limit: self.config.max_instances,
                });
            }
            if kind == InstanceKind::Checkpoint
                && let Some(checkpoint_id) = &registration.checkpoint_id
                && let Some(existing) = table.values().find(|i| {
                    i.kind == InstanceKind::Checkpoint
                        && i.checkpoint_id.as_ref() == Some(checkpoint_id)
                        && !i.status.is_finished()
                })
            {
                return Err(Error::validation(format!(
                    "checkpoint '{}' already has live instance '{}'",
                    checkpoint_id, existing.id
                )));
            }

            let session_id = registration.session_id.or_else(|| {
                matches!(kind, InstanceKind::Worker).then(|| id.clone())
            });
            let instance = Instance {
                id: id.clone(),
                kind,
                parent_id: registration.parent_id,
                task_id: registration.task_id,
                checkpoint_id: registration.checkpoint_id,
                session_id,
                status: InstanceStatus::Active,
                decision_count: 0,
                created_at: now,
                last_activity: now,
                status_changed_at: now,
                last_decision_at: None,
                checkpoint_index: 0,
                messages: Vec::new(),
                heartbeats: Vec::new(),
                decisions: Vec::new(),
                log: Vec::new(),
                repeating_pattern: false,
                metadata: sanitize_metadata(&registration.metadata, self.config.metadata_limits()),
            };
            self.store.put(&instance)?;
            table.insert(id.clone(), instance.clone());
            instance
        };

        info!(kind = ?instance.kind, "instance registered");
        self.events.emit(OrchestratorEvent::InstanceRegistered {
            instance_id: instance.id.clone(),
        });
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<Instance> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Instance> {
        self.get(id).ok_or_else(|| Error::not_found("instance", id))
    }

    pub fn list(&self) -> Vec<Instance> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to a copy of the instance, persist it, then commit.
    ///
    /// If `f` fails or the write fails, the stored instance is unchanged.
    /// Status changes are validated and stamped.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Instance) -> Result<R>) -> Result<R> {
        let now = self.clock.now();
        let (result, status_change) = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let current = table.get(id).ok_or_else(|| Error::not_found("instance", id))?;
            let mut next = current.clone();
            let result = f(&mut next)?;
            let status_change = (next.status != current.status).then_some(next.status);
            if let Some(status) = status_change {
                check_instance_status(current.status, status)?;
                next.status_changed_at = now;
            }
            self.store.put(&next)?;
            table.insert(id.to_string(), next);
            (result, status_change)
        };
        if let Some(status) = status_change {
            debug!(instance_id = %id, status = status.as_str(), "instance status changed");
            self.events.emit(OrchestratorEvent::InstanceStatusChanged {
                instance_id: id.to_string(),
                status,
            });
        }
        Ok(result)
    }

    pub fn set_status(&self, id: &str, status: InstanceStatus) -> Result<Instance> {
        let now = self.clock.now();
        self.update(id, |instance| {
            instance.status = status;
            instance.last_activity = now;
            Ok(instance.clone())
        })
    }

    pub fn record_heartbeat(&self, id: &str, heartbeat: Heartbeat) -> Result<()> {
        let limit = self.config.heartbeat_limit;
        let now = self.clock.now();
        self.update(id, |instance| {
            push_bounded(&mut instance.heartbeats, heartbeat, limit);
            instance.last_activity = now;
            Ok(())
        })
    }

    pub fn append_message(&self, id: &str, role: MessageRole, text: &str) -> Result<()> {
        let limit = self.config.message_limit;
        let text: String = text.chars().take(self.config.message_chars).collect();
        let now = self.clock.now();
        self.update(id, |instance| {
            push_bounded(
                &mut instance.messages,
                InstanceMessage { role, text, at: now },
                limit,
            );
            instance.last_activity = now;
            Ok(())
        })
    }

    pub fn log(&self, id: &str, level: LogLevel, message: impl Into<String>) -> Result<()> {
        let limit = self.config.log_limit;
        let entry = LogEntry {
            at: self.clock.now(),
            level,
            message: message.into(),
        };
        self.update(id, |instance| {
            push_bounded(&mut instance.log, entry, limit);
            Ok(())
        })
    }

    /// Parent and children of `id`. Pure lookup.
    pub fn get_related(&self, id: &str) -> Result<Related> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let instance = table.get(id).ok_or_else(|| Error::not_found("instance", id))?;
        let parent = instance
            .parent_id
            .as_ref()
            .and_then(|parent_id| table.get(parent_id))
            .cloned();
        let children = table
            .values()
            .filter(|i| i.parent_id.as_deref() == Some(id))
            .cloned()
            .collect();
        Ok(Related { parent, children })
    }

    pub fn active_for_checkpoint(&self, checkpoint_id: &str) -> Option<Instance> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .values()
            .find(|i| {
                i.kind == InstanceKind::Checkpoint
                    && i.checkpoint_id.as_deref() == Some(checkpoint_id)
                    && !i.status.is_finished()
            })
            .cloned()
    }

    /// Control instance driving `task_id`, if one is live.
    pub fn live_for_task(&self, task_id: &str) -> Option<Instance> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table
            .values()
            .find(|i| {
                i.kind == InstanceKind::Task
                    && i.task_id.as_deref() == Some(task_id)
                    && !i.status.is_finished()
            })
            .cloned()
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        self.store.remove(id)?;
        Ok(table.remove(id).is_some())
    }

    /// Remove idle instances and finished ones past the grace window.
    ///
    /// Paused instances are exempt from the idle TTL so a pause never loses
    /// its position.
    pub fn sweep(&self) -> Vec<SweptInstance> {
        let now = self.clock.now();
        let idle_ttl = Duration::seconds(self.config.idle_ttl_secs as i64);
        let grace = Duration::seconds(self.config.terminal_grace_secs as i64);

        let swept = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<SweptInstance> = table
                .values()
                .filter_map(|instance| {
                    let reason = if instance.status.is_terminal()
                        && now - instance.status_changed_at > grace
                    {
                        SweepReason::TerminalGraceElapsed
                    } else if instance.status != InstanceStatus::Paused
                        && now - instance.last_activity > idle_ttl
                    {
                        SweepReason::Idle
                    } else {
                        return None;
                    };
                    Some(SweptInstance {
                        id: instance.id.clone(),
                        reason,
                    })
                })
                .collect();

            let mut removed = Vec::with_capacity(expired.len());
            for entry in expired {
                if let Err(err) = self.store.remove(&entry.id) {
                    warn!(instance_id = %entry.id, error = %format!("{err:#}"), "sweep could not remove instance");
                    continue;
                }
                table.remove(&entry.id);
                removed.push(entry);
            }
            removed
        };

        for entry in &swept {
            info!(instance_id = %entry.id, reason = ?entry.reason, "instance swept");
            self.events.emit(OrchestratorEvent::InstanceSwept {
                instance_id: entry.id.clone(),
                reason: format!("{:?}", entry.reason).to_lowercase(),
            });
        }
        swept
    }

    pub fn dashboard(&self) -> Dashboard {
        let now = self.clock.now();
        let instances = self.list();
        let mut by_status = BTreeMap::new();
        for instance in &instances {
            *by_status
                .entry(instance.status.as_str().to_string())
                .or_insert(0) += 1;
        }
        let summaries = instances
            .iter()
            .map(|instance| InstanceSummary {
                id: instance.id.clone(),
                kind: instance.kind,
                status: instance.status,
                health: health(instance, now),
                idle_secs: (now - instance.last_activity).num_seconds(),
                decision_count: instance.decision_count,
                checkpoint_id: instance.checkpoint_id.clone(),
                checkpoint_index: instance.checkpoint_index,
                last_heartbeat: instance.heartbeats.last().cloned(),
            })
            .collect();
        Dashboard {
            total: instances.len(),
            capacity: self.config.max_instances,
            by_status,
            instances: summaries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::MemoryRepository;
    use crate::test_support::ManualClock;

    fn registry(max_instances: usize) -> (InstanceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = RegistryConfig {
            max_instances,
            idle_ttl_secs: 600,
            terminal_grace_secs: 60,
            heartbeat_limit: 3,
            ..RegistryConfig::default()
        };
        let registry = InstanceRegistry::new(
            Arc::new(MemoryRepository::new()),
            config,
            clock.clone(),
            EventBus::default(),
        );
        (registry, clock)
    }

    #[test]
    fn registration_beyond_capacity_fails_fast() {
        let (registry, _) = registry(2);
        registry.register("a", Registration::default()).expect("a");
        registry.register("b", Registration::default()).expect("b");
        let err = registry.register("c", Registration::default()).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 2 }));
        assert_eq!(registry.len(), 2);
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn finished_instances_free_capacity() {
        let (registry, _) = registry(1);
        registry.register("a", Registration::default()).expect("a");
        registry.set_status("a", InstanceStatus::Completed).expect("complete");
        registry.register("b", Registration::default()).expect("b");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let (registry, _) = registry(5);
        registry.register("a", Registration::default()).expect("a");
        assert!(matches!(
            registry.register("a", Registration::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn second_live_instance_for_a_checkpoint_is_rejected() {
        let (registry, _) = registry(5);
        let registration = Registration {
            kind: Some(InstanceKind::Checkpoint),
            checkpoint_id: Some("cp-1".to_string()),
            ..Registration::default()
        };
        registry.register("a", registration.clone()).expect("a");
        assert!(registry.register("b", registration.clone()).is_err());
        registry.set_status("a", InstanceStatus::Errored).expect("errored");
        registry.register("b", registration).expect("b after a finished");
    }

    #[test]
    fn metadata_is_sanitized() {
        let (registry, _) = registry(5);
        let long = "x".repeat(1_000);
        let instance = registry
            .register(
                "a",
                Registration {
                    metadata: BTreeMap::from([("note".to_string(), long)]),
                    ..Registration::default()
                },
            )
            .expect("a");
        assert_eq!(
            instance.metadata["note"].chars().count(),
            RegistryConfig::default().metadata_value_chars
        );
    }

    #[test]
    fn heartbeats_keep_only_the_latest() {
        let (registry, _) = registry(5);
        registry.register("a", Registration::default()).expect("a");
        for n in 0..5 {
            registry
                .record_heartbeat(
                    "a",
                    Heartbeat {
                        at: registry.now(),
                        checkpoint_id: None,
                        status: format!("beat {n}"),
                        message: None,
                    },
                )
                .expect("heartbeat");
        }
        let instance = registry.get("a").expect("a");
        assert_eq!(instance.heartbeats.len(), 3);
        assert_eq!(instance.heartbeats[0].status, "beat 2");
    }

    #[test]
    fn related_returns_parent_and_children() {
        let (registry, _) = registry(5);
        registry.register("root", Registration::default()).expect("root");
        for child in ["c1", "c2"] {
            registry
                .register(
                    child,
                    Registration {
                        parent_id: Some("root".to_string()),
                        ..Registration::default()
                    },
                )
                .expect("child");
        }
        let related = registry.get_related("root").expect("related");
        assert!(related.parent.is_none());
        assert_eq!(related.children.len(), 2);
        let related = registry.get_related("c1").expect("related");
        assert_eq!(related.parent.map(|p| p.id), Some("root".to_string()));
    }

    #[test]
    fn sweep_removes_idle_and_expired_terminal_instances() {
        let (registry, clock) = registry(5);
        registry.register("idle", Registration::default()).expect("idle");
        registry.register("paused", Registration::default()).expect("paused");
        registry.set_status("paused", InstanceStatus::Paused).expect("pause");
        registry.register("done", Registration::default()).expect("done");

        clock.advance_secs(30);
        registry.set_status("done", InstanceStatus::Completed).expect("complete");
        registry.register("fresh", Registration::default()).expect("fresh");

        clock.advance_secs(61);
        let swept = registry.sweep();
        assert_eq!(
            swept,
            vec![SweptInstance {
                id: "done".to_string(),
                reason: SweepReason::TerminalGraceElapsed
            }]
        );

        clock.advance_secs(600);
        let mut swept: Vec<String> = registry.sweep().into_iter().map(|s| s.id).collect();
        swept.sort();
        assert_eq!(swept, vec!["fresh".to_string(), "idle".to_string()]);
        assert!(registry.get("paused").is_some());
    }

    #[test]
    fn completed_instance_cannot_be_reactivated() {
        let (registry, _) = registry(5);
        registry.register("a", Registration::default()).expect("a");
        registry.set_status("a", InstanceStatus::Completed).expect("complete");
        let err = registry.set_status("a", InstanceStatus::Active).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(registry.get("a").map(|i| i.status), Some(InstanceStatus::Completed));
    }

    #[test]
    fn dashboard_reports_health() {
        let (registry, clock) = registry(5);
        registry.register("a", Registration::default()).expect("a");
        clock.advance_secs(6 * 60);
        registry.register("b", Registration::default()).expect("b");
        let dashboard = registry.dashboard();
        assert_eq!(dashboard.total, 2);
        assert_eq!(dashboard.by_status["active"], 2);
        let a = dashboard.instances.iter().find(|i| i.id == "a").expect("a");
        assert_eq!(a.health, Health::Slow);
        let b = dashboard.instances.iter().find(|i| i.id == "b").expect("b");
        assert_eq!(b.health, Health::Healthy);
    }
}

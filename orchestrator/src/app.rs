//! Wiring: collaborators, repositories and components assembled into one
//! orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::background::BackgroundTask;
use crate::clock::{Clock, SystemClock};
use crate::core::types::Instance;
use crate::entities::{EntityRepositories, EntityStore};
use crate::escalation::Escalator;
use crate::events::EventBus;
use crate::io::config::OrchestratorConfig;
use crate::io::journal::AttemptJournal;
use crate::io::paths::StatePaths;
use crate::io::prompt::PromptRenderer;
use crate::io::reasoner::{HttpReasoner, Reasoner};
use crate::io::store::{JsonRepository, MemoryRepository, Repository};
use crate::io::tracker::{FileIssueTracker, IssueTracker};
use crate::io::worker::{ExecutionWorker, HttpWorker, ResilientWorker};
use crate::isolation::IsolationExecutor;
use crate::registry::InstanceRegistry;
use crate::scheduler::DecisionEngine;
use crate::supervisor::TaskSupervisor;

/// External systems the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub worker: Arc<dyn ExecutionWorker>,
    pub reasoner: Arc<dyn Reasoner>,
    pub tracker: Arc<dyn IssueTracker>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// HTTP worker (with transient retry and circuit breaker), HTTP
    /// reasoner and file-backed tickets under the state directory.
    pub fn http(config: &OrchestratorConfig, paths: &StatePaths) -> Result<Self> {
        let worker = HttpWorker::new(&config.worker).context("build worker client")?;
        let reasoner = HttpReasoner::new(&config.reasoner).context("build reasoner client")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let tracker = FileIssueTracker::open(&paths.tickets_dir, clock.clone())?;
        Ok(Self {
            worker: Arc::new(ResilientWorker::new(Arc::new(worker), &config.execution)),
            reasoner: Arc::new(reasoner),
            tracker: Arc::new(tracker),
            clock,
        })
    }
}

struct Stores {
    entities: EntityRepositories,
    instances: Arc<dyn Repository<Instance>>,
    journal: Option<AttemptJournal>,
}

pub struct Orchestrator {
    pub config: OrchestratorConfig,
    pub events: EventBus,
    pub registry: Arc<InstanceRegistry>,
    pub entities: Arc<EntityStore>,
    pub supervisor: Arc<TaskSupervisor>,
    pub scheduler: Arc<DecisionEngine>,
}

impl Orchestrator {
    /// Everything in memory, nothing journaled. Used by tests.
    pub fn in_memory(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let stores = Stores {
            entities: EntityRepositories {
                drafts: Arc::new(MemoryRepository::new()),
                tasks: Arc::new(MemoryRepository::new()),
                checkpoints: Arc::new(MemoryRepository::new()),
            },
            instances: Arc::new(MemoryRepository::new()),
            journal: None,
        };
        Self::assemble(config, collaborators, stores)
    }

    /// Durable orchestrator over the state directory. Previously persisted
    /// entities and instances are loaded.
    pub fn open(
        paths: &StatePaths,
        config: OrchestratorConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let stores = Stores {
            entities: EntityRepositories {
                drafts: Arc::new(JsonRepository::open(&paths.drafts_dir)?),
                tasks: Arc::new(JsonRepository::open(&paths.tasks_dir)?),
                checkpoints: Arc::new(JsonRepository::open(&paths.checkpoints_dir)?),
            },
            instances: Arc::new(JsonRepository::open(&paths.instances_dir)?),
            journal: Some(AttemptJournal::new(
                &paths.attempts_dir,
                config.execution.output_limit_bytes,
            )),
        };
        let orchestrator = Self::assemble(config, collaborators, stores);
        info!(
            state_dir = %paths.state_dir.display(),
            instances = orchestrator.registry.len(),
            "orchestrator opened"
        );
        Ok(orchestrator)
    }

    fn assemble(config: OrchestratorConfig, collaborators: Collaborators, stores: Stores) -> Self {
        let events = EventBus::default();
        let prompts = Arc::new(PromptRenderer::new());
        let registry = Arc::new(InstanceRegistry::new(
            stores.instances,
            config.registry.clone(),
            collaborators.clock.clone(),
            events.clone(),
        ));
        let entities = Arc::new(EntityStore::new(
            stores.entities,
            collaborators.reasoner.clone(),
            prompts.clone(),
            config.validation.clone(),
            config.execution.clone(),
            collaborators.clock.clone(),
        ));
        let executor = IsolationExecutor::new(
            registry.clone(),
            collaborators.worker.clone(),
            prompts.clone(),
            stores.journal,
            config.execution.clone(),
        );
        let escalator = Arc::new(Escalator::new(
            collaborators.tracker.clone(),
            config.escalation.clone(),
            events.clone(),
        ));
        let supervisor = Arc::new(TaskSupervisor::new(
            entities.clone(),
            registry.clone(),
            executor,
            escalator,
            events.clone(),
            Duration::from_millis(config.execution.retry_delay_ms),
        ));
        let scheduler = Arc::new(DecisionEngine::new(
            registry.clone(),
            collaborators.worker,
            collaborators.reasoner,
            prompts,
            entities.clone(),
            supervisor.clone(),
            config.scheduler.clone(),
            events.clone(),
        ));
        Self {
            config,
            events,
            registry,
            entities,
            supervisor,
            scheduler,
        }
    }

    /// Start the cleanup sweep and the scheduler poll loop.
    pub fn spawn_background(&self) -> Vec<BackgroundTask> {
        let registry = self.registry.clone();
        let sweep = BackgroundTask::spawn_periodic(
            "sweep",
            Duration::from_secs(self.config.registry.sweep_interval_secs),
            move || {
                let registry = registry.clone();
                async move {
                    let swept = registry.sweep();
                    if !swept.is_empty() {
                        info!(count = swept.len(), "sweep removed instances");
                    }
                }
            },
        );

        let scheduler = self.scheduler.clone();
        let poll = BackgroundTask::spawn_periodic(
            "scheduler",
            Duration::from_millis(self.config.scheduler.poll_interval_ms),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    let report = scheduler.poll_once().await;
                    if !report.errors.is_empty() {
                        warn!(errors = report.errors.len(), "scheduler tick had errors");
                    }
                }
            },
        );
        vec![sweep, poll]
    }
}

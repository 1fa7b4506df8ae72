//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::files::write_atomic;
use crate::core::retry::Backoff;
use crate::core::sanitize::MetadataLimits;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values
/// the orchestrator has always run with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub execution: ExecutionConfig,
    pub escalation: EscalationConfig,
    pub validation: ValidationConfig,
    pub worker: EndpointConfig,
    pub reasoner: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Registrations beyond this count fail fast.
    pub max_instances: usize,
    /// Instances idle longer than this are swept.
    pub idle_ttl_secs: u64,
    /// Completed/errored instances are swept after this long.
    pub terminal_grace_secs: u64,
    pub sweep_interval_secs: u64,
    pub metadata_max_keys: usize,
    pub metadata_key_chars: usize,
    pub metadata_value_chars: usize,
    pub heartbeat_limit: usize,
    pub message_limit: usize,
    pub message_chars: usize,
    pub log_limit: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_instances: 10,
            idle_ttl_secs: 30 * 60,
            terminal_grace_secs: 5 * 60,
            sweep_interval_secs: 60,
            metadata_max_keys: 32,
            metadata_key_chars: 64,
            metadata_value_chars: 256,
            heartbeat_limit: 100,
            message_limit: 500,
            message_chars: 20_000,
            log_limit: 200,
        }
    }
}

impl RegistryConfig {
    pub fn metadata_limits(&self) -> MetadataLimits {
        MetadataLimits {
            max_keys: self.metadata_max_keys,
            max_key_chars: self.metadata_key_chars,
            max_value_chars: self.metadata_value_chars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// Minimum spacing between two decisions for the same instance.
    pub decision_cooldown_ms: u64,
    /// Reaching this many decisions forces an escalation.
    pub max_decisions_per_instance: u32,
    pub decision_history_limit: usize,
    /// Most recent messages handed to the reasoning collaborator.
    pub context_messages: usize,
    pub context_budget_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            decision_cooldown_ms: 30_000,
            max_decisions_per_instance: 50,
            decision_history_limit: 100,
            context_messages: 10,
            context_budget_bytes: 16_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    pub poll_interval_ms: u64,
    /// Status polls per attempt before the attempt times out.
    pub poll_max_attempts: u32,
    pub default_max_retries: u32,
    /// Pause before a retry attempt starts.
    pub retry_delay_ms: u64,
    pub transient_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub breaker_threshold: u32,
    pub breaker_cool_down_secs: u64,
    pub checkpoint_log_limit: usize,
    /// Truncate journaled attempt output beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            poll_max_attempts: 360,
            default_max_retries: 3,
            retry_delay_ms: 2_000,
            transient_retries: 3,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 30_000,
            breaker_threshold: 5,
            breaker_cool_down_secs: 60,
            checkpoint_log_limit: 200,
            output_limit_bytes: 200_000,
        }
    }
}

impl ExecutionConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EscalationConfig {
    /// Log lines copied into an escalation ticket.
    pub log_tail_lines: usize,
    pub labels: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            log_tail_lines: 20,
            labels: vec!["needs-human-review".to_string(), "escalated".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Headings a draft must contain to validate.
    pub required_sections: Vec<String>,
    pub max_content_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_sections: vec![
                "## Task:".to_string(),
                "## Acceptance Criteria:".to_string(),
                "## Technical Details:".to_string(),
            ],
            max_content_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("registry.max_instances", self.registry.max_instances as u64),
            ("registry.sweep_interval_secs", self.registry.sweep_interval_secs),
            ("registry.idle_ttl_secs", self.registry.idle_ttl_secs),
            ("registry.heartbeat_limit", self.registry.heartbeat_limit as u64),
            ("registry.message_limit", self.registry.message_limit as u64),
            ("registry.log_limit", self.registry.log_limit as u64),
            ("scheduler.poll_interval_ms", self.scheduler.poll_interval_ms),
            (
                "scheduler.max_decisions_per_instance",
                u64::from(self.scheduler.max_decisions_per_instance),
            ),
            (
                "scheduler.decision_history_limit",
                self.scheduler.decision_history_limit as u64,
            ),
            ("scheduler.context_messages", self.scheduler.context_messages as u64),
            (
                "scheduler.context_budget_bytes",
                self.scheduler.context_budget_bytes as u64,
            ),
            ("execution.poll_max_attempts", u64::from(self.execution.poll_max_attempts)),
            (
                "execution.default_max_retries",
                u64::from(self.execution.default_max_retries),
            ),
            (
                "execution.checkpoint_log_limit",
                self.execution.checkpoint_log_limit as u64,
            ),
            ("execution.output_limit_bytes", self.execution.output_limit_bytes as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.execution.backoff_initial_ms > self.execution.backoff_max_ms {
            return Err(anyhow!(
                "execution.backoff_initial_ms must not exceed execution.backoff_max_ms"
            ));
        }
        for (name, endpoint) in [("worker", &self.worker), ("reasoner", &self.reasoner)] {
            if endpoint.base_url.trim().is_empty() {
                return Err(anyhow!("{name}.base_url must be non-empty"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

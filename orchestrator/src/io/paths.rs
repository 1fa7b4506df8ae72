//! Canonical layout of the `.orchestrator/` state directory.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::config::{OrchestratorConfig, write_config};

/// All canonical paths within `.orchestrator/` for a project root.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub drafts_dir: PathBuf,
    pub tasks_dir: PathBuf,
    pub checkpoints_dir: PathBuf,
    pub instances_dir: PathBuf,
    pub tickets_dir: PathBuf,
    pub attempts_dir: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            config_path: state_dir.join("config.toml"),
            drafts_dir: state_dir.join("drafts"),
            tasks_dir: state_dir.join("tasks"),
            checkpoints_dir: state_dir.join("checkpoints"),
            instances_dir: state_dir.join("instances"),
            tickets_dir: state_dir.join("tickets"),
            attempts_dir: state_dir.join("attempts"),
        }
    }

    fn entity_dirs(&self) -> [&PathBuf; 6] {
        [
            &self.drafts_dir,
            &self.tasks_dir,
            &self.checkpoints_dir,
            &self.instances_dir,
            &self.tickets_dir,
            &self.attempts_dir,
        ]
    }
}

/// Create the state directory tree and a default config.
///
/// Existing config is kept unless `force` is set. Returns whether the config
/// file was written.
pub fn init_state(paths: &StatePaths, force: bool) -> Result<bool> {
    for dir in paths.entity_dirs() {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    if paths.config_path.exists() && !force {
        return Ok(false);
    }
    write_config(&paths.config_path, &OrchestratorConfig::default())?;
    Ok(true)
}

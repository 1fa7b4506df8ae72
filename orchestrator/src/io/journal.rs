//! Attempt journal under `.orchestrator/attempts/<checkpoint>/<attempt>/`.
//!
//! Product artifacts, always written when a journal is configured and
//! independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::core::types::Timestamp;
use crate::io::files::write_json;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub checkpoint_id: String,
    pub attempt: u32,
    pub instance_id: String,
    pub session_id: Option<String>,
    pub passed: bool,
    pub failure: Option<String>,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub output_path: PathBuf,
    pub verification_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempts_dir: &Path, checkpoint_id: &str, attempt: u32) -> Self {
        let dir = attempts_dir.join(checkpoint_id).join(attempt.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            output_path: dir.join("output.log"),
            verification_path: dir.join("verification.json"),
            dir,
        }
    }
}

pub struct AttemptRecord<'a, V: Serialize> {
    pub meta: &'a AttemptMeta,
    pub output: &'a str,
    pub verification: Option<&'a V>,
}

#[derive(Debug, Clone)]
pub struct AttemptJournal {
    attempts_dir: PathBuf,
    output_limit_bytes: usize,
}

impl AttemptJournal {
    pub fn new(attempts_dir: impl Into<PathBuf>, output_limit_bytes: usize) -> Self {
        Self {
            attempts_dir: attempts_dir.into(),
            output_limit_bytes,
        }
    }

    pub fn write<V: Serialize>(&self, record: &AttemptRecord<'_, V>) -> Result<AttemptPaths> {
        let paths = AttemptPaths::new(
            &self.attempts_dir,
            &record.meta.checkpoint_id,
            record.meta.attempt,
        );
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

        write_json(&paths.meta_path, record.meta)?;
        let output = truncate_output(record.output, self.output_limit_bytes);
        fs::write(&paths.output_path, output.as_ref())
            .with_context(|| format!("write {}", paths.output_path.display()))?;
        if let Some(verification) = record.verification {
            write_json(&paths.verification_path, verification)?;
        }
        Ok(paths)
    }
}

/// Keep the first `limit` bytes (on a char boundary) and note the cut.
fn truncate_output(output: &str, limit: usize) -> std::borrow::Cow<'_, str> {
    if output.len() <= limit {
        return output.into();
    }
    let mut cut = limit;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[output truncated: {} of {} bytes kept]\n",
        &output[..cut],
        cut,
        output.len()
    )
    .into()
}

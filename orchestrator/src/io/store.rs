//! Entity persistence.
//!
//! Every record is one JSON document at `<dir>/<id>/<kind>.json`. The
//! in-memory map is the read path; writes go to disk first (atomically) and
//! then update the map, so a failed write never leaves memory ahead of disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::files::write_json;
use crate::core::types::{Checkpoint, Draft, Instance, Task};

/// A record that can be stored in a [`Repository`].
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// File stem of the stored document (`draft` → `draft.json`).
    const KIND: &'static str;

    fn id(&self) -> &str;
}

impl Document for Draft {
    const KIND: &'static str = "draft";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for Task {
    const KIND: &'static str = "task";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for Checkpoint {
    const KIND: &'static str = "checkpoint";
    fn id(&self) -> &str {
        &self.id
    }
}

impl Document for Instance {
    const KIND: &'static str = "instance";
    fn id(&self) -> &str {
        &self.id
    }
}

pub trait Repository<T: Document>: Send + Sync {
    fn get(&self, id: &str) -> Option<T>;
    /// All documents ordered by id.
    fn list(&self) -> Vec<T>;
    fn put(&self, doc: &T) -> Result<()>;
    /// Returns whether a document was removed.
    fn remove(&self, id: &str) -> Result<bool>;
}

pub struct MemoryRepository<T> {
    docs: RwLock<BTreeMap<String, T>>,
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: Document> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_docs(docs: BTreeMap<String, T>) -> Self {
        Self {
            docs: RwLock::new(docs),
        }
    }
}

impl<T: Document> Repository<T> for MemoryRepository<T> {
    fn get(&self, id: &str) -> Option<T> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.get(id).cloned()
    }

    fn list(&self) -> Vec<T> {
        let docs = self.docs.read().unwrap_or_else(PoisonError::into_inner);
        docs.values().cloned().collect()
    }

    fn put(&self, doc: &T) -> Result<()> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        docs.insert(doc.id().to_string(), doc.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let mut docs = self.docs.write().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.remove(id).is_some())
    }
}

/// Write-through JSON directory repository.
pub struct JsonRepository<T> {
    dir: PathBuf,
    cache: MemoryRepository<T>,
}

impl<T: Document> JsonRepository<T> {
    /// Open `dir`, loading every existing document into memory.
    ///
    /// Directories without a readable document are skipped with a warning;
    /// a document that fails to parse is an error.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;

        let mut docs = BTreeMap::new();
        let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let doc_path = document_path::<T>(&path);
            if !doc_path.is_file() {
                warn!(path = %path.display(), kind = T::KIND, "skipping directory without document");
                continue;
            }
            let doc: T = read_document(&doc_path)?;
            docs.insert(doc.id().to_string(), doc);
        }
        debug!(dir = %dir.display(), kind = T::KIND, count = docs.len(), "repository loaded");

        Ok(Self {
            dir,
            cache: MemoryRepository::with_docs(docs),
        })
    }

    fn doc_dir(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(anyhow!("invalid {} id '{}'", T::KIND, id));
        }
        Ok(self.dir.join(id))
    }
}

fn document_path<T: Document>(doc_dir: &Path) -> PathBuf {
    doc_dir.join(format!("{}.json", T::KIND))
}

fn read_document<T: Document>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

impl<T: Document> Repository<T> for JsonRepository<T> {
    fn get(&self, id: &str) -> Option<T> {
        self.cache.get(id)
    }

    fn list(&self) -> Vec<T> {
        self.cache.list()
    }

    fn put(&self, doc: &T) -> Result<()> {
        let path = document_path::<T>(&self.doc_dir(doc.id())?);
        write_json(&path, doc)?;
        self.cache.put(doc)
    }

    fn remove(&self, id: &str) -> Result<bool> {
        let dir = self.doc_dir(id)?;
        if dir.exists() {
            fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        }
        self.cache.remove(id)
    }
}

//! Durable state
//!
//! The whole aggregate (instances, templates, resource table) is loaded once
//! at startup and saved after every mutation. The JSON store writes to a
//! sibling temp file and renames it into place so a crash mid-save leaves the
//! previous snapshot intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::manager::state::{Instance, Template};
use crate::resources::ResourceTable;

/// Everything that survives a daemon restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    #[serde(default)]
    pub templates: BTreeMap<String, Template>,
    #[serde(flatten)]
    pub table: ResourceTable,
}

impl State {
    /// Fresh state with the built-in resource types
    pub fn seeded() -> Self {
        Self {
            table: ResourceTable::with_defaults(),
            ..Default::default()
        }
    }
}

pub trait StateStore: Send + Sync {
    fn load(&mut self) -> Result<State, StoreError>;
    fn save(&mut self, state: &State) -> Result<(), StoreError>;
}

/// Pretty JSON on disk
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonStore {
    fn load(&mut self) -> Result<State, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No state at {}, seeding defaults", self.path.display());
                return Ok(State::seeded());
            }
            Err(e) => return Err(StoreError::Io(self.path.clone(), e)),
        };

        serde_json::from_str(&content).map_err(|e| StoreError::Parse(self.path.clone(), e))
    }

    /// Write-to-temp, fsync, rename. Blocking std::fs calls, made with the
    /// manager lock held; must stay usable from a current-thread runtime.
    fn save(&mut self, state: &State) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(parent.to_path_buf(), e))?;
        }

        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Parse(self.path.clone(), e))?;

        let tmp = self.tmp_path();
        let write = || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| StoreError::Io(self.path.clone(), e))
    }
}

/// In-memory store; clones share the same snapshot
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Option<State>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a given state instead of the seeded defaults
    pub fn with_state(state: State) -> Self {
        Self {
            saved: Arc::new(Mutex::new(Some(state))),
        }
    }

    /// Last saved snapshot
    pub fn snapshot(&self) -> Option<State> {
        self.saved.lock().ok().and_then(|s| s.clone())
    }
}

impl StateStore for MemoryStore {
    fn load(&mut self) -> Result<State, StoreError> {
        let saved = self.saved.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(saved.clone().unwrap_or_else(State::seeded))
    }

    fn save(&mut self, state: &State) -> Result<(), StoreError> {
        let mut saved = self.saved.lock().map_err(|_| StoreError::Poisoned)?;
        *saved = Some(state.clone());
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("{0}: invalid state file: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),

    #[error("State lock poisoned")]
    Poisoned,
}

// src/fleet/hooks.rs - Caller-side collaborators: tool-change hooks and persisted state
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

pub use crate::device::FilamentSensor;

/// Notifications issued by the fleet around slot changes. All default to no-ops.
#[async_trait]
pub trait ToolChangeHooks: Send + Sync {
    async fn before_tool_change(&self, _from: Option<usize>, _to: Option<usize>) {}

    async fn after_tool_change(&self, _from: Option<usize>, _to: Option<usize>) {}

    /// The slot has no filament. The caller decides whether to pause.
    async fn on_empty_spool(&self, _slot: usize) {}
}

/// Hooks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHooks;

#[async_trait]
impl ToolChangeHooks for LoggingHooks {
    async fn before_tool_change(&self, from: Option<usize>, to: Option<usize>) {
        tracing::info!("Tool change {:?} -> {:?} starting", from, to);
    }

    async fn after_tool_change(&self, from: Option<usize>, to: Option<usize>) {
        tracing::info!("Tool change {:?} -> {:?} finished", from, to);
    }

    async fn on_empty_spool(&self, slot: usize) {
        tracing::warn!("Slot {} is empty", slot);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_slot: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infinity_order: Option<String>,
    #[serde(default)]
    pub infinity_position: usize,
}

pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, StoreError>;
    fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<PersistedState>,
}

impl MemoryStore {
    pub fn new(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn current(&self) -> PersistedState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl StateStore for MemoryStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        Ok(self.current())
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state.clone();
        Ok(())
    }
}

/// TOML file next to the configuration. A missing file is an empty state.
#[derive(Debug, Clone)]
pub struct TomlFileStore {
    path: PathBuf,
}

impl TomlFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for TomlFileStore {
    fn load(&self) -> Result<PersistedState, StoreError> {
        if !self.path.exists() {
            tracing::debug!("No saved state at {}", self.path.display());
            return Ok(PersistedState::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }

    fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let content = toml::to_string(state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

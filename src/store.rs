//! Persistence of per-fluid baselines across restarts.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::models::FluidState;

/// Full persisted collector state, keyed by fluid key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorState {
    #[serde(default)]
    pub fluids: BTreeMap<String, FluidState>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the persisted state; a missing file is an empty state, not an
    /// error.
    async fn load(&self) -> anyhow::Result<CollectorState>;

    async fn save(&self, state: &CollectorState) -> anyhow::Result<()>;
}

/// JSON file store; the parent directory is created on first save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> anyhow::Result<CollectorState> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CollectorState::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))
    }

    async fn save(&self, state: &CollectorState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, contents)
            .await
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<CollectorState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> anyhow::Result<CollectorState> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &CollectorState) -> anyhow::Result<()> {
        *self.state.lock().await = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert_eq!(store.load().await.unwrap(), CollectorState::default());
    }

    #[tokio::test]
    async fn state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let mut state = CollectorState::default();
        state.fluids.insert(
            "eau_froide".into(),
            FluidState {
                last_total: Some(12500.0),
                last_total_at: NaiveDate::from_ymd_opt(2024, 3, 2),
            },
        );

        let store = JsonFileStore::new(&path);
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(store.load().await.is_err());
    }
}

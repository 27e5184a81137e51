//! Local file-based state storage backend.
//!
//! The whole state is one JSON document. Every write replaces the file
//! through a temporary file and a rename, so a crash never leaves a
//! half-written state behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{InfraplanError, Result, StateError};
use crate::model::ResourceAddress;

use super::store::StateStore;
use super::types::{HistoryEntry, ObservedState, ResourceState, STATE_VERSION};

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Cached state; also serializes writers.
    cache: Mutex<Option<ObservedState>>,
}

impl LocalStateStore {
    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        Self {
            base_dir,
            state_path,
            cache: Mutex::new(None),
        }
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir)
                .await
                .map_err(|e| StateError::write(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Reads the state file, or returns an empty state if it is missing.
    async fn read_file(&self) -> Result<ObservedState> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(ObservedState::new());
        }

        info!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| {
            InfraplanError::State(StateError::Corrupted {
                message: format!("Failed to read state file: {e}"),
            })
        })?;

        let state: ObservedState = serde_json::from_str(&content).map_err(|e| {
            InfraplanError::State(StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            })
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        Ok(state)
    }

    /// Writes the state file atomically.
    async fn write_file(&self, state: &ObservedState) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::write(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::write(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::write(format!("Failed to rename state file: {e}")))?;

        debug!(serial = state.serial, "State saved to {}", self.state_path.display());
        Ok(())
    }

    /// Applies a change to the cached state and persists it.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut ObservedState) + Send,
    {
        let mut cache = self.cache.lock().await;
        let mut state = match cache.take() {
            Some(state) => state,
            None => self.read_file().await?,
        };

        change(&mut state);
        let written = self.write_file(&state).await;
        *cache = Some(state);
        written
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<ObservedState> {
        let mut cache = self.cache.lock().await;
        let state = self.read_file().await?;
        *cache = Some(state.clone());
        Ok(state)
    }

    async fn save(&self, entry: ResourceState) -> Result<()> {
        debug!("Recording {} in state", entry.address);
        self.update(|state| state.set(entry)).await
    }

    async fn delete(&self, address: &ResourceAddress) -> Result<()> {
        debug!("Removing {address} from state");
        self.update(|state| {
            state.remove(address);
        })
        .await
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        self.update(|state| state.add_history(entry)).await
    }

    async fn clear(&self) -> Result<()> {
        info!("Clearing state file: {}", self.state_path.display());
        self.update(|state| {
            state.resources.clear();
            state.history.clear();
            state.touch();
        })
        .await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeValue;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_state_path(temp_dir.path().join(".infraplan/state.json"));
        (store, temp_dir)
    }

    fn entry(resource_type: &str, name: &str, id: &str) -> ResourceState {
        let mut outputs = BTreeMap::new();
        outputs.insert(String::from("id"), AttributeValue::string(id));
        ResourceState {
            address: ResourceAddress::new(resource_type, name),
            id: id.to_string(),
            attributes: BTreeMap::new(),
            outputs,
            dependencies: Vec::new(),
            ordinal: 0,
            fingerprint: String::new(),
            physical_name: None,
            deposed: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_load_nonexistent_is_empty() {
        let (store, _temp) = create_test_store();

        let state = store.load().await.expect("Load should not fail");
        assert!(state.is_empty());
        assert_eq!(state.serial, 0);
    }

    #[tokio::test]
    async fn test_save_and_reload_from_disk() {
        let (store, temp) = create_test_store();

        store.save(entry("aws_vpc", "main", "vpc-1")).await.expect("save");
        store.save(entry("aws_subnet", "a", "subnet-1")).await.expect("save");

        let reopened = LocalStateStore::with_state_path(temp.path().join(".infraplan/state.json"));
        let state = reopened.load().await.expect("load");
        assert_eq!(state.len(), 2);
        assert_eq!(state.serial, 2);
        assert_eq!(
            state.get(&ResourceAddress::new("aws_vpc", "main")).map(|e| e.id.as_str()),
            Some("vpc-1")
        );
        assert!(!temp.path().join(".infraplan/state.tmp").exists());
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (store, _temp) = create_test_store();

        store.save(entry("aws_vpc", "main", "vpc-1")).await.expect("save");
        store.save(entry("aws_subnet", "a", "subnet-1")).await.expect("save");
        store
            .delete(&ResourceAddress::new("aws_subnet", "a"))
            .await
            .expect("delete");
        assert_eq!(store.load().await.expect("load").len(), 1);

        store.clear().await.expect("clear");
        let state = store.load().await.expect("load");
        assert!(state.is_empty());
        assert_eq!(state.serial, 4);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_reported() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join("state.json"), "{not json").expect("write");

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, InfraplanError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_saves_are_all_recorded() {
        let (store, _temp) = create_test_store();
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .save(entry("aws_subnet", &format!("s{i}"), &format!("subnet-{i}")))
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("save");
        }

        let state = store.load().await.expect("load");
        assert_eq!(state.len(), 8);
        assert_eq!(state.serial, 8);
    }
}

//! In-memory state storage backend, used by tests and dry runs.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::model::ResourceAddress;

use super::store::StateStore;
use super::types::{HistoryEntry, ObservedState, ResourceState};

/// State store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<ObservedState>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with an existing state.
    #[must_use]
    pub fn with_state(state: ObservedState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<ObservedState> {
        Ok(self.state.read().await.clone())
    }

    async fn save(&self, entry: ResourceState) -> Result<()> {
        self.state.write().await.set(entry);
        Ok(())
    }

    async fn delete(&self, address: &ResourceAddress) -> Result<()> {
        self.state.write().await.remove(address);
        Ok(())
    }

    async fn append_history(&self, entry: HistoryEntry) -> Result<()> {
        self.state.write().await.add_history(entry);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.resources.clear();
        state.history.clear();
        state.touch();
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

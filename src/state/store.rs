//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Writes are per resource so a partially applied plan is still recorded.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::ResourceAddress;

use super::types::{HistoryEntry, ObservedState, ResourceState};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the observed state.
    ///
    /// Returns an empty state if nothing was recorded yet.
    async fn load(&self) -> Result<ObservedState>;

    /// Records a resource entry, replacing any previous one.
    async fn save(&self, entry: ResourceState) -> Result<()>;

    /// Removes a resource entry.
    async fn delete(&self, address: &ResourceAddress) -> Result<()>;

    /// Appends an entry to the apply history.
    async fn append_history(&self, entry: HistoryEntry) -> Result<()>;

    /// Removes every resource entry and the history.
    async fn clear(&self) -> Result<()>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

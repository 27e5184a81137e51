//! State types for tracking applied infrastructure.
//!
//! These types represent the last-applied snapshot of every managed
//! resource, used as the baseline for diffing and for delete ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{AttributeValue, OutputSource, ResourceAddress};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The complete observed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedState {
    /// State format version.
    pub version: String,
    /// Incremented on every write.
    pub serial: u64,
    /// Applied resources keyed by address.
    pub resources: BTreeMap<String, ResourceState>,
    /// Apply history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the state was last written.
    pub last_updated: DateTime<Utc>,
}

/// State of a single applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Resource address.
    pub address: ResourceAddress,
    /// Provider identifier of the current object.
    pub id: String,
    /// Declared attributes with references resolved.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Outputs computed by the provider, including `id`.
    pub outputs: BTreeMap<String, AttributeValue>,
    /// Addresses this resource depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
    /// Declaration index when last applied; orders independent deletes.
    #[serde(default)]
    pub ordinal: usize,
    /// Fingerprint of `attributes`.
    pub fingerprint: String,
    /// Name used at the provider when it differs from the declared one.
    #[serde(default)]
    pub physical_name: Option<String>,
    /// Older objects of this resource still awaiting deletion.
    #[serde(default)]
    pub deposed: Vec<DeposedObject>,
    /// When the entry was last written.
    pub updated_at: DateTime<Utc>,
}

/// An object replaced by a create-before-destroy that is not deleted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeposedObject {
    /// Provider identifier.
    pub id: String,
    /// Name used at the provider, if any.
    #[serde(default)]
    pub physical_name: Option<String>,
}

/// A single entry in the apply history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Declaration hash the run was planned from.
    pub declaration_hash: String,
    /// Addresses acted upon.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
    /// Host that ran the operation.
    #[serde(default)]
    pub actor: String,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Plan applied.
    Apply,
    /// All resources destroyed.
    Destroy,
    /// Entry removed from state without touching the provider.
    Forget,
}

impl ObservedState {
    /// Creates a new empty state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            resources: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Gets a resource by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceState> {
        self.resources.get(&address.to_string())
    }

    /// Adds or replaces a resource entry.
    pub fn set(&mut self, entry: ResourceState) {
        self.resources.insert(entry.address.to_string(), entry);
        self.touch();
    }

    /// Removes a resource entry.
    pub fn remove(&mut self, address: &ResourceAddress) -> Option<ResourceState> {
        let removed = self.resources.remove(&address.to_string());
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.touch();
    }

    /// Bumps the serial and timestamp.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Iterates resource entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values()
    }

    /// Returns the number of resource entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl Default for ObservedState {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSource for ObservedState {
    fn output(&self, address: &ResourceAddress, name: &str) -> Option<AttributeValue> {
        self.get(address).and_then(|entry| entry.outputs.get(name)).cloned()
    }
}

impl ResourceState {
    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.address.resource_type
    }
}

impl HistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: Operation, declaration_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            declaration_hash: declaration_hash.to_string(),
            resources,
            success: true,
            error: None,
            actor: hostname::get()
                .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string()),
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: Operation,
        declaration_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, declaration_hash, resources)
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}

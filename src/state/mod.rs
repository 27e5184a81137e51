//! State management module for infraplan.
//!
//! This module provides persistent storage of the observed state: the
//! identifiers, attributes, outputs and dependencies of every applied
//! resource, plus a bounded apply history.

mod local;
mod memory;
mod store;
mod types;

pub use local::LocalStateStore;
pub use memory::MemoryStateStore;
pub use store::StateStore;
pub use types::{
    DeposedObject, HistoryEntry, ObservedState, Operation, ResourceState, STATE_VERSION,
};

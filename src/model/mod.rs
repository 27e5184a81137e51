//! Resource model: addresses, attribute values, and the declaration registry.
//!
//! This module holds the typed declarations that every later stage reads.
//! It performs no I/O.

mod address;
pub mod catalog;
mod resource;
mod value;

pub use address::ResourceAddress;
pub use resource::{Lifecycle, LifecycleOptions, Resource, ResourceModel};
pub use value::{canonical_cidr, AttributeValue, OutputSource, Reference, Resolved};

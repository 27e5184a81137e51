//! Provider abstraction.
//!
//! A provider turns create/update/delete/read calls for one resource into
//! calls against the infrastructure it manages. Every call returns either a
//! result or a [`ProviderError`] classified as retryable or terminal; the
//! apply executor decides what to do with each.

mod sandbox;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::model::catalog;
use crate::model::{AttributeValue, ResourceAddress};

pub use sandbox::{CallKind, Fault, ProviderCall, SandboxObject, SandboxProvider};

/// Desired attributes for one resource, with every reference resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceRequest {
    /// Resource address.
    pub address: ResourceAddress,
    /// Attributes to apply.
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// Result of a successful create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    /// Provider identifier of the object.
    pub id: String,
    /// Computed outputs, including `id`.
    pub outputs: BTreeMap<String, AttributeValue>,
}

/// An object as currently seen by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    /// Provider identifier.
    pub id: String,
    /// Attributes as stored by the provider.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Computed outputs.
    pub outputs: BTreeMap<String, AttributeValue>,
}

/// Operations the apply executor needs from an infrastructure provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Name of this provider (e.g., `sandbox`).
    fn name(&self) -> &'static str;

    /// Creates an object.
    async fn create(&self, request: &ResourceRequest) -> Result<ProviderOutput, ProviderError>;

    /// Updates an object in place. `changed` lists the attributes that differ
    /// from the last applied state.
    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> Result<ProviderOutput, ProviderError>;

    /// Deletes an object.
    async fn delete(&self, address: &ResourceAddress, id: &str) -> Result<(), ProviderError>;

    /// Reads an object. Returns `None` if it no longer exists.
    async fn read(
        &self,
        address: &ResourceAddress,
        id: &str,
    ) -> Result<Option<RemoteObject>, ProviderError>;

    /// Returns true if `attribute` of `resource_type` can change without
    /// replacing the object.
    fn supports_in_place_update(&self, resource_type: &str, attribute: &str) -> bool {
        !catalog::requires_replacement(resource_type, attribute)
    }
}

impl ResourceRequest {
    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.address.resource_type
    }
}

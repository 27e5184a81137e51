//! Resource declarations and the declaration registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::PlanError;

use super::address::ResourceAddress;
use super::value::{AttributeValue, OutputSource, Resolved};

/// A declared resource: the desired state of one infrastructure entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Unique address.
    pub address: ResourceAddress,
    /// Declared attributes.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Explicit dependencies that do not come from attribute references.
    pub depends_on: Vec<ResourceAddress>,
    /// Replacement and comparison options.
    pub lifecycle: LifecycleOptions,
}

/// Per-resource options that adjust diffing and replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleOptions {
    /// Create the replacement before deleting the old object.
    #[serde(default)]
    pub create_before_destroy: bool,
    /// Extra attributes whose change forces a replacement.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// Attributes excluded from comparison.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
}

/// Lifecycle of a resource within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Declared, not acted upon yet.
    Planned,
    /// Create call in flight.
    Creating,
    /// Exists with the declared attributes.
    Created,
    /// Update call in flight.
    Updating,
    /// Delete call in flight.
    Deleting,
    /// Removed.
    Deleted,
    /// Last action failed.
    Failed,
}

impl Resource {
    /// Creates a resource with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: ResourceAddress::new(resource_type, name),
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: LifecycleOptions::default(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, address: ResourceAddress) -> Self {
        self.depends_on.push(address);
        self
    }

    /// Sets lifecycle options.
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: LifecycleOptions) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.address.resource_type
    }
}

/// Registry of declared resources, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ResourceModel {
    resources: Vec<Resource>,
    index: HashMap<ResourceAddress, usize>,
}

impl ResourceModel {
    /// Creates an empty model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a resource.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAddress` if the address is already declared.
    pub fn declare(&mut self, resource: Resource) -> Result<(), PlanError> {
        if self.index.contains_key(&resource.address) {
            return Err(PlanError::DuplicateAddress {
                address: resource.address.to_string(),
            });
        }
        self.index.insert(resource.address.clone(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Builds a model from a list of resources.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateAddress` on the first repeated address.
    pub fn from_resources(resources: impl IntoIterator<Item = Resource>) -> Result<Self, PlanError> {
        let mut model = Self::new();
        for resource in resources {
            model.declare(resource)?;
        }
        Ok(model)
    }

    /// Resolves a value against `source`.
    ///
    /// Literals resolve immediately; references resolve once the producing
    /// resource's output is present in `source`.
    #[must_use]
    pub fn resolve(&self, value: &AttributeValue, source: &dyn OutputSource) -> Resolved {
        value.resolve(source)
    }

    /// Gets a resource by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&Resource> {
        self.index.get(address).map(|&i| &self.resources[i])
    }

    /// Returns true if the address is declared.
    #[must_use]
    pub fn contains(&self, address: &ResourceAddress) -> bool {
        self.index.contains_key(address)
    }

    /// Returns the declaration position of an address.
    #[must_use]
    pub fn position(&self, address: &ResourceAddress) -> Option<usize> {
        self.index.get(address).copied()
    }

    /// Iterates resources in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    /// Returns the number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "planned",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_rejects_duplicates() {
        let mut model = ResourceModel::new();
        model.declare(Resource::new("aws_vpc", "main")).unwrap();

        let err = model.declare(Resource::new("aws_vpc", "main")).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateAddress { ref address } if address == "aws_vpc.main"));
        assert_eq!(model.len(), 1);
    }

    #[test]
    fn test_declaration_order_is_kept() {
        let model = ResourceModel::from_resources([
            Resource::new("aws_vpc", "main"),
            Resource::new("aws_subnet", "a"),
            Resource::new("aws_subnet", "b"),
        ])
        .unwrap();

        let names: Vec<&str> = model.iter().map(|r| r.address.name.as_str()).collect();
        assert_eq!(names, ["main", "a", "b"]);
        assert_eq!(model.position(&ResourceAddress::new("aws_subnet", "b")), Some(2));
    }

    #[test]
    fn test_resolve_deferred_until_output_known() {
        let vpc = ResourceAddress::new("aws_vpc", "main");
        let subnet = Resource::new("aws_subnet", "a")
            .with_attribute("vpc_id", AttributeValue::reference(vpc.clone(), "id"))
            .with_attribute("cidr_block", AttributeValue::string("10.0.1.0/24"));
        let model = ResourceModel::from_resources([Resource::new("aws_vpc", "main"), subnet]).unwrap();

        let mut outputs: BTreeMap<ResourceAddress, BTreeMap<String, AttributeValue>> =
            BTreeMap::new();
        let subnet = model.get(&ResourceAddress::new("aws_subnet", "a")).unwrap();
        let vpc_id = &subnet.attributes["vpc_id"];
        assert!(matches!(model.resolve(vpc_id, &outputs), Resolved::Deferred(_)));

        outputs
            .entry(vpc)
            .or_default()
            .insert(String::from("id"), AttributeValue::string("vpc-0abc"));
        assert_eq!(
            model.resolve(vpc_id, &outputs),
            Resolved::Known(AttributeValue::string("vpc-0abc"))
        );
    }
}

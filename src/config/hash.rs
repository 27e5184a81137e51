//! Declaration hashing for change detection.
//!
//! This module provides deterministic hashing of resource attributes and of
//! whole declaration sets. Attribute fingerprints are recorded in state;
//! the declaration hash identifies the input of a plan.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::model::{AttributeValue, ResourceAddress, ResourceModel};

/// Hasher for computing declaration fingerprints.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of every declared resource.
    ///
    /// This hash changes when any declaration changes, including explicit
    /// dependencies and lifecycle options.
    #[must_use]
    pub fn hash_model(&self, model: &ResourceModel) -> String {
        let mut hasher = Sha256::new();

        for resource in model.iter() {
            hasher.update(resource.address.to_string().as_bytes());
            hasher.update(self.hash_attributes(&resource.attributes).as_bytes());

            for dependency in &resource.depends_on {
                hasher.update(dependency.to_string().as_bytes());
            }

            let lifecycle = &resource.lifecycle;
            hasher.update(if lifecycle.create_before_destroy { [1u8] } else { [0u8] });
            for key in lifecycle.replace_on.iter().chain(&lifecycle.ignore_changes) {
                hasher.update(key.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of an attribute map.
    ///
    /// Values are normalized first so equivalent CIDR spellings hash the
    /// same. Keys starting with `_` are excluded.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, AttributeValue>) -> String {
        let mut hasher = Sha256::new();

        for (key, value) in attributes.iter().filter(|(k, _)| !k.starts_with('_')) {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            let json = serde_json::Value::from(value.normalized(key));
            hasher.update(json.to_string().as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Derives the name suffix used while two objects of one resource exist.
    ///
    /// The suffix depends on the address and the identifier being replaced,
    /// so retries of the same replacement produce the same name.
    #[must_use]
    pub fn replacement_suffix(&self, address: &ResourceAddress, replaced_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(address.to_string().as_bytes());
        hasher.update(replaced_id.as_bytes());
        self.short_hash(&hex::encode(hasher.finalize()))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Resource;

    fn attributes(cidr: &str) -> BTreeMap<String, AttributeValue> {
        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("cidr_block"), AttributeValue::string(cidr));
        attributes.insert(String::from("enable_dns_support"), AttributeValue::Bool(true));
        attributes
    }

    #[test]
    fn test_attribute_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_attributes(&attributes("10.0.0.0/16")),
            hasher.hash_attributes(&attributes("10.0.0.0/16"))
        );
    }

    #[test]
    fn test_attribute_hash_uses_normalized_cidr() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_attributes(&attributes("10.0.0.0/16")),
            hasher.hash_attributes(&attributes("010.000.0.0/16"))
        );
        assert_ne!(
            hasher.hash_attributes(&attributes("10.0.0.0/16")),
            hasher.hash_attributes(&attributes("10.1.0.0/16"))
        );
    }

    #[test]
    fn test_underscore_keys_ignored() {
        let hasher = ConfigHasher::new();
        let mut with_meta = attributes("10.0.0.0/16");
        with_meta.insert(String::from("_comment"), AttributeValue::string("ignored"));
        assert_eq!(
            hasher.hash_attributes(&with_meta),
            hasher.hash_attributes(&attributes("10.0.0.0/16"))
        );
    }

    #[test]
    fn test_model_hash_tracks_dependencies() {
        let hasher = ConfigHasher::new();
        let plain = ResourceModel::from_resources([
            Resource::new("aws_vpc", "main"),
            Resource::new("aws_eip", "nat"),
        ])
        .unwrap();
        let ordered = ResourceModel::from_resources([
            Resource::new("aws_vpc", "main"),
            Resource::new("aws_eip", "nat").depends_on(ResourceAddress::new("aws_vpc", "main")),
        ])
        .unwrap();

        assert_ne!(hasher.hash_model(&plain), hasher.hash_model(&ordered));
    }

    #[test]
    fn test_replacement_suffix_is_stable() {
        let hasher = ConfigHasher::new();
        let address = ResourceAddress::new("aws_security_group", "web");
        let first = hasher.replacement_suffix(&address, "sg-0123");
        assert_eq!(first.len(), 8);
        assert_eq!(first, hasher.replacement_suffix(&address, "sg-0123"));
        assert_ne!(first, hasher.replacement_suffix(&address, "sg-4567"));
    }
}

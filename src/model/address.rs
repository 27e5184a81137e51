//! Resource addresses.
//!
//! An address is the resource type plus the logical name given in the
//! declarations (`aws_vpc.main`). It is the identity of a resource across runs.

use serde::{Deserialize, Serialize};

use crate::error::PlanError;

/// Unique identifier of a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    /// Resource type (e.g., `aws_subnet`).
    pub resource_type: String,
    /// Logical name (e.g., `public_a`).
    pub name: String,
}

impl ResourceAddress {
    /// Creates an address without validating its parts.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Parses an address of the form `type.name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not have exactly two valid segments.
    pub fn parse(value: &str) -> Result<Self, PlanError> {
        let Some((resource_type, name)) = value.split_once('.') else {
            return Err(invalid(value, "expected <type>.<name>"));
        };

        if !is_valid_type(resource_type) {
            return Err(invalid(
                value,
                "type must be lowercase letters, digits and underscores, starting with a letter",
            ));
        }

        if !is_valid_name(name) {
            return Err(invalid(
                value,
                "name must be letters, digits, underscores or hyphens, starting with a letter or underscore",
            ));
        }

        Ok(Self::new(resource_type, name))
    }
}

fn invalid(value: &str, reason: &str) -> PlanError {
    PlanError::InvalidAddress {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Validates a resource type segment.
pub(crate) fn is_valid_type(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Validates a logical name or output segment.
pub(crate) fn is_valid_name(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl TryFrom<String> for ResourceAddress {
    type Error = PlanError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

impl std::str::FromStr for ResourceAddress {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let address = ResourceAddress::parse("aws_subnet.public_a").unwrap();
        assert_eq!(address.resource_type, "aws_subnet");
        assert_eq!(address.name, "public_a");
        assert_eq!(address.to_string(), "aws_subnet.public_a");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ResourceAddress::parse("aws_vpc").is_err());
        assert!(ResourceAddress::parse("AWS_VPC.main").is_err());
        assert!(ResourceAddress::parse("aws_vpc.main.id").is_err());
        assert!(ResourceAddress::parse("aws_vpc.1main").is_err());
        assert!(ResourceAddress::parse(".main").is_err());
    }

    #[test]
    fn test_addresses_order_by_type_then_name() {
        let mut addresses = vec![
            ResourceAddress::new("aws_vpc", "main"),
            ResourceAddress::new("aws_subnet", "b"),
            ResourceAddress::new("aws_subnet", "a"),
        ];
        addresses.sort();
        let rendered: Vec<String> = addresses.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["aws_subnet.a", "aws_subnet.b", "aws_vpc.main"]);
    }
}

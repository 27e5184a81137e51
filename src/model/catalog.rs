//! Catalog of known resource types.
//!
//! For each type the catalog records which attributes force a replacement,
//! which attribute must be unique per account (and therefore collides during
//! a create-before-destroy replacement), the identifier prefix the sandbox
//! provider uses, and the outputs it computes.

/// Static description of a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceKind {
    /// Type name as used in addresses (e.g., `aws_subnet`).
    pub type_name: &'static str,
    /// Prefix for generated identifiers.
    pub id_prefix: &'static str,
    /// Attributes that cannot be changed in place.
    pub force_new: &'static [&'static str],
    /// Attribute holding a name that must be unique.
    pub name_attribute: Option<&'static str>,
    /// Outputs computed by the provider in addition to `id`.
    pub outputs: &'static [&'static str],
}

/// Attributes every type can change in place.
const ALWAYS_IN_PLACE: &[&str] = &["tags"];

/// Known resource types.
pub const CATALOG: &[ResourceKind] = &[
    ResourceKind {
        type_name: "aws_vpc",
        id_prefix: "vpc",
        force_new: &["cidr_block", "instance_tenancy"],
        name_attribute: None,
        outputs: &["arn", "default_route_table_id", "default_network_acl_id"],
    },
    ResourceKind {
        type_name: "aws_subnet",
        id_prefix: "subnet",
        force_new: &["vpc_id", "cidr_block", "availability_zone"],
        name_attribute: None,
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_internet_gateway",
        id_prefix: "igw",
        force_new: &[],
        name_attribute: None,
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_eip",
        id_prefix: "eipalloc",
        force_new: &["domain"],
        name_attribute: None,
        outputs: &["public_ip"],
    },
    ResourceKind {
        type_name: "aws_nat_gateway",
        id_prefix: "nat",
        force_new: &["allocation_id", "subnet_id", "connectivity_type"],
        name_attribute: None,
        outputs: &["public_ip", "private_ip"],
    },
    ResourceKind {
        type_name: "aws_route_table",
        id_prefix: "rtb",
        force_new: &["vpc_id"],
        name_attribute: None,
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_route",
        id_prefix: "r",
        force_new: &["route_table_id", "destination_cidr_block"],
        name_attribute: None,
        outputs: &[],
    },
    ResourceKind {
        type_name: "aws_route_table_association",
        id_prefix: "rtbassoc",
        force_new: &["subnet_id"],
        name_attribute: None,
        outputs: &[],
    },
    ResourceKind {
        type_name: "aws_network_acl",
        id_prefix: "acl",
        force_new: &["vpc_id"],
        name_attribute: None,
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_network_acl_rule",
        id_prefix: "nacl",
        force_new: &[
            "network_acl_id",
            "rule_number",
            "egress",
            "protocol",
            "rule_action",
            "cidr_block",
            "from_port",
            "to_port",
        ],
        name_attribute: None,
        outputs: &[],
    },
    ResourceKind {
        type_name: "aws_security_group",
        id_prefix: "sg",
        force_new: &["name", "vpc_id", "description"],
        name_attribute: Some("name"),
        outputs: &["arn", "owner_id"],
    },
    ResourceKind {
        type_name: "aws_security_group_rule",
        id_prefix: "sgrule",
        force_new: &[
            "type",
            "security_group_id",
            "source_security_group_id",
            "protocol",
            "from_port",
            "to_port",
            "cidr_blocks",
        ],
        name_attribute: None,
        outputs: &[],
    },
    ResourceKind {
        type_name: "aws_cloudwatch_log_group",
        id_prefix: "lg",
        force_new: &["name"],
        name_attribute: Some("name"),
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_iam_role",
        id_prefix: "role",
        force_new: &["name"],
        name_attribute: Some("name"),
        outputs: &["arn", "unique_id"],
    },
    ResourceKind {
        type_name: "aws_iam_role_policy",
        id_prefix: "policy",
        force_new: &["name", "role"],
        name_attribute: None,
        outputs: &[],
    },
    ResourceKind {
        type_name: "aws_flow_log",
        id_prefix: "fl",
        force_new: &[
            "vpc_id",
            "traffic_type",
            "log_destination",
            "log_destination_type",
            "iam_role_arn",
        ],
        name_attribute: None,
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_vpc_endpoint",
        id_prefix: "vpce",
        force_new: &["vpc_id", "service_name", "vpc_endpoint_type"],
        name_attribute: None,
        outputs: &["arn", "prefix_list_id"],
    },
    ResourceKind {
        type_name: "aws_db_subnet_group",
        id_prefix: "dbsubnet",
        force_new: &["name"],
        name_attribute: Some("name"),
        outputs: &["arn"],
    },
    ResourceKind {
        type_name: "aws_db_instance",
        id_prefix: "db",
        force_new: &["identifier", "engine", "db_subnet_group_name", "storage_encrypted"],
        name_attribute: Some("identifier"),
        outputs: &["arn", "endpoint", "address"],
    },
    ResourceKind {
        type_name: "aws_key_pair",
        id_prefix: "key",
        force_new: &["key_name", "public_key"],
        name_attribute: Some("key_name"),
        outputs: &["arn", "fingerprint"],
    },
    ResourceKind {
        type_name: "aws_instance",
        id_prefix: "i",
        force_new: &["ami", "subnet_id", "key_name", "availability_zone", "root_block_device"],
        name_attribute: None,
        outputs: &["arn", "private_ip", "public_ip"],
    },
];

/// Looks up a resource type in the catalog.
#[must_use]
pub fn lookup(type_name: &str) -> Option<&'static ResourceKind> {
    CATALOG.iter().find(|kind| kind.type_name == type_name)
}

/// Returns true if changing `attribute` on `type_name` requires replacement.
///
/// Unknown types are treated conservatively: every attribute except tags
/// forces a replacement.
#[must_use]
pub fn requires_replacement(type_name: &str, attribute: &str) -> bool {
    if ALWAYS_IN_PLACE.contains(&attribute) {
        return false;
    }
    lookup(type_name).is_none_or(|kind| kind.force_new.contains(&attribute))
}

/// Returns the unique-name attribute of a type, if any.
#[must_use]
pub fn name_attribute(type_name: &str) -> Option<&'static str> {
    lookup(type_name).and_then(|kind| kind.name_attribute)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_type() {
        let kind = lookup("aws_subnet").unwrap();
        assert_eq!(kind.id_prefix, "subnet");
        assert!(lookup("aws_unknown_thing").is_none());
    }

    #[test]
    fn test_replacement_classification() {
        assert!(requires_replacement("aws_vpc", "cidr_block"));
        assert!(!requires_replacement("aws_vpc", "enable_dns_hostnames"));
        assert!(!requires_replacement("aws_vpc", "tags"));
        assert!(requires_replacement("custom_thing", "size"));
        assert!(!requires_replacement("custom_thing", "tags"));
    }

    #[test]
    fn test_type_names_are_unique() {
        for (i, kind) in CATALOG.iter().enumerate() {
            assert!(
                CATALOG[i + 1..].iter().all(|k| k.type_name != kind.type_name),
                "duplicate catalog entry {}",
                kind.type_name
            );
        }
    }
}

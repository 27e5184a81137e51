//! Declaration validation.
//!
//! This module checks a declaration file before anything is planned:
//! settings must be usable, addresses well-formed and unique, every
//! reference and `depends_on` entry must name a declared resource, and the
//! declared policy (required tags, no admin ports open to the world) must
//! hold. Subnets with literal CIDR blocks must fit their VPC and must not
//! overlap each other.

use crate::error::{ConfigError, InfraplanError, Result};
use crate::model::{canonical_cidr, catalog, AttributeValue, ResourceAddress};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use tracing::debug;

use super::spec::{DeclarationFile, PolicyConfig, ResourceSpec};

/// Resource types that have no `tags` attribute.
const UNTAGGABLE_TYPES: &[&str] = &[
    "aws_route",
    "aws_route_table_association",
    "aws_network_acl_rule",
    "aws_security_group_rule",
    "aws_iam_role_policy",
];

/// CIDR blocks that match every address.
const WORLD_CIDRS: &[&str] = &["0.0.0.0/0", "::/0"];

/// Validator for declaration files.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a declaration file.
    ///
    /// # Errors
    ///
    /// Returns the first error found, if any.
    pub fn validate(&self, declarations: &DeclarationFile) -> Result<ValidationResult> {
        let result = self.check(declarations);

        if let Some(first_error) = result.errors.first() {
            Err(InfraplanError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Declaration validation passed");
            Ok(result)
        }
    }

    /// Runs every check and collects all errors and warnings.
    #[must_use]
    pub fn check(&self, declarations: &DeclarationFile) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(declarations, &mut result);
        Self::validate_apply(declarations, &mut result);
        Self::validate_resources(&declarations.resources, &declarations.policy, &mut result);

        result
    }

    fn validate_project(declarations: &DeclarationFile, result: &mut ValidationResult) {
        let project = &declarations.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!("Environment '{}' is invalid", project.environment),
            );
        }
    }

    fn validate_apply(declarations: &DeclarationFile, result: &mut ValidationResult) {
        let apply = &declarations.apply;
        if apply.workers == 0 {
            result.error("apply.workers", "At least one worker is required");
        }
        if apply.max_attempts == 0 {
            result.error("apply.max_attempts", "At least one attempt is required");
        }
        if apply.backoff.initial_ms > apply.backoff.max_ms {
            result.error(
                "apply.backoff",
                format!(
                    "Initial backoff ({}ms) exceeds maximum backoff ({}ms)",
                    apply.backoff.initial_ms, apply.backoff.max_ms
                ),
            );
        }
    }

    fn validate_resources(
        resources: &[ResourceSpec],
        policy: &PolicyConfig,
        result: &mut ValidationResult,
    ) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared; apply would destroy everything in state"));
            return;
        }

        let mut declared = HashSet::new();
        for (i, spec) in resources.iter().enumerate() {
            let field = format!("resources[{i}]");
            match ResourceAddress::parse(&spec.address_text()) {
                Ok(address) => {
                    if !declared.insert(address) {
                        result.error(
                            &field,
                            format!("Duplicate resource address: {}", spec.address_text()),
                        );
                    }
                }
                Err(e) => result.error(&field, e.to_string()),
            }
        }

        for (i, spec) in resources.iter().enumerate() {
            let field = format!("resources[{i}]");
            let address = spec.address_text();

            if catalog::lookup(&spec.resource_type).is_none() {
                result.warnings.push(format!(
                    "{address}: unknown resource type '{}'; every attribute change except tags replaces it",
                    spec.resource_type
                ));
            }

            for (j, target) in spec.depends_on.iter().enumerate() {
                let dep_field = format!("{field}.depends_on[{j}]");
                match ResourceAddress::parse(target) {
                    Ok(target) if !declared.contains(&target) => result.error(
                        &dep_field,
                        format!("{address} depends on undeclared resource {target}"),
                    ),
                    Ok(_) => {}
                    Err(e) => result.error(&dep_field, e.to_string()),
                }
            }

            for (key, value) in &spec.attributes {
                Self::validate_attribute(
                    &format!("{field}.attributes.{key}"),
                    &address,
                    key,
                    value,
                    &declared,
                    result,
                );
            }

            Self::validate_tags(spec, &field, &policy.required_tags, result);
            Self::check_world_open_ingress(spec, &policy.admin_ports, result);
        }

        Self::validate_subnet_cidrs(resources, result);
    }

    /// Checks literal subnet blocks against their VPC's block and against
    /// the other subnets of the same VPC.
    fn validate_subnet_cidrs(resources: &[ResourceSpec], result: &mut ValidationResult) {
        let literal_block = |spec: &ResourceSpec| {
            spec.attributes
                .get("cidr_block")
                .and_then(AttributeValue::as_str)
                .and_then(CidrBlock::parse)
        };

        let vpcs: HashMap<String, CidrBlock> = resources
            .iter()
            .filter(|spec| spec.resource_type == "aws_vpc")
            .filter_map(|spec| Some((spec.address_text(), literal_block(spec)?)))
            .collect();

        let mut subnets: HashMap<String, Vec<(String, CidrBlock)>> = HashMap::new();
        for (i, spec) in resources.iter().enumerate() {
            if spec.resource_type != "aws_subnet" {
                continue;
            }
            let Some(block) = literal_block(spec) else {
                continue;
            };
            let vpc = match spec.attributes.get("vpc_id") {
                Some(AttributeValue::Reference(reference)) => reference.address.to_string(),
                Some(AttributeValue::String(id)) => id.clone(),
                _ => continue,
            };
            let field = format!("resources[{i}].attributes.cidr_block");
            let address = spec.address_text();

            if let Some(vpc_block) = vpcs.get(&vpc)
                && !vpc_block.contains(&block)
            {
                result.error(
                    &field,
                    format!("{address}: {block} is outside {vpc} ({vpc_block})"),
                );
            }

            let siblings = subnets.entry(vpc).or_default();
            for (other, other_block) in siblings.iter() {
                if block.overlaps(other_block) {
                    result.error(
                        &field,
                        format!("{address}: {block} overlaps {other} ({other_block})"),
                    );
                }
            }
            siblings.push((address, block));
        }
    }

    fn validate_attribute(
        field: &str,
        address: &str,
        key: &str,
        value: &AttributeValue,
        declared: &HashSet<ResourceAddress>,
        result: &mut ValidationResult,
    ) {
        match value {
            AttributeValue::Reference(reference) => {
                if !declared.contains(&reference.address) {
                    result.error(
                        field,
                        format!("{address} references undeclared resource {}", reference.address),
                    );
                }
            }
            AttributeValue::String(text) => {
                if text.contains("${") {
                    result.error(
                        field,
                        format!(
                            "'{text}' is not a reference; references must be the whole value, as ${{type.name.output}}"
                        ),
                    );
                } else if key.contains("cidr") && canonical_cidr(text).is_none() {
                    result.error(field, format!("'{text}' is not a valid CIDR block"));
                }
            }
            AttributeValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    Self::validate_attribute(
                        &format!("{field}[{i}]"),
                        address,
                        key,
                        item,
                        declared,
                        result,
                    );
                }
            }
            AttributeValue::Map(entries) => {
                for (inner_key, item) in entries {
                    Self::validate_attribute(
                        &format!("{field}.{inner_key}"),
                        address,
                        inner_key,
                        item,
                        declared,
                        result,
                    );
                }
            }
            AttributeValue::Null
            | AttributeValue::Bool(_)
            | AttributeValue::Int(_)
            | AttributeValue::Float(_) => {}
        }
    }

    fn validate_tags(
        spec: &ResourceSpec,
        field: &str,
        required_tags: &[String],
        result: &mut ValidationResult,
    ) {
        if required_tags.is_empty() || UNTAGGABLE_TYPES.contains(&spec.resource_type.as_str()) {
            return;
        }

        let tags = match spec.attributes.get("tags") {
            Some(AttributeValue::Map(tags)) => Some(tags),
            _ => None,
        };
        let missing: Vec<&str> = required_tags
            .iter()
            .filter(|tag| !tags.is_some_and(|map| map.contains_key(tag.as_str())))
            .map(String::as_str)
            .collect();

        if !missing.is_empty() {
            result.error(
                &format!("{field}.attributes.tags"),
                format!(
                    "{} is missing required tags: {}",
                    spec.address_text(),
                    missing.join(", ")
                ),
            );
        }
    }

    /// Warns about rules that open an admin port to every address.
    fn check_world_open_ingress(
        spec: &ResourceSpec,
        admin_ports: &[u16],
        result: &mut ValidationResult,
    ) {
        let attributes = &spec.attributes;
        let text = |key: &str| attributes.get(key).and_then(AttributeValue::as_str);
        let number = |key: &str| match attributes.get(key) {
            Some(AttributeValue::Int(n)) => Some(*n),
            Some(AttributeValue::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        let inbound = match spec.resource_type.as_str() {
            "aws_security_group_rule" => text("type") == Some("ingress"),
            "aws_network_acl_rule" => {
                !matches!(attributes.get("egress"), Some(AttributeValue::Bool(true)))
                    && text("rule_action") == Some("allow")
            }
            _ => return,
        };
        if !inbound {
            return;
        }

        let world_open = ["cidr_block", "cidr_blocks", "ipv6_cidr_block", "ipv6_cidr_blocks"]
            .iter()
            .filter_map(|key| attributes.get(*key))
            .flat_map(|value| match value {
                AttributeValue::List(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .filter_map(AttributeValue::as_str)
            .filter_map(canonical_cidr)
            .any(|cidr| WORLD_CIDRS.contains(&cidr.as_str()));
        if !world_open {
            return;
        }

        let all_protocols = matches!(text("protocol"), Some("-1" | "all"))
            || matches!(attributes.get("protocol"), Some(AttributeValue::Int(-1)));
        let from = number("from_port").unwrap_or(0);
        let to = number("to_port").unwrap_or(from);

        let exposed: Vec<String> = admin_ports
            .iter()
            .filter(|port| all_protocols || (from..=to).contains(&i64::from(**port)))
            .map(ToString::to_string)
            .collect();

        if !exposed.is_empty() {
            result.warnings.push(format!(
                "{} opens port {} to the whole internet",
                spec.address_text(),
                exposed.join(", ")
            ));
        }
    }
}

/// A parsed CIDR block, host bits cleared.
#[derive(Debug, PartialEq, Eq)]
struct CidrBlock {
    network: IpAddr,
    prefix: u8,
}

impl CidrBlock {
    fn parse(text: &str) -> Option<Self> {
        let canonical = canonical_cidr(text)?;
        let (ip, prefix) = canonical.split_once('/')?;
        Some(Self {
            network: ip.parse().ok()?,
            prefix: prefix.parse().ok()?,
        })
    }

    /// Address bits left-aligned in a `u128`, and the family width.
    fn bits(&self) -> (u128, u32) {
        match self.network {
            IpAddr::V4(ip) => (u128::from(u32::from(ip)) << 96, 32),
            IpAddr::V6(ip) => (u128::from(ip), 128),
        }
    }

    fn contains(&self, other: &Self) -> bool {
        let (network, width) = self.bits();
        let (inner, other_width) = other.bits();
        if width != other_width || self.prefix > other.prefix {
            return false;
        }
        let mask = if self.prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(self.prefix)) };
        inner & mask == network
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl std::fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_lowercase() {
        return false;
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> DeclarationFile {
        ConfigParser::new().parse_yaml(yaml, None).unwrap()
    }

    fn messages(result: &ValidationResult) -> Vec<String> {
        result.errors.iter().map(ToString::to_string).collect()
    }

    const VALID: &str = r#"
project:
  name: network
policy:
  required_tags: [Project]
resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/16
      tags: { Project: network }
  - type: aws_subnet
    name: a
    attributes:
      vpc_id: "${aws_vpc.main.id}"
      cidr_block: 10.0.1.0/24
      tags: { Project: network }
  - type: aws_route_table_association
    name: a
    attributes:
      subnet_id: "${aws_subnet.a.id}"
    depends_on: [aws_subnet.a]
"#;

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("network"));
        assert!(is_valid_name("edge-stack-2"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Network")); // uppercase
        assert!(!is_valid_name("2-network")); // starts with number
        assert!(!is_valid_name("edge_stack")); // underscore
        assert!(!is_valid_name("edge-")); // ends with hyphen
        assert!(!is_valid_name("edge--stack")); // consecutive hyphens
    }

    #[test]
    fn test_valid_declarations_pass() {
        let result = ConfigValidator::new().validate(&parse(VALID)).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_unknown_references_and_dependencies() {
        let yaml = r#"
project:
  name: network
resources:
  - type: aws_subnet
    name: a
    attributes:
      vpc_id: "${aws_vpc.missing.id}"
    depends_on: [aws_internet_gateway.gw]
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        let messages = messages(&result);
        assert_eq!(result.error_count(), 2);
        assert!(messages.iter().any(|m| m.contains("undeclared resource aws_vpc.missing")));
        assert!(messages.iter().any(|m| m.contains("undeclared resource aws_internet_gateway.gw")));
    }

    #[test]
    fn test_duplicates_interpolation_and_cidrs() {
        let yaml = r#"
project:
  name: network
resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/33
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.1.0.0/16
  - type: aws_instance
    name: web
    attributes:
      user_data: "subnet-${aws_vpc.main.id}"
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        let messages = messages(&result);
        assert_eq!(result.error_count(), 3, "{messages:?}");
        assert!(messages.iter().any(|m| m.contains("not a valid CIDR block")));
        assert!(messages.iter().any(|m| m.contains("Duplicate resource address: aws_vpc.main")));
        assert!(messages.iter().any(|m| m.contains("is not a reference")));
    }

    #[test]
    fn test_settings_errors() {
        let yaml = r"
project:
  name: Network
apply:
  workers: 0
  backoff:
    initial_ms: 9000
    max_ms: 100
";
        let declarations = parse(yaml);
        let result = ConfigValidator::new().check(&declarations);
        assert_eq!(result.error_count(), 3);
        assert!(result.warnings.iter().any(|w| w.contains("No resources declared")));

        let err = ConfigValidator::new().validate(&declarations).unwrap_err();
        assert!(err.to_string().contains("Project name 'Network' is invalid"));
    }

    #[test]
    fn test_required_tags_skip_untaggable_types() {
        let yaml = r#"
project:
  name: network
policy:
  required_tags: [Project, Owner]
resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/16
      tags: { Project: network }
  - type: aws_route
    name: default
    attributes:
      route_table_id: rtb-1
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        assert_eq!(messages(&result), [
            "resources[0].attributes.tags: aws_vpc.main is missing required tags: Owner"
        ]);
    }

    #[test]
    fn test_world_open_admin_ports_warn() {
        let yaml = r#"
project:
  name: network
resources:
  - type: aws_security_group
    name: web
    attributes:
      name: web
  - type: aws_security_group_rule
    name: ssh
    attributes:
      type: ingress
      security_group_id: "${aws_security_group.web.id}"
      protocol: tcp
      from_port: 20
      to_port: 25
      cidr_blocks: ["0.0.0.0/0"]
  - type: aws_security_group_rule
    name: https
    attributes:
      type: ingress
      security_group_id: "${aws_security_group.web.id}"
      protocol: tcp
      from_port: 443
      to_port: 443
      cidr_blocks: ["0.0.0.0/0"]
  - type: aws_network_acl_rule
    name: all
    attributes:
      network_acl_id: acl-1
      egress: false
      rule_action: allow
      protocol: "-1"
      cidr_block: 0.0.0.0/0
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        assert!(result.is_valid(), "{:?}", messages(&result));
        assert_eq!(result.warning_count(), 2, "{:?}", result.warnings);
        assert!(result.warnings[0].contains("aws_security_group_rule.ssh opens port 22"));
        assert!(result.warnings[1].contains("aws_network_acl_rule.all opens port 22, 3389"));
    }

    #[test]
    fn test_unknown_type_warns() {
        let yaml = r"
project:
  name: network
resources:
  - type: custom_widget
    name: one
";
        let result = ConfigValidator::new().check(&parse(yaml));
        assert!(result.is_valid());
        assert!(result.warnings[0].contains("unknown resource type 'custom_widget'"));
    }

    #[test]
    fn test_subnets_must_fit_their_vpc_without_overlapping() {
        let yaml = r#"
project:
  name: network
resources:
  - type: aws_vpc
    name: main
    attributes:
      cidr_block: 10.0.0.0/16
  - type: aws_subnet
    name: a
    attributes:
      vpc_id: "${aws_vpc.main.id}"
      cidr_block: 10.0.1.0/24
  - type: aws_subnet
    name: b
    attributes:
      vpc_id: "${aws_vpc.main.id}"
      cidr_block: 10.0.1.128/25
  - type: aws_subnet
    name: c
    attributes:
      vpc_id: "${aws_vpc.main.id}"
      cidr_block: 10.1.0.0/24
  - type: aws_subnet
    name: elsewhere
    attributes:
      vpc_id: vpc-0abc
      cidr_block: 10.0.1.0/24
"#;
        let result = ConfigValidator::new().check(&parse(yaml));
        assert_eq!(messages(&result), [
            "resources[2].attributes.cidr_block: aws_subnet.b: 10.0.1.128/25 overlaps aws_subnet.a (10.0.1.0/24)",
            "resources[3].attributes.cidr_block: aws_subnet.c: 10.1.0.0/24 is outside aws_vpc.main (10.0.0.0/16)",
        ]);
    }

    #[test]
    fn test_cidr_block_containment() {
        let block = |text: &str| CidrBlock::parse(text).unwrap();

        assert!(block("10.0.0.0/16").contains(&block("10.0.255.0/24")));
        assert!(!block("10.0.0.0/16").contains(&block("10.1.0.0/24")));
        assert!(!block("10.0.1.0/24").contains(&block("10.0.0.0/16")));
        assert!(block("10.0.1.0/24").overlaps(&block("10.0.0.0/16")));
        assert!(block("0.0.0.0/0").contains(&block("192.168.1.1/32")));
        assert!(block("2001:db8::/32").contains(&block("2001:DB8:1::/48")));
        assert!(!block("::/0").overlaps(&block("10.0.0.0/8")));
        assert_eq!(block("10.0.1.7/24").to_string(), "10.0.1.0/24");
        assert!(CidrBlock::parse("10.0.0.0").is_none());
    }
}

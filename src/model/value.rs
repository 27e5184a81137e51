//! Attribute values and two-phase reference resolution.
//!
//! Declared attributes are either literals or references to another
//! resource's computed output. A reference is written as the whole string
//! `${type.name.output}`. Resolution turns a value into [`Resolved::Known`]
//! once every output it mentions is available, and [`Resolved::Deferred`]
//! otherwise.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use super::address::{is_valid_name, ResourceAddress};

/// A declared or observed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum AttributeValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    String(String),
    /// Ordered list.
    List(Vec<AttributeValue>),
    /// Map with sorted keys.
    Map(BTreeMap<String, AttributeValue>),
    /// Reference to another resource's output.
    Reference(Reference),
}

/// Reference to a computed output of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Producing resource.
    pub address: ResourceAddress,
    /// Output name on the producer (e.g., `id`).
    pub output: String,
}

/// Result of resolving a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Fully known value.
    Known(AttributeValue),
    /// Value depends on an output that is not available yet.
    Deferred(Reference),
}

/// Source of computed outputs used during resolution.
pub trait OutputSource {
    /// Looks up an output of a resource, if it is known.
    fn output(&self, address: &ResourceAddress, name: &str) -> Option<AttributeValue>;
}

impl OutputSource for BTreeMap<ResourceAddress, BTreeMap<String, AttributeValue>> {
    fn output(&self, address: &ResourceAddress, name: &str) -> Option<AttributeValue> {
        self.get(address).and_then(|outputs| outputs.get(name)).cloned()
    }
}

impl Reference {
    /// Parses a `${type.name.output}` string.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let inner = text.strip_prefix("${")?.strip_suffix('}')?;
        let (address, output) = inner.rsplit_once('.')?;
        if !is_valid_name(output) {
            return None;
        }
        let address = ResourceAddress::parse(address).ok()?;
        Some(Self {
            address,
            output: output.to_string(),
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.address, self.output)
    }
}

impl AttributeValue {
    /// Creates a string value.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// Creates a reference value.
    #[must_use]
    pub fn reference(address: ResourceAddress, output: impl Into<String>) -> Self {
        Self::Reference(Reference {
            address,
            output: output.into(),
        })
    }

    /// Returns the string content, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Collects every reference in this value tree.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a Reference>) {
        match self {
            Self::Reference(reference) => found.push(reference),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(found)),
            _ => {}
        }
    }

    /// Resolves references against a source of outputs.
    #[must_use]
    pub fn resolve(&self, source: &dyn OutputSource) -> Resolved {
        match self {
            Self::Reference(reference) => source
                .output(&reference.address, &reference.output)
                .map_or_else(|| Resolved::Deferred(reference.clone()), Resolved::Known),
            Self::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    match item.resolve(source) {
                        Resolved::Known(value) => resolved.push(value),
                        deferred @ Resolved::Deferred(_) => return deferred,
                    }
                }
                Resolved::Known(Self::List(resolved))
            }
            Self::Map(entries) => {
                let mut resolved = BTreeMap::new();
                for (key, item) in entries {
                    match item.resolve(source) {
                        Resolved::Known(value) => {
                            resolved.insert(key.clone(), value);
                        }
                        deferred @ Resolved::Deferred(_) => return deferred,
                    }
                }
                Resolved::Known(Self::Map(resolved))
            }
            literal => Resolved::Known(literal.clone()),
        }
    }

    /// Returns the canonical form used for comparisons.
    ///
    /// Values stored under a key containing `cidr` are canonicalized as CIDR
    /// blocks; everything else is returned unchanged.
    #[must_use]
    pub fn normalized(&self, key: &str) -> Self {
        if !key.to_ascii_lowercase().contains("cidr") {
            return self.clone();
        }
        self.normalize_cidrs()
    }

    fn normalize_cidrs(&self) -> Self {
        match self {
            Self::String(s) => Self::String(canonical_cidr(s).unwrap_or_else(|| s.clone())),
            Self::List(items) => Self::List(items.iter().map(Self::normalize_cidrs).collect()),
            other => other.clone(),
        }
    }
}

/// Canonicalizes a CIDR block: trimmed, lowercase, no leading zeros, host
/// bits cleared. Returns `None` if the text is not a CIDR block.
#[must_use]
pub fn canonical_cidr(text: &str) -> Option<String> {
    let text = text.trim().to_ascii_lowercase();
    let (ip, prefix) = text.split_once('/')?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    let ip = ip.trim();

    if ip.contains(':') {
        if prefix > 128 {
            return None;
        }
        let addr: Ipv6Addr = ip.parse().ok()?;
        let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix)) };
        let network = Ipv6Addr::from(u128::from(addr) & mask);
        return Some(format!("{network}/{prefix}"));
    }

    if prefix > 32 {
        return None;
    }
    let octets: Vec<u8> = ip
        .split('.')
        .map(|part| part.parse::<u8>().ok())
        .collect::<Option<Vec<u8>>>()?;
    let [a, b, c, d] = octets.as_slice() else {
        return None;
    };
    let addr = Ipv4Addr::new(*a, *b, *c, *d);
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - u32::from(prefix)) };
    let network = Ipv4Addr::from(u32::from(addr) & mask);
    Some(format!("{network}/{prefix}"))
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            serde_json::Value::String(s) => {
                Reference::parse(&s).map_or(Self::String(s), Self::Reference)
            }
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(entries) => Self::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<AttributeValue> for serde_json::Value {
    fn from(value: AttributeValue) -> Self {
        match value {
            AttributeValue::Null => Self::Null,
            AttributeValue::Bool(b) => Self::Bool(b),
            AttributeValue::Int(i) => Self::from(i),
            AttributeValue::Float(f) => Self::from(f),
            AttributeValue::String(s) => Self::String(s),
            AttributeValue::List(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            AttributeValue::Map(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Self::from(v)))
                    .collect(),
            ),
            AttributeValue::Reference(reference) => Self::String(reference.to_string()),
        }
    }
}

impl std::fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "\"{s}\""),
            Self::Reference(reference) => write!(f, "{reference}"),
            other => {
                let json = serde_json::Value::from(other.clone());
                write!(f, "{json}")
            }
        }
    }
}

impl std::fmt::Display for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Deferred(_) => write!(f, "(known after apply)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpc() -> ResourceAddress {
        ResourceAddress::new("aws_vpc", "main")
    }

    #[test]
    fn test_reference_parse() {
        let reference = Reference::parse("${aws_vpc.main.id}").unwrap();
        assert_eq!(reference.address, vpc());
        assert_eq!(reference.output, "id");
        assert_eq!(reference.to_string(), "${aws_vpc.main.id}");

        assert!(Reference::parse("${aws_vpc.main}").is_none());
        assert!(Reference::parse("prefix-${aws_vpc.main.id}").is_none());
        assert!(Reference::parse("aws_vpc.main.id").is_none());
    }

    #[test]
    fn test_json_strings_become_references() {
        let value = AttributeValue::from(serde_json::json!({
            "vpc_id": "${aws_vpc.main.id}",
            "cidr_block": "10.0.1.0/24",
        }));
        let refs = value.references();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].address, vpc());
    }

    #[test]
    fn test_resolve_known_and_deferred() {
        let mut outputs: BTreeMap<ResourceAddress, BTreeMap<String, AttributeValue>> =
            BTreeMap::new();
        let value = AttributeValue::List(vec![
            AttributeValue::string("sg-static"),
            AttributeValue::reference(vpc(), "id"),
        ]);

        assert_eq!(
            value.resolve(&outputs),
            Resolved::Deferred(Reference {
                address: vpc(),
                output: String::from("id"),
            })
        );

        let mut vpc_outputs = BTreeMap::new();
        vpc_outputs.insert(String::from("id"), AttributeValue::string("vpc-123"));
        outputs.insert(vpc(), vpc_outputs);

        assert_eq!(
            value.resolve(&outputs),
            Resolved::Known(AttributeValue::List(vec![
                AttributeValue::string("sg-static"),
                AttributeValue::string("vpc-123"),
            ]))
        );
    }

    #[test]
    fn test_literal_resolves_immediately() {
        let outputs: BTreeMap<ResourceAddress, BTreeMap<String, AttributeValue>> = BTreeMap::new();
        let value = AttributeValue::Int(443);
        assert_eq!(value.resolve(&outputs), Resolved::Known(AttributeValue::Int(443)));
    }

    #[test]
    fn test_canonical_cidr() {
        assert_eq!(canonical_cidr("10.0.0.0/16").as_deref(), Some("10.0.0.0/16"));
        assert_eq!(canonical_cidr(" 010.000.000.000/16 ").as_deref(), Some("10.0.0.0/16"));
        assert_eq!(canonical_cidr("10.0.7.9/16").as_deref(), Some("10.0.0.0/16"));
        assert_eq!(canonical_cidr("0.0.0.0/0").as_deref(), Some("0.0.0.0/0"));
        assert_eq!(
            canonical_cidr("2600:1F18:0:0::/56").as_deref(),
            Some("2600:1f18::/56")
        );
        assert!(canonical_cidr("10.0.0.0/33").is_none());
        assert!(canonical_cidr("10.0.0/16").is_none());
        assert!(canonical_cidr("not-a-cidr").is_none());
    }

    #[test]
    fn test_normalized_only_touches_cidr_keys() {
        let padded = AttributeValue::string("010.0.0.0/16");
        assert_eq!(
            padded.normalized("cidr_block"),
            AttributeValue::string("10.0.0.0/16")
        );
        assert_eq!(padded.normalized("description"), padded);

        let list = AttributeValue::List(vec![AttributeValue::string("0.0.0.0/00")]);
        assert_eq!(
            list.normalized("cidr_blocks"),
            AttributeValue::List(vec![AttributeValue::string("0.0.0.0/0")])
        );
    }

    #[test]
    fn test_json_round_trip_keeps_reference_text() {
        let value = AttributeValue::reference(vpc(), "id");
        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, "\"${aws_vpc.main.id}\"");
        let back: AttributeValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}

//! In-process sandbox provider.
//!
//! Emulates a cloud account: identifiers are generated per type
//! (`vpc-…`, `subnet-…`), computed outputs are synthesized, names marked
//! unique in the catalog must not collide, and force-new attributes cannot
//! change in place. Faults can be injected per address and the object set
//! can be persisted to a JSON file so separate CLI runs share one account.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{InfraplanError, ProviderError, Result, RetryableKind, StateError, TerminalKind};
use crate::model::{catalog, canonical_cidr, AttributeValue, ResourceAddress};

use super::{Provider, ProviderOutput, RemoteObject, ResourceRequest};

/// Prefix for identifiers of types missing from the catalog.
const DEFAULT_ID_PREFIX: &str = "res";

/// An object stored in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxObject {
    /// Address that created the object.
    pub address: ResourceAddress,
    /// Attributes as last written.
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Computed outputs.
    pub outputs: BTreeMap<String, AttributeValue>,
}

/// Injected failure for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Every call fails with a terminal error.
    Terminal(TerminalKind),
    /// The next `remaining` calls fail with a retryable error.
    Transient {
        /// Failure category.
        kind: RetryableKind,
        /// Calls left to fail.
        remaining: u32,
    },
}

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `read`
    Read,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Call kind.
    pub kind: CallKind,
    /// Target address.
    pub address: ResourceAddress,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SandboxAccount {
    objects: BTreeMap<String, SandboxObject>,
}

/// In-memory cloud used by tests and local runs.
#[derive(Debug, Default)]
pub struct SandboxProvider {
    account: Mutex<SandboxAccount>,
    faults: Mutex<HashMap<ResourceAddress, Fault>>,
    calls: Mutex<Vec<ProviderCall>>,
    in_flight: Mutex<HashSet<ResourceAddress>>,
    overlaps: AtomicUsize,
    peak: AtomicUsize,
    latency: Duration,
    persist_path: Option<PathBuf>,
}

impl SandboxProvider {
    /// Creates an empty sandbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a sandbox persisted at `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let account = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content).map_err(|e| {
                InfraplanError::State(StateError::Corrupted {
                    message: format!("Failed to parse sandbox file {}: {e}", path.display()),
                })
            })?
        } else {
            SandboxAccount::default()
        };

        debug!(objects = account.objects.len(), "Opened sandbox at {}", path.display());
        Ok(Self {
            account: Mutex::new(account),
            persist_path: Some(path),
            ..Self::default()
        })
    }

    /// Adds a delay to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Injects a fault for calls targeting `address`.
    pub async fn inject(&self, address: ResourceAddress, fault: Fault) {
        self.faults.lock().await.insert(address, fault);
    }

    /// Removes any fault for `address`.
    pub async fn clear_fault(&self, address: &ResourceAddress) {
        self.faults.lock().await.remove(address);
    }

    /// Returns every call made so far, in call order.
    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().await.clone()
    }

    /// Returns the stored objects keyed by identifier.
    pub async fn objects(&self) -> BTreeMap<String, SandboxObject> {
        self.account.lock().await.objects.clone()
    }

    /// Overwrites an attribute out of band, to simulate drift.
    pub async fn tamper(&self, id: &str, key: &str, value: AttributeValue) {
        if let Some(object) = self.account.lock().await.objects.get_mut(id) {
            object.attributes.insert(key.to_string(), value);
        }
    }

    /// Removes an object out of band.
    pub async fn forget(&self, id: &str) {
        self.account.lock().await.objects.remove(id);
    }

    /// Number of times two calls for one address overlapped.
    #[must_use]
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Highest number of calls in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn begin(&self, kind: CallKind, address: &ResourceAddress) {
        self.calls.lock().await.push(ProviderCall {
            kind,
            address: address.clone(),
        });

        {
            let mut in_flight = self.in_flight.lock().await;
            if !in_flight.insert(address.clone()) {
                warn!("Overlapping calls for {address}");
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            self.peak.fetch_max(in_flight.len(), Ordering::SeqCst);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    async fn finish(&self, address: &ResourceAddress) {
        self.in_flight.lock().await.remove(address);
    }

    async fn take_fault(&self, address: &ResourceAddress) -> std::result::Result<(), ProviderError> {
        let mut faults = self.faults.lock().await;
        match faults.get_mut(address) {
            None => Ok(()),
            Some(Fault::Terminal(kind)) => Err(ProviderError::terminal(
                *kind,
                format!("injected failure for {address}"),
            )),
            Some(Fault::Transient { kind, remaining }) => {
                let kind = *kind;
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    faults.remove(address);
                }
                Err(ProviderError::retryable(
                    kind,
                    format!("injected transient failure for {address}"),
                ))
            }
        }
    }

    /// Writes the account through a temporary file and a rename.
    async fn persist(&self, account: &SandboxAccount) -> std::result::Result<(), ProviderError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(account).map_err(|e| {
            ProviderError::terminal(TerminalKind::Validation, format!("Failed to encode sandbox: {e}"))
        })?;
        let write_failed = |e: std::io::Error| {
            ProviderError::retryable(RetryableKind::Network, format!("Failed to write sandbox: {e}"))
        };

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, content).await.map_err(write_failed)?;
        tokio::fs::rename(&temp_path, path).await.map_err(write_failed)
    }

    async fn create_object(
        &self,
        request: &ResourceRequest,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        self.take_fault(&request.address).await?;
        validate(request)?;

        let mut account = self.account.lock().await;
        if let Some(name) = unique_name(request) {
            let taken = account.objects.values().any(|object| {
                object.address.resource_type == request.address.resource_type
                    && unique_name_of(&object.address, &object.attributes) == Some(name)
            });
            if taken {
                return Err(ProviderError::terminal(
                    TerminalKind::Conflict,
                    format!("{} named '{name}' already exists", request.resource_type()),
                ));
            }
        }

        let uuid = Uuid::new_v4();
        let prefix = catalog::lookup(request.resource_type()).map_or(DEFAULT_ID_PREFIX, |k| k.id_prefix);
        let simple = uuid.simple().to_string();
        let id = format!("{prefix}-{}", &simple[..17]);
        let outputs = synthesize_outputs(request.resource_type(), &id, uuid.as_bytes());

        account.objects.insert(
            id.clone(),
            SandboxObject {
                address: request.address.clone(),
                attributes: request.attributes.clone(),
                outputs: outputs.clone(),
            },
        );
        if let Err(e) = self.persist(&account).await {
            account.objects.remove(&id);
            return Err(e);
        }

        debug!("Sandbox created {} as {id}", request.address);
        Ok(ProviderOutput { id, outputs })
    }

    async fn update_object(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        self.take_fault(&request.address).await?;
        validate(request)?;

        if let Some(attribute) = changed
            .iter()
            .find(|a| !self.supports_in_place_update(request.resource_type(), a))
        {
            return Err(ProviderError::terminal(
                TerminalKind::Validation,
                format!("{attribute} of {} cannot change in place", request.resource_type()),
            ));
        }

        let mut account = self.account.lock().await;
        let Some(object) = account.objects.get_mut(id) else {
            return Err(ProviderError::terminal(TerminalKind::NotFound, format!("{id} does not exist")));
        };
        let previous = std::mem::replace(&mut object.attributes, request.attributes.clone());
        let outputs = object.outputs.clone();
        if let Err(e) = self.persist(&account).await {
            if let Some(object) = account.objects.get_mut(id) {
                object.attributes = previous;
            }
            return Err(e);
        }

        debug!("Sandbox updated {} ({id})", request.address);
        Ok(ProviderOutput {
            id: id.to_string(),
            outputs,
        })
    }

    async fn delete_object(
        &self,
        address: &ResourceAddress,
        id: &str,
    ) -> std::result::Result<(), ProviderError> {
        self.take_fault(address).await?;

        let mut account = self.account.lock().await;
        let Some(removed) = account.objects.remove(id) else {
            return Err(ProviderError::terminal(TerminalKind::NotFound, format!("{id} does not exist")));
        };
        if let Err(e) = self.persist(&account).await {
            account.objects.insert(id.to_string(), removed);
            return Err(e);
        }

        debug!("Sandbox deleted {address} ({id})");
        Ok(())
    }
}

#[async_trait]
impl Provider for SandboxProvider {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    async fn create(&self, request: &ResourceRequest) -> std::result::Result<ProviderOutput, ProviderError> {
        self.begin(CallKind::Create, &request.address).await;
        let result = self.create_object(request).await;
        self.finish(&request.address).await;
        result
    }

    async fn update(
        &self,
        id: &str,
        request: &ResourceRequest,
        changed: &[String],
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        self.begin(CallKind::Update, &request.address).await;
        let result = self.update_object(id, request, changed).await;
        self.finish(&request.address).await;
        result
    }

    async fn delete(&self, address: &ResourceAddress, id: &str) -> std::result::Result<(), ProviderError> {
        self.begin(CallKind::Delete, address).await;
        let result = self.delete_object(address, id).await;
        self.finish(address).await;
        result
    }

    async fn read(
        &self,
        address: &ResourceAddress,
        id: &str,
    ) -> std::result::Result<Option<RemoteObject>, ProviderError> {
        self.begin(CallKind::Read, address).await;
        let object = self.account.lock().await.objects.get(id).cloned();
        self.finish(address).await;

        Ok(object.map(|object| RemoteObject {
            id: id.to_string(),
            attributes: object.attributes,
            outputs: object.outputs,
        }))
    }
}

/// Rejects requests a real API would reject before doing anything.
fn validate(request: &ResourceRequest) -> std::result::Result<(), ProviderError> {
    for (key, value) in &request.attributes {
        if let AttributeValue::Reference(reference) = value {
            return Err(ProviderError::terminal(
                TerminalKind::Validation,
                format!("{key} holds unresolved reference {reference}"),
            ));
        }

        if key.contains("cidr") {
            let blocks = match value {
                AttributeValue::String(s) => vec![s.as_str()],
                AttributeValue::List(items) => items.iter().filter_map(AttributeValue::as_str).collect(),
                _ => Vec::new(),
            };
            if let Some(bad) = blocks.into_iter().find(|b| canonical_cidr(b).is_none()) {
                return Err(ProviderError::terminal(
                    TerminalKind::Validation,
                    format!("{key}: '{bad}' is not a valid CIDR block"),
                ));
            }
        }
    }
    Ok(())
}

fn unique_name(request: &ResourceRequest) -> Option<&str> {
    unique_name_of(&request.address, &request.attributes)
}

fn unique_name_of<'a>(
    address: &ResourceAddress,
    attributes: &'a BTreeMap<String, AttributeValue>,
) -> Option<&'a str> {
    catalog::name_attribute(&address.resource_type)
        .and_then(|key| attributes.get(key))
        .and_then(AttributeValue::as_str)
}

fn synthesize_outputs(resource_type: &str, id: &str, seed: &[u8; 16]) -> BTreeMap<String, AttributeValue> {
    let mut outputs = BTreeMap::new();
    outputs.insert(String::from("id"), AttributeValue::string(id));
    outputs.insert(
        String::from("arn"),
        AttributeValue::string(format!("arn:aws:sandbox:::{resource_type}/{id}")),
    );

    let extra = catalog::lookup(resource_type).map_or(&[][..], |kind| kind.outputs);
    for name in extra.iter().filter(|n| **n != "arn") {
        let value = match *name {
            "public_ip" => format!("203.0.113.{}", seed[0]),
            "private_ip" => format!("10.0.{}.{}", seed[1], seed[2]),
            other => format!("{other}-{}", hex::encode(&seed[3..7])),
        };
        outputs.insert((*name).to_string(), AttributeValue::string(value));
    }
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(address: &str, attributes: &[(&str, AttributeValue)]) -> ResourceRequest {
        ResourceRequest {
            address: ResourceAddress::parse(address).unwrap(),
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_generates_prefixed_id_and_outputs() {
        let sandbox = SandboxProvider::new();
        let output = sandbox
            .create(&request("aws_vpc.main", &[("cidr_block", AttributeValue::string("10.0.0.0/16"))]))
            .await
            .unwrap();

        assert!(output.id.starts_with("vpc-"));
        assert_eq!(output.id.len(), "vpc-".len() + 17);
        assert_eq!(output.outputs["id"], AttributeValue::string(output.id.clone()));
        assert!(output.outputs.contains_key("arn"));
        assert!(output.outputs.contains_key("default_route_table_id"));
    }

    #[tokio::test]
    async fn test_unique_names_conflict() {
        let sandbox = SandboxProvider::new();
        let named = [("name", AttributeValue::string("web"))];
        sandbox.create(&request("aws_security_group.web", &named)).await.unwrap();

        let err = sandbox
            .create(&request("aws_security_group.web2", &named))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Terminal { kind: TerminalKind::Conflict, .. }));
    }

    #[tokio::test]
    async fn test_invalid_cidr_is_rejected() {
        let sandbox = SandboxProvider::new();
        let err = sandbox
            .create(&request("aws_subnet.a", &[("cidr_block", AttributeValue::string("10.0.0.0/40"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Terminal { kind: TerminalKind::Validation, .. }));
    }

    #[tokio::test]
    async fn test_force_new_attribute_cannot_update() {
        let sandbox = SandboxProvider::new();
        let created = sandbox
            .create(&request("aws_vpc.main", &[("cidr_block", AttributeValue::string("10.0.0.0/16"))]))
            .await
            .unwrap();

        let err = sandbox
            .update(
                &created.id,
                &request("aws_vpc.main", &[("cidr_block", AttributeValue::string("10.1.0.0/16"))]),
                &[String::from("cidr_block")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Terminal { kind: TerminalKind::Validation, .. }));

        let tags = AttributeValue::Map(BTreeMap::from([(
            String::from("Name"),
            AttributeValue::string("main"),
        )]));
        let updated = sandbox
            .update(
                &created.id,
                &request(
                    "aws_vpc.main",
                    &[("cidr_block", AttributeValue::string("10.0.0.0/16")), ("tags", tags)],
                ),
                &[String::from("tags")],
            )
            .await
            .unwrap();
        assert_eq!(updated.outputs, created.outputs);
    }

    #[tokio::test]
    async fn test_transient_fault_clears_after_count() {
        let sandbox = SandboxProvider::new();
        let address = ResourceAddress::new("aws_eip", "nat");
        sandbox
            .inject(
                address.clone(),
                Fault::Transient {
                    kind: RetryableKind::RateLimited,
                    remaining: 2,
                },
            )
            .await;

        let req = request("aws_eip.nat", &[]);
        assert!(sandbox.create(&req).await.unwrap_err().is_retryable());
        assert!(sandbox.create(&req).await.unwrap_err().is_retryable());
        assert!(sandbox.create(&req).await.is_ok());
        assert_eq!(sandbox.calls().await.len(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let sandbox = SandboxProvider::new();
        let err = sandbox
            .delete(&ResourceAddress::new("aws_vpc", "main"), "vpc-missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_persistence_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.json");

        let id = {
            let sandbox = SandboxProvider::open(&path).await.unwrap();
            sandbox.create(&request("aws_internet_gateway.gw", &[])).await.unwrap().id
        };

        let reopened = SandboxProvider::open(&path).await.unwrap();
        let object = reopened
            .read(&ResourceAddress::new("aws_internet_gateway", "gw"), &id)
            .await
            .unwrap();
        assert!(object.is_some());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_object_behind() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("missing").join("sandbox.json");
        let sandbox = SandboxProvider::open(&path).await.unwrap();
        let req = request("aws_security_group.web", &[("name", AttributeValue::string("web"))]);

        let err = sandbox.create(&req).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(sandbox.objects().await.is_empty());

        std::fs::create_dir_all(dir.path().join("missing")).unwrap();
        let id = sandbox.create(&req).await.unwrap().id;
        assert!(sandbox.objects().await.contains_key(&id));
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_deleted_object() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sandbox.json");
        let sandbox = SandboxProvider::open(&path).await.unwrap();
        let address = ResourceAddress::new("aws_internet_gateway", "gw");
        let id = sandbox.create(&request("aws_internet_gateway.gw", &[])).await.unwrap().id;

        std::fs::remove_dir_all(dir.path()).unwrap();
        assert!(sandbox.delete(&address, &id).await.unwrap_err().is_retryable());
        assert!(sandbox.objects().await.contains_key(&id));
    }
}

//! Declaration file types.
//!
//! This module defines the structs that map to `infraplan.yaml`. The file
//! fully describes the desired infrastructure plus the settings of a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PlanError;
use crate::model::{AttributeValue, LifecycleOptions, Resource, ResourceAddress, ResourceModel};
use crate::planner::ApplySettings;

/// Default location of the local state file.
pub const DEFAULT_STATE_PATH: &str = ".infraplan/state.json";

/// Default location of the persisted sandbox.
pub const DEFAULT_SANDBOX_PATH: &str = ".infraplan/sandbox.json";

/// The root of a declaration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeclarationFile {
    /// Project-level settings.
    pub project: ProjectConfig,
    /// State backend settings.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider settings.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Apply concurrency and retry settings.
    #[serde(default)]
    pub apply: ApplyConfig,
    /// Declaration policy checked by the validator.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Project-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Region the resources live in.
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State file path (local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// JSON file on local disk.
    #[default]
    Local,
    /// Process memory; nothing survives the run.
    Memory,
}

/// Provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProviderConfig {
    /// File the sandbox provider persists its objects to.
    #[serde(default)]
    pub sandbox_path: Option<String>,
}

/// Apply concurrency and retry settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApplyConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per action, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Retry backoff.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Exponential backoff bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_ms: u64,
}

/// Declaration policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Tags every taggable resource must carry.
    #[serde(default)]
    pub required_tags: Vec<String>,
    /// Ports that must not be open to the whole internet.
    #[serde(default = "default_admin_ports")]
    pub admin_ports: Vec<u16>,
}

/// One declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Resource type (e.g., `aws_subnet`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
    /// Declared attributes. Whole-string `${type.name.output}` values are references.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Extra dependencies, as `type.name` addresses.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Replacement and comparison options.
    #[serde(default)]
    pub lifecycle: LifecycleOptions,
}

// Default value functions

const fn default_workers() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_backoff_ms() -> u64 {
    200
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_admin_ports() -> Vec<u16> {
    vec![22, 3389]
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_backoff_ms(),
            max_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            required_tags: Vec::new(),
            admin_ports: default_admin_ports(),
        }
    }
}

impl DeclarationFile {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Builds the resource model from the declared resources.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` for malformed types, names or `depends_on`
    /// entries, and `DuplicateAddress` if an address repeats.
    pub fn to_model(&self) -> Result<ResourceModel, PlanError> {
        let mut model = ResourceModel::new();
        for spec in &self.resources {
            model.declare(spec.to_resource()?)?;
        }
        Ok(model)
    }

    /// Returns the state file path.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        PathBuf::from(self.state.path.as_deref().unwrap_or(DEFAULT_STATE_PATH))
    }

    /// Returns the sandbox persistence path.
    #[must_use]
    pub fn sandbox_path(&self) -> PathBuf {
        PathBuf::from(
            self.provider
                .sandbox_path
                .as_deref()
                .unwrap_or(DEFAULT_SANDBOX_PATH),
        )
    }
}

impl ApplyConfig {
    /// Converts to executor settings.
    #[must_use]
    pub const fn settings(&self) -> ApplySettings {
        ApplySettings {
            workers: self.workers,
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.backoff.initial_ms),
            max_backoff: Duration::from_millis(self.backoff.max_ms),
        }
    }
}

impl ResourceSpec {
    /// Returns the `type.name` address text.
    #[must_use]
    pub fn address_text(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Converts to a typed resource.
    ///
    /// # Errors
    ///
    /// Returns `InvalidAddress` if the address or a `depends_on` entry is
    /// malformed.
    pub fn to_resource(&self) -> Result<Resource, PlanError> {
        let address = ResourceAddress::parse(&self.address_text())?;
        let depends_on = self
            .depends_on
            .iter()
            .map(|text| ResourceAddress::parse(text))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Resource {
            address,
            attributes: self.attributes.clone(),
            depends_on,
            lifecycle: self.lifecycle.clone(),
        })
    }
}

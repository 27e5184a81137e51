//! Configuration module for infraplan.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `infraplan.yaml`
//! - Validation of declarations and policy
//! - Computing declaration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    ApplyConfig, BackoffConfig, DeclarationFile, PolicyConfig, ProjectConfig, ProviderConfig,
    ResourceSpec, StateBackend, StateConfig, DEFAULT_SANDBOX_PATH, DEFAULT_STATE_PATH,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};

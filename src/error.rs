//! Error types for the infraplan convergence planner.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, state storage, provider calls, planning, and apply.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::planner::ActionStatus;

/// The main error type for infraplan.
#[derive(Debug, Error)]
pub enum InfraplanError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The declaration file was not found.
    #[error("Declaration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The declaration file could not be parsed.
    #[error("Failed to parse declarations: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Declaration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// An environment override holds an unusable value.
    #[error("Invalid value for environment variable {name}: {message}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// Why the value was rejected.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Writing the state failed.
    #[error("Failed to write state: {message}")]
    WriteFailed {
        /// Description of the write failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Category of a transient provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryableKind {
    /// The provider throttled the request.
    RateLimited,
    /// The request timed out.
    Timeout,
    /// A transient network failure.
    Network,
}

/// Category of a permanent provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    /// The request was rejected as invalid.
    Validation,
    /// The caller lacks permission.
    PermissionDenied,
    /// The request conflicts with existing infrastructure.
    Conflict,
    /// The target object does not exist.
    NotFound,
    /// The provider does not handle this resource type.
    Unsupported,
}

/// Errors returned by a provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// A transient failure; the call may be retried.
    #[error("{kind} (retryable): {message}")]
    Retryable {
        /// Failure category.
        kind: RetryableKind,
        /// Provider message.
        message: String,
        /// Delay requested by the provider, if any.
        retry_after: Option<Duration>,
    },

    /// A permanent failure; retrying will not help.
    #[error("{kind}: {message}")]
    Terminal {
        /// Failure category.
        kind: TerminalKind,
        /// Provider message.
        message: String,
    },
}

/// Planning errors. All of them abort before any apply action runs.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Two resources share an address.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// A resource refers to an address that is not declared.
    #[error("{from} references undeclared resource {to}")]
    UnknownReference {
        /// Address holding the reference.
        from: String,
        /// Missing target address.
        to: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Nodes along the cycle, first node repeated at the end.
        cycle: Vec<String>,
    },

    /// A resource address or reference could not be parsed.
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress {
        /// The offending text.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The state changed after the plan was computed.
    #[error("Plan is stale: computed against state serial {planned}, state is now at {current}")]
    StalePlan {
        /// Serial the plan was computed against.
        planned: u64,
        /// Current serial.
        current: u64,
    },

    /// A reference was still deferred when its consumer became ready.
    #[error("{address} has unresolved reference {reference}")]
    UnresolvedReference {
        /// Consuming resource.
        address: String,
        /// Reference text.
        reference: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// A retryable failure persisted past the attempt budget.
    #[error("{address} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// Resource address.
        address: String,
        /// Attempts made.
        attempts: u32,
        /// Last provider message.
        message: String,
    },

    /// Some actions failed or were skipped.
    #[error(
        "Apply partially failed: {} succeeded, {} failed, {} skipped",
        count(statuses, ActionStatus::Succeeded),
        count(statuses, ActionStatus::Failed),
        count(statuses, ActionStatus::Skipped)
    )]
    PartialApplyFailure {
        /// Final status per address.
        statuses: BTreeMap<String, ActionStatus>,
    },
}

fn count(statuses: &BTreeMap<String, ActionStatus>, wanted: ActionStatus) -> usize {
    statuses.values().filter(|s| **s == wanted).count()
}

/// Result type alias for infraplan operations.
pub type Result<T> = std::result::Result<T, InfraplanError>;

impl InfraplanError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(ProviderError::Retryable { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a write error with the given message.
    #[must_use]
    pub fn write(message: impl Into<String>) -> Self {
        Self::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(kind: RetryableKind, message: impl Into<String>) -> Self {
        Self::Retryable {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a terminal error.
    #[must_use]
    pub fn terminal(kind: TerminalKind, message: impl Into<String>) -> Self {
        Self::Terminal {
            kind,
            message: message.into(),
        }
    }

    /// Returns true if the call may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Returns the delay the provider asked for, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Retryable { retry_after, .. } => *retry_after,
            Self::Terminal { .. } => None,
        }
    }

    /// Returns true if the target object does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Terminal {
                kind: TerminalKind::NotFound,
                ..
            }
        )
    }
}

impl std::fmt::Display for RetryableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RateLimited => "rate limited",
            Self::Timeout => "timeout",
            Self::Network => "network error",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation failed",
            Self::PermissionDenied => "permission denied",
            Self::Conflict => "conflict",
            Self::NotFound => "not found",
            Self::Unsupported => "unsupported",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_joins_path() {
        let err = PlanError::CyclicDependency {
            cycle: vec![
                String::from("aws_security_group.a"),
                String::from("aws_security_group.b"),
                String::from("aws_security_group.a"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "Cyclic dependency: aws_security_group.a -> aws_security_group.b -> aws_security_group.a"
        );
    }

    #[test]
    fn test_provider_retryability() {
        assert!(ProviderError::retryable(RetryableKind::RateLimited, "slow down").is_retryable());
        assert!(!ProviderError::terminal(TerminalKind::Validation, "bad cidr").is_retryable());
        assert!(ProviderError::terminal(TerminalKind::NotFound, "gone").is_not_found());
    }

    #[test]
    fn test_partial_failure_counts() {
        let mut statuses = BTreeMap::new();
        statuses.insert(String::from("aws_vpc.main"), ActionStatus::Succeeded);
        statuses.insert(String::from("aws_subnet.a"), ActionStatus::Failed);
        statuses.insert(String::from("aws_route_table.a"), ActionStatus::Skipped);

        let err = ApplyError::PartialApplyFailure { statuses };
        assert_eq!(
            err.to_string(),
            "Apply partially failed: 1 succeeded, 1 failed, 1 skipped"
        );
    }
}

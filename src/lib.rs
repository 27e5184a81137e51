// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # infraplan
//!
//! A declarative dependency resolution and convergence planner for cloud
//! infrastructure.
//!
//! ## Overview
//!
//! infraplan takes typed resource declarations (VPCs, subnets, route tables,
//! security groups, NAT gateways, databases, instances and the like) and:
//!
//! - Derives the dependency graph from attribute references and `depends_on`
//! - Diffs the declarations against the last observed state
//! - Computes an ordered create/update/delete plan, replacements included
//! - Applies the plan with bounded concurrency, retries and failure isolation
//!
//! ## Architecture
//!
//! The system is built around the concept of **desired state convergence**:
//!
//! 1. **Desired State**: Declared in `infraplan.yaml`
//! 2. **Observed State**: Recorded by the state store after every action
//! 3. **Reconciler**: Plans the difference and applies it through a provider
//!
//! ## Modules
//!
//! - [`model`]: Addresses, attribute values, references and the resource catalog
//! - [`config`]: Declaration parsing, validation and hashing
//! - [`state`]: State storage backends (local file, memory)
//! - [`provider`]: Provider trait and the in-process sandbox
//! - [`planner`]: Dependency graph, ordering, diff, plan and apply executor
//! - [`reconciler`]: One full plan-and-apply cycle, drift checks
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: network
//!   environment: prod
//!
//! resources:
//!   - type: aws_vpc
//!     name: main
//!     attributes:
//!       cidr_block: 10.0.0.0/16
//!   - type: aws_subnet
//!     name: public_a
//!     attributes:
//!       vpc_id: "${aws_vpc.main.id}"
//!       cidr_block: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeclarationFile};
pub use error::{InfraplanError, Result};
pub use model::{AttributeValue, Resource, ResourceAddress, ResourceModel};
pub use planner::{ApplyExecutor, DependencyGraph, DiffEngine, Plan};
pub use provider::{Provider, SandboxProvider};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, ObservedState, StateStore};

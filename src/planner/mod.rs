//! Planning and apply.
//!
//! This module builds the dependency graph of the declarations, compares
//! declared and observed states, turns the differences into an ordered plan
//! of actions, and executes that plan against a provider.

mod diff;
mod executor;
mod graph;
mod order;
mod plan;

pub use diff::{
    AttributeChange, DeposedDiff, DiffEngine, DiffResult, DiffType, ReplaceStrategy, ResourceDiff,
};
pub use executor::{ActionReport, ActionStatus, ApplyExecutor, ApplyReport, ApplySettings};
pub use graph::{DependencyGraph, Edge, EdgeKind};
pub use plan::{ActionKind, Plan, PlanSummary, PlannedAction};

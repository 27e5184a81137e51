//! Diff engine for comparing declared vs observed state.
//!
//! Resources are visited in creation order so that, by the time a resource
//! is compared, every resource it references has been classified. A
//! reference to a resource that will be created or replaced cannot be known
//! until apply; it counts as a change and shows as `(known after apply)`.

use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::error::PlanError;
use crate::model::{
    AttributeValue, OutputSource, Resolved, Resource, ResourceAddress, ResourceModel,
};
use crate::provider::Provider;
use crate::state::{DeposedObject, ObservedState, ResourceState};

use super::graph::DependencyGraph;

/// Engine for computing diffs between declared and observed states.
pub struct DiffEngine<'a> {
    provider: &'a dyn Provider,
}

/// How a replacement sequences the old and new objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceStrategy {
    /// Delete the old object, then create the new one.
    DeleteBeforeCreate,
    /// Create the new object, then delete the old one.
    CreateBeforeDestroy,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Declared but not observed.
    Create,
    /// Changed attributes can all be updated in place.
    Update,
    /// At least one changed attribute forces a new object.
    Replace(ReplaceStrategy),
    /// Observed but no longer declared.
    Delete,
    /// Declared and observed values match.
    NoChange,
}

/// One attribute that differs.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    /// Attribute key.
    pub key: String,
    /// Value in the observed state.
    pub old: Option<AttributeValue>,
    /// Declared value, possibly not known until apply.
    pub new: Option<Resolved>,
    /// True if this change alone requires a new object.
    pub forces_replacement: bool,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource address.
    pub address: ResourceAddress,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Attribute-level differences.
    pub changes: Vec<AttributeChange>,
}

/// An object left over by an interrupted create-before-destroy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeposedDiff {
    /// Resource the object belonged to.
    pub address: ResourceAddress,
    /// The object to delete.
    pub object: DeposedObject,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// Declared resources in creation order, then removed ones in
    /// deletion order.
    pub diffs: Vec<ResourceDiff>,
    /// Leftover deposed objects.
    pub deposed: Vec<DeposedDiff>,
}

/// Outputs visible while planning: those of the observed state, except for
/// resources that will get a new object.
struct PlanningOutputs<'s> {
    state: &'s ObservedState,
    unknown: &'s HashSet<ResourceAddress>,
}

impl OutputSource for PlanningOutputs<'_> {
    fn output(&self, address: &ResourceAddress, name: &str) -> Option<AttributeValue> {
        if self.unknown.contains(address) {
            return None;
        }
        self.state.output(address, name)
    }
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine that asks `provider` which changes are in place.
    #[must_use]
    pub fn new(provider: &'a dyn Provider) -> Self {
        Self { provider }
    }

    /// Computes the diff between the declared model and observed state.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the graph cannot be ordered.
    pub fn compute_diff(
        &self,
        model: &ResourceModel,
        graph: &DependencyGraph,
        state: &ObservedState,
    ) -> Result<DiffResult, PlanError> {
        let mut unknown: HashSet<ResourceAddress> = HashSet::new();
        let mut diffs = Vec::with_capacity(model.len());

        for address in graph.creation_order()? {
            let Some(resource) = model.get(&address) else {
                continue;
            };
            let outputs = PlanningOutputs {
                state,
                unknown: &unknown,
            };
            let diff = self.compute_resource_diff(resource, state.get(&address), &outputs);
            if matches!(diff.diff_type, DiffType::Create | DiffType::Replace(_)) {
                unknown.insert(address);
            }
            diffs.push(diff);
        }

        let recorded = DependencyGraph::from_observed(state);
        propagate_create_before_destroy(graph, &recorded, &mut diffs);

        for address in recorded.deletion_order()? {
            if model.contains(&address) {
                continue;
            }
            debug!("{address} is no longer declared");
            let changes = state
                .get(&address)
                .map(|entry| {
                    entry
                        .attributes
                        .iter()
                        .map(|(key, value)| AttributeChange {
                            key: key.clone(),
                            old: Some(value.clone()),
                            new: None,
                            forces_replacement: false,
                        })
                        .collect()
                })
                .unwrap_or_default();
            diffs.push(ResourceDiff {
                address,
                diff_type: DiffType::Delete,
                changes,
            });
        }

        let deposed = state
            .iter()
            .flat_map(|entry| {
                entry.deposed.iter().map(|object| DeposedDiff {
                    address: entry.address.clone(),
                    object: object.clone(),
                })
            })
            .collect();

        Ok(DiffResult { diffs, deposed })
    }

    fn compute_resource_diff(
        &self,
        resource: &Resource,
        observed: Option<&ResourceState>,
        outputs: &dyn OutputSource,
    ) -> ResourceDiff {
        let address = resource.address.clone();

        let Some(observed) = observed else {
            debug!("{address} needs to be created");
            let changes = resource
                .attributes
                .iter()
                .filter(|(key, _)| !key.starts_with('_'))
                .map(|(key, value)| AttributeChange {
                    key: key.clone(),
                    old: None,
                    new: Some(value.resolve(outputs)),
                    forces_replacement: false,
                })
                .collect();
            return ResourceDiff {
                address,
                diff_type: DiffType::Create,
                changes,
            };
        };

        let lifecycle = &resource.lifecycle;
        let keys: BTreeSet<&String> = resource
            .attributes
            .keys()
            .chain(observed.attributes.keys())
            .filter(|key| !key.starts_with('_') && !lifecycle.ignore_changes.contains(key))
            .collect();

        let mut changes = Vec::new();
        for key in keys {
            let new = resource.attributes.get(key).map(|value| value.resolve(outputs));
            let old = observed.attributes.get(key);

            let same = match (&new, old) {
                (Some(Resolved::Known(new)), Some(old)) => new.normalized(key) == old.normalized(key),
                (None, None) => true,
                _ => false,
            };
            if same {
                continue;
            }

            let forces_replacement = lifecycle.replace_on.contains(key)
                || !self.provider.supports_in_place_update(resource.resource_type(), key);
            changes.push(AttributeChange {
                key: key.clone(),
                old: old.cloned(),
                new,
                forces_replacement,
            });
        }

        let diff_type = if changes.is_empty() {
            DiffType::NoChange
        } else if changes.iter().any(|c| c.forces_replacement) {
            DiffType::Replace(if lifecycle.create_before_destroy {
                ReplaceStrategy::CreateBeforeDestroy
            } else {
                ReplaceStrategy::DeleteBeforeCreate
            })
        } else {
            DiffType::Update
        };

        debug!("{address}: {diff_type} ({} changed)", changes.len());
        ResourceDiff {
            address,
            diff_type,
            changes,
        }
    }
}

/// A resource replaced create-before-destroy needs its replaced
/// dependencies to be replaced the same way: its old object still uses the
/// old dependency until it is deleted, after the new dependency exists.
/// Both the declared dependencies and those recorded for the old object
/// count.
fn propagate_create_before_destroy(
    declared: &DependencyGraph,
    recorded: &DependencyGraph,
    diffs: &mut [ResourceDiff],
) {
    let position: HashMap<ResourceAddress, usize> = diffs
        .iter()
        .enumerate()
        .map(|(i, d)| (d.address.clone(), i))
        .collect();

    let mut pending: Vec<usize> = diffs
        .iter()
        .enumerate()
        .filter(|(_, d)| d.diff_type == DiffType::Replace(ReplaceStrategy::CreateBeforeDestroy))
        .map(|(i, _)| i)
        .collect();

    while let Some(i) = pending.pop() {
        let address = diffs[i].address.clone();
        let dependencies: BTreeSet<ResourceAddress> = declared
            .dependencies_of(&address)
            .into_iter()
            .chain(recorded.dependencies_of(&address))
            .cloned()
            .collect();

        for dependency in dependencies {
            let Some(&j) = position.get(&dependency) else {
                continue;
            };
            if diffs[j].diff_type == DiffType::Replace(ReplaceStrategy::DeleteBeforeCreate) {
                debug!("{dependency} replaced create-before-destroy because {address} is");
                diffs[j].diff_type = DiffType::Replace(ReplaceStrategy::CreateBeforeDestroy);
                pending.push(j);
            }
        }
    }
}

impl DiffResult {
    /// Returns true if any action is required.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.deposed.is_empty() || self.diffs.iter().any(|d| d.diff_type != DiffType::NoChange)
    }

    /// Counts diffs of a given type.
    #[must_use]
    pub fn count(&self, diff_type: DiffType) -> usize {
        self.diffs.iter().filter(|d| d.diff_type == diff_type).count()
    }

    /// Counts replacements of either strategy.
    #[must_use]
    pub fn replacements(&self) -> usize {
        self.diffs
            .iter()
            .filter(|d| matches!(d.diff_type, DiffType::Replace(_)))
            .count()
    }

    /// Finds the diff of an address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.address == *address)
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace(ReplaceStrategy::DeleteBeforeCreate) => "replace",
            Self::Replace(ReplaceStrategy::CreateBeforeDestroy) => "replace (create before destroy)",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let old = self.old.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
        let new = self.new.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
        write!(f, "{}: {old} -> {new}", self.key)?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.address, self.diff_type)?;
        if !self.changes.is_empty() {
            write!(f, " (")?;
            for (i, change) in self.changes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", change.key)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

//! Plan types and construction.
//!
//! A plan is an ordered list of actions plus the dependencies between them.
//! Actions are listed in a valid execution order: deletes of removed and
//! replaced objects first (dependents before their dependencies), then
//! creates and updates in creation order. The dependencies, not the list
//! order, decide what may run concurrently.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::PlanError;
use crate::model::{AttributeValue, ResourceAddress, ResourceModel};
use crate::state::ObservedState;

use super::diff::{AttributeChange, DiffResult, DiffType, ReplaceStrategy, ResourceDiff};
use super::graph::DependencyGraph;
use super::order::kahn;

/// A complete plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the declarations this plan is based on.
    pub declaration_hash: String,
    /// Serial of the state this plan was computed against.
    pub state_serial: u64,
    /// Planned actions in execution order.
    pub actions: Vec<PlannedAction>,
}

/// A single planned action.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    /// Resource address.
    pub address: ResourceAddress,
    /// Action type.
    pub kind: ActionKind,
    /// Set when the action is half of a replacement.
    pub replace: Option<ReplaceStrategy>,
    /// Provider id of the object acted upon, for updates and deletes.
    pub object_id: Option<String>,
    /// True if the delete targets a deposed object rather than the current one.
    pub deposed: bool,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// Declared attributes, references unresolved.
    pub desired: BTreeMap<String, AttributeValue>,
    /// Resources this one depends on once applied.
    pub requires: Vec<ResourceAddress>,
    /// Declaration index of the resource.
    pub ordinal: usize,
    /// Indices of actions that must succeed first.
    pub dependencies: Vec<usize>,
    /// Reason for this action.
    pub reason: String,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionKind {
    /// Create a new object.
    Create,
    /// Update an object in place.
    Update,
    /// Delete an object.
    Delete,
    /// Already matches the declaration.
    NoOp,
}

/// Per-kind action counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    /// Objects to create, including replacements.
    pub to_add: usize,
    /// Objects to update in place.
    pub to_change: usize,
    /// Objects to delete, including replaced ones.
    pub to_destroy: usize,
    /// Resources already up to date.
    pub unchanged: usize,
}

/// Accumulates actions and their dependencies before ordering.
#[derive(Default)]
struct ActionGraph {
    actions: Vec<PlannedAction>,
    dependencies: Vec<BTreeSet<usize>>,
    /// Create, update or no-op action of each declared resource.
    apply: HashMap<ResourceAddress, usize>,
    /// Delete of the current object of each removed or replaced resource.
    delete: HashMap<ResourceAddress, usize>,
    /// Actions on the same address, in the order they must run.
    sequence: HashMap<ResourceAddress, Vec<usize>>,
    /// Deletes of deposed objects, run before anything else on the address.
    leftovers: HashMap<ResourceAddress, Vec<usize>>,
}

impl Plan {
    /// Creates a plan from a diff result.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the actions cannot be ordered.
    pub fn from_diff(
        diff: &DiffResult,
        model: &ResourceModel,
        graph: &DependencyGraph,
        state: &ObservedState,
        declaration_hash: &str,
    ) -> Result<Self, PlanError> {
        let observed = DependencyGraph::from_observed(state);
        let mut builder = ActionGraph::default();

        for resource_diff in &diff.diffs {
            builder.add_diff(resource_diff, model, graph, state);
        }
        for leftover in &diff.deposed {
            let ordinal = state.get(&leftover.address).map_or(0, |e| e.ordinal);
            let index = builder.push(PlannedAction {
                object_id: Some(leftover.object.id.clone()),
                deposed: true,
                ordinal,
                reason: format!("deposed object {} left by an interrupted replacement", leftover.object.id),
                ..PlannedAction::new(leftover.address.clone(), ActionKind::Delete)
            });
            builder.leftovers.entry(leftover.address.clone()).or_default().push(index);
        }

        builder.link(graph, &observed);

        let creation: HashMap<ResourceAddress, usize> = graph
            .creation_order()?
            .into_iter()
            .enumerate()
            .map(|(i, a)| (a, i))
            .collect();
        let deletion: HashMap<ResourceAddress, usize> = observed
            .deletion_order()?
            .into_iter()
            .enumerate()
            .map(|(i, a)| (a, i))
            .collect();

        let actions = builder.into_ordered(|action| {
            if action.kind == ActionKind::Delete {
                (0, deletion.get(&action.address).copied().unwrap_or(usize::MAX))
            } else {
                (1, creation.get(&action.address).copied().unwrap_or(usize::MAX))
            }
        })?;

        Ok(Self {
            created_at: Utc::now(),
            declaration_hash: declaration_hash.to_string(),
            state_serial: state.serial,
            actions,
        })
    }

    /// Returns true if any action other than a no-op is planned.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.kind != ActionKind::NoOp)
    }

    /// Returns the number of actions.
    #[must_use]
    pub const fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Counts actions of one kind.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Returns per-kind counts.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            to_add: self.count(ActionKind::Create),
            to_change: self.count(ActionKind::Update),
            to_destroy: self.count(ActionKind::Delete),
            unchanged: self.count(ActionKind::NoOp),
        }
    }
}

impl ActionGraph {
    fn push(&mut self, action: PlannedAction) -> usize {
        self.actions.push(action);
        self.dependencies.push(BTreeSet::new());
        self.actions.len() - 1
    }

    fn add_diff(
        &mut self,
        diff: &ResourceDiff,
        model: &ResourceModel,
        graph: &DependencyGraph,
        state: &ObservedState,
    ) {
        let address = &diff.address;
        let observed = state.get(address);
        let object_id = observed.map(|e| e.id.clone());

        let applied = |kind: ActionKind, reason: String| {
            let mut action = PlannedAction::new(address.clone(), kind);
            if let Some(resource) = model.get(address) {
                action.desired.clone_from(&resource.attributes);
            }
            action.changes.clone_from(&diff.changes);
            action.requires = graph.dependencies_of(address).into_iter().cloned().collect();
            action.ordinal = model.position(address).unwrap_or_default();
            action.reason = reason;
            action
        };

        match diff.diff_type {
            DiffType::Create => {
                let index = self.push(applied(ActionKind::Create, String::from("not yet created")));
                self.apply.insert(address.clone(), index);
            }
            DiffType::Update => {
                let keys: Vec<&str> = diff.changes.iter().map(|c| c.key.as_str()).collect();
                let index = self.push(PlannedAction {
                    object_id,
                    ..applied(ActionKind::Update, format!("update in place: {}", keys.join(", ")))
                });
                self.apply.insert(address.clone(), index);
            }
            DiffType::NoChange => {
                let index = self.push(PlannedAction {
                    object_id,
                    ..applied(ActionKind::NoOp, String::from("up to date"))
                });
                self.apply.insert(address.clone(), index);
            }
            DiffType::Replace(strategy) => {
                let forcing: Vec<&str> = diff
                    .changes
                    .iter()
                    .filter(|c| c.forces_replacement)
                    .map(|c| c.key.as_str())
                    .collect();
                let reason = format!("{} forces replacement", forcing.join(", "));

                let create = PlannedAction {
                    replace: Some(strategy),
                    ..applied(ActionKind::Create, reason.clone())
                };
                let delete = PlannedAction {
                    replace: Some(strategy),
                    object_id,
                    deposed: strategy == ReplaceStrategy::CreateBeforeDestroy,
                    ordinal: observed.map_or(0, |e| e.ordinal),
                    reason,
                    ..PlannedAction::new(address.clone(), ActionKind::Delete)
                };

                let (first, second) = match strategy {
                    ReplaceStrategy::DeleteBeforeCreate => {
                        let d = self.push(delete);
                        (d, self.push(create))
                    }
                    ReplaceStrategy::CreateBeforeDestroy => {
                        let c = self.push(create);
                        (c, self.push(delete))
                    }
                };
                let (create, delete) = match strategy {
                    ReplaceStrategy::DeleteBeforeCreate => (second, first),
                    ReplaceStrategy::CreateBeforeDestroy => (first, second),
                };
                self.apply.insert(address.clone(), create);
                self.delete.insert(address.clone(), delete);
                self.sequence.insert(address.clone(), vec![first, second]);
            }
            DiffType::Delete => {
                let index = self.push(PlannedAction {
                    object_id,
                    changes: diff.changes.clone(),
                    ordinal: observed.map_or(0, |e| e.ordinal),
                    reason: String::from("no longer declared"),
                    ..PlannedAction::new(address.clone(), ActionKind::Delete)
                });
                self.delete.insert(address.clone(), index);
                self.sequence.insert(address.clone(), vec![index]);
            }
        }
    }

    /// Adds the dependencies between actions.
    fn link(&mut self, graph: &DependencyGraph, observed: &DependencyGraph) {
        // Applies wait for the applies of their dependencies.
        for (address, &index) in &self.apply {
            for dependency in graph.dependencies_of(address) {
                if let Some(&other) = self.apply.get(dependency) {
                    self.dependencies[index].insert(other);
                }
            }
        }

        // An old object goes only after everything that used it is gone or
        // has been pointed elsewhere. A delete-before-create does not wait
        // for updates: those updates need the new object.
        for (address, &index) in &self.delete {
            let waits_for_updates =
                self.actions[index].replace != Some(ReplaceStrategy::DeleteBeforeCreate);
            for dependent in observed.dependents_of(address) {
                if let Some(&other) = self.delete.get(dependent) {
                    self.dependencies[index].insert(other);
                } else if waits_for_updates
                    && let Some(&other) = self.apply.get(dependent)
                    && self.actions[other].kind == ActionKind::Update
                {
                    self.dependencies[index].insert(other);
                }
            }
        }

        // One action at a time per address.
        let addresses: BTreeSet<&ResourceAddress> =
            self.sequence.keys().chain(self.leftovers.keys()).collect();
        for address in addresses {
            let chain: Vec<usize> = self
                .leftovers
                .get(address)
                .into_iter()
                .flatten()
                .chain(self.sequence.get(address).into_iter().flatten())
                .copied()
                .collect();
            for pair in chain.windows(2) {
                self.dependencies[pair[1]].insert(pair[0]);
            }
        }
    }

    /// Orders the actions and rewrites dependencies to final indices.
    fn into_ordered<K, F>(self, key: F) -> Result<Vec<PlannedAction>, PlanError>
    where
        K: Ord,
        F: Fn(&PlannedAction) -> K,
    {
        let order = kahn(&self.dependencies, |i| (key(&self.actions[i]), i)).map_err(|cycle| {
            PlanError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|i| format!("{} {}", self.actions[i].kind, self.actions[i].address))
                    .collect(),
            }
        })?;

        let mut position = vec![0; order.len()];
        for (new, &old) in order.iter().enumerate() {
            position[old] = new;
        }

        let mut slots: Vec<Option<PlannedAction>> = self.actions.into_iter().map(Some).collect();
        Ok(order
            .iter()
            .filter_map(|&old| {
                let mut action = slots[old].take()?;
                let mut dependencies: Vec<usize> =
                    self.dependencies[old].iter().map(|&d| position[d]).collect();
                dependencies.sort_unstable();
                action.dependencies = dependencies;
                Some(action)
            })
            .collect())
    }
}

impl PlannedAction {
    fn new(address: ResourceAddress, kind: ActionKind) -> Self {
        Self {
            address,
            kind,
            replace: None,
            object_id: None,
            deposed: false,
            changes: Vec::new(),
            desired: BTreeMap::new(),
            requires: Vec::new(),
            ordinal: 0,
            dependencies: Vec::new(),
            reason: String::new(),
        }
    }

    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.kind, self.deposed) {
            (ActionKind::Create, _) => format!("Create {}", self.address),
            (ActionKind::Update, _) => format!("Update {} in place", self.address),
            (ActionKind::Delete, true) => format!(
                "Delete deposed object {} of {}",
                self.object_id.as_deref().unwrap_or("?"),
                self.address
            ),
            (ActionKind::Delete, false) => format!("Delete {}", self.address),
            (ActionKind::NoOp, _) => format!("No change for {}", self.address),
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.address)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to add, {} to change, {} to destroy",
            self.to_add, self.to_change, self.to_destroy
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({}):", self.summary())?;
        for (i, action) in self.actions.iter().enumerate() {
            if action.kind == ActionKind::NoOp {
                continue;
            }
            writeln!(f, "  {i}. {action}")?;
        }
        Ok(())
    }
}

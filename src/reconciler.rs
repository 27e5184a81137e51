//! Reconciler for converging infrastructure on its declarations.
//!
//! This module runs one full cycle: load the observed state, diff it against
//! the declarations, assemble a plan, execute it against the provider and
//! record the run in the state history. It also answers read-only questions
//! (drift, dependency waves) and edits state without touching the provider.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigHasher, DeclarationFile};
use crate::error::{ApplyError, PlanError, Result};
use crate::model::{catalog, AttributeValue, ResourceAddress, ResourceModel};
use crate::planner::{
    ActionKind, ActionStatus, ApplyExecutor, ApplyReport, ApplySettings, DependencyGraph,
    DiffEngine, Plan,
};
use crate::provider::{Provider, RemoteObject};
use crate::state::{HistoryEntry, ObservedState, Operation, ResourceState, StateStore};

/// Reconciler for one set of declarations.
pub struct Reconciler {
    /// Declared resources.
    model: ResourceModel,
    /// Hash of the declarations, recorded with every run.
    declaration_hash: String,
    /// Provider the plan is applied against.
    provider: Arc<dyn Provider>,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Apply concurrency and retry settings.
    settings: ApplySettings,
}

/// Result of a reconciliation run.
#[derive(Debug, serde::Serialize)]
pub struct ReconciliationResult {
    /// Whether every action succeeded.
    pub success: bool,
    /// Objects created.
    pub created: usize,
    /// Objects updated in place.
    pub updated: usize,
    /// Objects deleted.
    pub deleted: usize,
    /// Resources that were already up to date.
    pub unchanged: usize,
    /// Actions that failed.
    pub failed: usize,
    /// Actions skipped because a dependency failed.
    pub skipped: usize,
    /// Final status per address.
    pub statuses: BTreeMap<String, ActionStatus>,
    /// Errors encountered.
    pub errors: Vec<String>,
    /// Wall time of the apply, in milliseconds.
    pub duration_ms: u64,
}

/// Report of drift detection.
#[derive(Debug, serde::Serialize)]
pub struct DriftReport {
    /// Whether drift was detected.
    pub has_drift: bool,
    /// Resources whose objects no longer match state.
    pub drifted: Vec<DriftedResource>,
    /// Declared resources with no entry in state yet.
    pub pending: Vec<String>,
    /// Total number of declared resources.
    pub total_resources: usize,
    /// Number of resources recorded in state.
    pub observed_count: usize,
}

/// A resource whose object differs from its state entry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DriftedResource {
    /// Resource address.
    pub address: String,
    /// Provider identifier recorded in state.
    pub id: String,
    /// What differs.
    pub drift: Drift,
}

/// Kind of drift.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    /// The object no longer exists.
    Missing,
    /// Attributes were changed outside of infraplan.
    Changed {
        /// Attributes that differ.
        attributes: Vec<String>,
    },
}

impl Reconciler {
    /// Creates a reconciler with default apply settings.
    #[must_use]
    pub fn new(
        model: ResourceModel,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let declaration_hash = ConfigHasher::new().hash_model(&model);
        Self {
            model,
            declaration_hash,
            provider,
            store,
            settings: ApplySettings::default(),
        }
    }

    /// Creates a reconciler from a parsed declaration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the declared resources do not form a valid model.
    pub fn from_declarations(
        declarations: &DeclarationFile,
        provider: Arc<dyn Provider>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let model = declarations.to_model()?;
        Ok(Self::new(model, provider, store).with_settings(declarations.apply.settings()))
    }

    /// Sets apply concurrency and retry settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: ApplySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Returns the hash of the declarations.
    #[must_use]
    pub fn declaration_hash(&self) -> &str {
        &self.declaration_hash
    }

    /// Returns the declared resources.
    #[must_use]
    pub const fn model(&self) -> &ResourceModel {
        &self.model
    }

    /// Builds the dependency graph of the declarations.
    ///
    /// # Errors
    ///
    /// Returns an error on unknown references or cycles.
    pub fn graph(&self) -> Result<DependencyGraph> {
        Ok(DependencyGraph::build(&self.model)?)
    }

    /// Loads the observed state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read.
    pub async fn state(&self) -> Result<ObservedState> {
        self.store.load().await
    }

    /// Computes the plan that converges state on the declarations.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or the declarations
    /// cannot be planned.
    pub async fn plan(&self) -> Result<Plan> {
        let state = self.store.load().await?;
        self.plan_for(&self.model, &state)
    }

    /// Computes the plan that deletes every resource recorded in state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or the recorded
    /// dependencies form a cycle.
    pub async fn destroy_plan(&self) -> Result<Plan> {
        let state = self.store.load().await?;
        self.plan_for(&ResourceModel::new(), &state)
    }

    fn plan_for(&self, model: &ResourceModel, state: &ObservedState) -> Result<Plan> {
        let graph = DependencyGraph::build(model)?;
        let diff = DiffEngine::new(self.provider.as_ref()).compute_diff(model, &graph, state)?;
        let plan = Plan::from_diff(&diff, model, &graph, state, &self.declaration_hash)?;

        info!(
            "Plan: {} ({} replacements) against state serial {}",
            plan.summary(),
            diff.replacements(),
            state.serial
        );
        Ok(plan)
    }

    /// Applies a plan computed by [`Self::plan`].
    ///
    /// # Errors
    ///
    /// Returns `StalePlan` if the state changed since the plan was computed.
    /// Failed actions do not make this an error; see
    /// [`ReconciliationResult::failure`].
    pub async fn apply(&self, plan: &Plan) -> Result<ReconciliationResult> {
        self.execute(plan, Operation::Apply).await
    }

    /// Applies a plan computed by [`Self::destroy_plan`].
    ///
    /// # Errors
    ///
    /// Returns `StalePlan` if the state changed since the plan was computed.
    pub async fn destroy(&self, plan: &Plan) -> Result<ReconciliationResult> {
        self.execute(plan, Operation::Destroy).await
    }

    /// Plans and applies in one step.
    ///
    /// # Errors
    ///
    /// Returns an error if planning fails or the state cannot be read.
    pub async fn reconcile(&self) -> Result<ReconciliationResult> {
        info!("Starting reconciliation ({} resources declared)", self.model.len());
        let plan = self.plan().await?;
        self.apply(&plan).await
    }

    async fn execute(&self, plan: &Plan, operation: Operation) -> Result<ReconciliationResult> {
        let state = self.store.load().await?;
        if state.serial != plan.state_serial {
            return Err(PlanError::StalePlan {
                planned: plan.state_serial,
                current: state.serial,
            }
            .into());
        }

        let unchanged = plan.summary().unchanged;
        if !plan.has_changes() {
            info!("No changes required - state is converged");
            return Ok(ReconciliationResult::converged(unchanged));
        }

        let report = ApplyExecutor::new(self.provider.clone(), self.store.clone())
            .with_settings(self.settings)
            .execute(plan, &state)
            .await;
        info!("{report}");

        let mut result = ReconciliationResult::from_report(&report, unchanged);

        let resources: Vec<String> = plan
            .actions
            .iter()
            .filter(|action| action.kind != ActionKind::NoOp)
            .map(|action| action.address.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let entry = match report.failure() {
            None => HistoryEntry::new(operation, &plan.declaration_hash, resources),
            Some(err) => {
                warn!("{operation} finished with failures: {err}");
                HistoryEntry::failed(operation, &plan.declaration_hash, resources, &err.to_string())
            }
        };

        if let Err(e) = self.store.append_history(entry).await {
            error!("Failed to record history: {}", e);
            result.errors.push(format!("Failed to record history: {e}"));
        }

        Ok(result)
    }

    /// Compares every object recorded in state with what the provider
    /// reports, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or a provider read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        let state = self.store.load().await?;
        info!("Checking {} recorded resources for drift", state.len());

        let mut drifted = Vec::new();
        for entry in state.iter() {
            let drift = match self.provider.read(&entry.address, &entry.id).await? {
                None => Some(Drift::Missing),
                Some(remote) => {
                    let attributes = changed_attributes(entry, &remote);
                    (!attributes.is_empty()).then_some(Drift::Changed { attributes })
                }
            };

            if let Some(drift) = drift {
                debug!(address = %entry.address, "Drift detected: {drift}");
                drifted.push(DriftedResource {
                    address: entry.address.to_string(),
                    id: entry.id.clone(),
                    drift,
                });
            }
        }

        let pending = self
            .model
            .iter()
            .filter(|resource| state.get(&resource.address).is_none())
            .map(|resource| resource.address.to_string())
            .collect();

        Ok(DriftReport {
            has_drift: !drifted.is_empty(),
            drifted,
            pending,
            total_resources: self.model.len(),
            observed_count: state.len(),
        })
    }

    /// Removes an address from state without touching its object.
    ///
    /// Returns false if the address was not recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be read or written.
    pub async fn forget(&self, address: &ResourceAddress) -> Result<bool> {
        let state = self.store.load().await?;
        let Some(entry) = state.get(address) else {
            warn!("{address} is not recorded in state");
            return Ok(false);
        };

        self.store.delete(address).await?;
        self.store
            .append_history(HistoryEntry::new(
                Operation::Forget,
                &self.declaration_hash,
                vec![address.to_string()],
            ))
            .await?;

        info!("Removed {address} from state; object {} was left in place", entry.id);
        Ok(true)
    }
}

/// Attributes whose remote value differs from the recorded one. A recorded
/// physical name stands in for the declared unique name.
fn changed_attributes(entry: &ResourceState, remote: &RemoteObject) -> Vec<String> {
    let name_key = catalog::name_attribute(entry.resource_type());
    let keys: BTreeSet<&String> = entry
        .attributes
        .keys()
        .chain(remote.attributes.keys())
        .filter(|key| !key.starts_with('_'))
        .collect();

    keys.into_iter()
        .filter(|key| {
            let expected = match (&entry.physical_name, name_key) {
                (Some(physical), Some(name)) if name == key.as_str() => {
                    Some(AttributeValue::string(physical.clone()))
                }
                _ => entry.attributes.get(*key).cloned(),
            };
            let expected = expected.map(|value| value.normalized(key));
            let actual = remote.attributes.get(*key).map(|value| value.normalized(key));
            expected != actual
        })
        .cloned()
        .collect()
}

impl ReconciliationResult {
    fn converged(unchanged: usize) -> Self {
        Self {
            success: true,
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged,
            failed: 0,
            skipped: 0,
            statuses: BTreeMap::new(),
            errors: vec![],
            duration_ms: 0,
        }
    }

    fn from_report(report: &ApplyReport, unchanged: usize) -> Self {
        let succeeded = |kind: ActionKind| {
            report
                .actions
                .iter()
                .filter(|a| a.kind == kind && a.status == ActionStatus::Succeeded)
                .count()
        };

        Self {
            success: report.is_success(),
            created: succeeded(ActionKind::Create),
            updated: succeeded(ActionKind::Update),
            deleted: succeeded(ActionKind::Delete),
            unchanged,
            failed: report.count(ActionStatus::Failed),
            skipped: report.count(ActionStatus::Skipped),
            statuses: report.address_statuses(),
            errors: report
                .problems()
                .into_iter()
                .map(|a| {
                    format!(
                        "{} {}: {}",
                        a.status,
                        a.address,
                        a.error.as_deref().unwrap_or("no error recorded")
                    )
                })
                .collect(),
            duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Returns the error describing a partial failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<ApplyError> {
        (!self.success).then(|| ApplyError::PartialApplyFailure {
            statuses: self.statuses.clone(),
        })
    }
}

impl DriftReport {
    /// Returns true if the state is converged (no drift).
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        !self.has_drift
    }
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing => write!(f, "object no longer exists"),
            Self::Changed { attributes } => write!(f, "changed: {}", attributes.join(", ")),
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift {
            writeln!(f, "Drift detected:")?;
            for resource in &self.drifted {
                writeln!(f, "  - {} ({}): {}", resource.address, resource.id, resource.drift)?;
            }
        } else {
            writeln!(f, "No drift detected - state matches the provider")?;
        }
        if !self.pending.is_empty() {
            writeln!(f, "Not yet created: {}", self.pending.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconciliationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.success { "successful" } else { "failed" };
        writeln!(f, "Reconciliation {status}:")?;
        writeln!(f, "  Created: {}", self.created)?;
        writeln!(f, "  Updated: {}", self.updated)?;
        writeln!(f, "  Deleted: {}", self.deleted)?;
        writeln!(f, "  Unchanged: {}", self.unchanged)?;

        if self.failed > 0 || self.skipped > 0 {
            writeln!(f, "  Failed: {}", self.failed)?;
            writeln!(f, "  Skipped: {}", self.skipped)?;
        }

        if !self.errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for error in &self.errors {
                writeln!(f, "    - {error}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InfraplanError, TerminalKind};
    use crate::model::Resource;
    use crate::provider::{Fault, SandboxProvider};
    use crate::state::MemoryStateStore;
    use std::time::Duration;

    fn addr(text: &str) -> ResourceAddress {
        ResourceAddress::parse(text).unwrap()
    }

    fn s(value: &str) -> AttributeValue {
        AttributeValue::string(value)
    }

    fn network() -> ResourceModel {
        ResourceModel::from_resources([
            Resource::new("aws_vpc", "main").with_attribute("cidr_block", s("10.0.0.0/16")),
            Resource::new("aws_subnet", "a")
                .with_attribute("vpc_id", AttributeValue::reference(addr("aws_vpc.main"), "id"))
                .with_attribute("cidr_block", s("10.0.1.0/24")),
            Resource::new("aws_security_group", "web")
                .with_attribute("name", s("web"))
                .with_attribute("vpc_id", AttributeValue::reference(addr("aws_vpc.main"), "id")),
        ])
        .unwrap()
    }

    fn reconciler(
        model: ResourceModel,
        provider: &Arc<SandboxProvider>,
        store: &Arc<MemoryStateStore>,
    ) -> Reconciler {
        Reconciler::new(model, provider.clone(), store.clone()).with_settings(ApplySettings {
            workers: 4,
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        })
    }

    #[tokio::test]
    async fn test_reconcile_converges_and_records_history() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(network(), &provider, &store);

        let result = reconciler.reconcile().await.unwrap();
        assert!(result.success, "{result}");
        assert_eq!(result.created, 3);
        assert!(result.failure().is_none());

        let second = reconciler.reconcile().await.unwrap();
        assert!(second.success);
        assert_eq!(second.created, 0);
        assert_eq!(second.unchanged, 3);

        let state = reconciler.state().await.unwrap();
        assert_eq!(state.history.len(), 1);
        let entry = &state.history[0];
        assert_eq!(entry.operation, Operation::Apply);
        assert!(entry.success);
        assert_eq!(entry.declaration_hash, reconciler.declaration_hash());
        assert_eq!(
            entry.resources,
            ["aws_security_group.web", "aws_subnet.a", "aws_vpc.main"]
        );
    }

    #[tokio::test]
    async fn test_stale_plan_is_rejected() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(network(), &provider, &store);

        let stale = reconciler.plan().await.unwrap();
        reconciler.reconcile().await.unwrap();

        let err = reconciler.apply(&stale).await.unwrap_err();
        assert!(matches!(err, InfraplanError::Plan(PlanError::StalePlan { planned: 0, .. })));
    }

    #[tokio::test]
    async fn test_failed_apply_is_reported_and_recorded() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(network(), &provider, &store);
        provider
            .inject(addr("aws_vpc.main"), Fault::Terminal(TerminalKind::PermissionDenied))
            .await;

        let result = reconciler.reconcile().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 2);
        assert_eq!(result.statuses["aws_vpc.main"], ActionStatus::Failed);
        assert_eq!(result.statuses["aws_subnet.a"], ActionStatus::Skipped);
        assert!(matches!(
            result.failure(),
            Some(ApplyError::PartialApplyFailure { .. })
        ));

        let state = reconciler.state().await.unwrap();
        assert!(state.is_empty());
        assert!(!state.history[0].success);
        assert!(state.history[0].error.is_some());
    }

    #[tokio::test]
    async fn test_check_drift() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        reconciler(network(), &provider, &store).reconcile().await.unwrap();

        let state = store.load().await.unwrap();
        let subnet_id = state.get(&addr("aws_subnet.a")).unwrap().id.clone();
        let sg_id = state.get(&addr("aws_security_group.web")).unwrap().id.clone();
        provider.tamper(&subnet_id, "cidr_block", s("10.0.9.0/24")).await;
        provider.forget(&sg_id).await;

        let mut model = network();
        model
            .declare(Resource::new("aws_internet_gateway", "gw").with_attribute(
                "vpc_id",
                AttributeValue::reference(addr("aws_vpc.main"), "id"),
            ))
            .unwrap();
        let report = reconciler(model, &provider, &store).check_drift().await.unwrap();

        assert!(report.has_drift);
        assert!(!report.is_converged());
        assert_eq!(report.observed_count, 3);
        assert_eq!(report.total_resources, 4);
        assert_eq!(report.pending, ["aws_internet_gateway.gw"]);
        assert_eq!(report.drifted, vec![
            DriftedResource {
                address: String::from("aws_security_group.web"),
                id: sg_id,
                drift: Drift::Missing,
            },
            DriftedResource {
                address: String::from("aws_subnet.a"),
                id: subnet_id,
                drift: Drift::Changed {
                    attributes: vec![String::from("cidr_block")],
                },
            },
        ]);
    }

    #[tokio::test]
    async fn test_no_drift_after_apply() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(network(), &provider, &store);
        reconciler.reconcile().await.unwrap();

        let report = reconciler.check_drift().await.unwrap();
        assert!(report.is_converged(), "{report}");
        assert!(report.pending.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_everything_in_reverse_order() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(network(), &provider, &store);
        reconciler.reconcile().await.unwrap();

        let plan = reconciler.destroy_plan().await.unwrap();
        let order: Vec<String> = plan.actions.iter().map(|a| a.address.to_string()).collect();
        assert!(plan.actions.iter().all(|a| a.kind == ActionKind::Delete));
        assert_eq!(order, ["aws_security_group.web", "aws_subnet.a", "aws_vpc.main"]);

        let result = reconciler.destroy(&plan).await.unwrap();
        assert!(result.success, "{result}");
        assert_eq!(result.deleted, 3);

        let state = reconciler.state().await.unwrap();
        assert!(state.is_empty());
        assert_eq!(state.history.last().unwrap().operation, Operation::Destroy);
        assert!(provider.objects().await.is_empty());
    }

    #[tokio::test]
    async fn test_forget_leaves_the_object() {
        let provider = Arc::new(SandboxProvider::new());
        let store = Arc::new(MemoryStateStore::new());
        let reconciler = reconciler(network(), &provider, &store);
        reconciler.reconcile().await.unwrap();

        let sg = addr("aws_security_group.web");
        assert!(reconciler.forget(&sg).await.unwrap());
        assert!(!reconciler.forget(&sg).await.unwrap());

        let state = reconciler.state().await.unwrap();
        assert!(state.get(&sg).is_none());
        assert_eq!(state.history.last().unwrap().operation, Operation::Forget);
        assert_eq!(provider.objects().await.len(), 3);

        // Planning again treats the forgotten resource as new.
        let plan = reconciler.plan().await.unwrap();
        assert_eq!(plan.summary().to_add, 1);
    }
}

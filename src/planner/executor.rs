//! Plan executor.
//!
//! Runs plan actions on a bounded pool of tasks. An action starts once every
//! action it depends on has succeeded; a failed action marks everything
//! downstream of it as skipped while unrelated actions keep going. State is
//! written after each successful action, so an interrupted apply leaves a
//! state that the next plan converges from.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{ApplyError, InfraplanError, PlanError, ProviderError, Result};
use crate::model::{
    catalog, AttributeValue, Lifecycle, OutputSource, Resolved, ResourceAddress,
};
use crate::provider::{Provider, ResourceRequest};
use crate::state::{DeposedObject, ObservedState, ResourceState, StateStore};

use super::diff::ReplaceStrategy;
use super::plan::{ActionKind, Plan, PlannedAction};

/// Status of one action during and after an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for dependencies.
    Pending,
    /// Provider call in progress.
    InFlight,
    /// Completed and recorded in state.
    Succeeded,
    /// Failed; see the action error.
    Failed,
    /// Not attempted because a dependency failed.
    Skipped,
}

/// Concurrency and retry settings for an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplySettings {
    /// Maximum number of provider calls in flight.
    pub workers: usize,
    /// Attempts per action, including the first.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
}

/// Outcome of one action.
#[derive(Debug, Clone)]
pub struct ActionReport {
    /// Resource address.
    pub address: ResourceAddress,
    /// Action type.
    pub kind: ActionKind,
    /// Final status.
    pub status: ActionStatus,
    /// Provider calls made.
    pub attempts: u32,
    /// Error message, if the action failed or was skipped.
    pub error: Option<String>,
}

/// Result of executing a plan.
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// One entry per plan action, in plan order.
    pub actions: Vec<ActionReport>,
    /// Last lifecycle reached by each address.
    pub lifecycles: BTreeMap<ResourceAddress, Lifecycle>,
    /// Wall time of the apply.
    pub duration: Duration,
}

/// Executor for plans.
pub struct ApplyExecutor {
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    settings: ApplySettings,
}

/// Everything a task needs to run one action.
struct Job {
    index: usize,
    action: PlannedAction,
    /// Declared attributes with every reference resolved.
    attributes: BTreeMap<String, AttributeValue>,
    /// State entry of the address when the action was dispatched.
    prior: Option<ResourceState>,
}

enum Outcome {
    Saved(Box<ResourceState>),
    Removed,
    Unchanged,
}

struct Finished {
    index: usize,
    attempts: u32,
    result: Result<Outcome>,
}

/// Outputs of the resources applied so far.
struct AppliedOutputs<'a>(&'a BTreeMap<ResourceAddress, ResourceState>);

impl OutputSource for AppliedOutputs<'_> {
    fn output(&self, address: &ResourceAddress, name: &str) -> Option<AttributeValue> {
        self.0.get(address).and_then(|entry| entry.outputs.get(name)).cloned()
    }
}

/// Bookkeeping for which actions may start.
struct Schedule {
    reports: Vec<ActionReport>,
    waiting: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl ApplySettings {
    /// Delay after failed attempt `attempt` (1-based): doubles each time,
    /// capped at `max_backoff`.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl ApplyExecutor {
    /// Creates a new executor with default settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, store: Arc<dyn StateStore>) -> Self {
        Self {
            provider,
            store,
            settings: ApplySettings::default(),
        }
    }

    /// Sets concurrency and retry settings.
    #[must_use]
    pub const fn with_settings(mut self, settings: ApplySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Executes a plan against the state it was computed from.
    ///
    /// Never returns early: every action ends up succeeded, failed, or
    /// skipped, and the report says which.
    pub async fn execute(&self, plan: &Plan, state: &ObservedState) -> ApplyReport {
        let started = Instant::now();
        info!(
            "Executing plan with {} actions ({} workers)",
            plan.action_count(),
            self.settings.workers
        );

        let mut schedule = Schedule::new(plan);
        let mut entries: BTreeMap<ResourceAddress, ResourceState> =
            state.iter().map(|e| (e.address.clone(), e.clone())).collect();
        let mut lifecycles: BTreeMap<ResourceAddress, Lifecycle> = plan
            .actions
            .iter()
            .map(|a| (a.address.clone(), Lifecycle::Planned))
            .collect();

        let workers = self.settings.workers.max(1);
        let mut tasks = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            while running.len() < workers {
                let Some(index) = schedule.ready.pop_first() else {
                    break;
                };
                let action = &plan.actions[index];

                if action.kind == ActionKind::NoOp {
                    debug!("{} is up to date", action.address);
                    lifecycles.insert(action.address.clone(), Lifecycle::Created);
                    schedule.succeed(index);
                    continue;
                }

                match prepare(index, action, &entries) {
                    Ok(job) => {
                        info!("Starting: {}", action.description());
                        if let Some(lifecycle) = in_progress(action) {
                            lifecycles.insert(action.address.clone(), lifecycle);
                        }
                        schedule.reports[index].status = ActionStatus::InFlight;
                        let handle = tasks.spawn(run_action(
                            job,
                            Arc::clone(&self.provider),
                            Arc::clone(&self.store),
                            self.settings,
                        ));
                        running.insert(handle.id(), index);
                    }
                    Err(e) => {
                        error!("Cannot start {}: {e}", action.description());
                        lifecycles.insert(action.address.clone(), Lifecycle::Failed);
                        schedule.fail(index, e.to_string());
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };
            let finished = match joined {
                Ok((id, finished)) => {
                    running.remove(&id);
                    finished
                }
                Err(e) => {
                    let Some(index) = running.remove(&e.id()) else {
                        continue;
                    };
                    Finished {
                        index,
                        attempts: 0,
                        result: Err(InfraplanError::internal(format!("Action task failed: {e}"))),
                    }
                }
            };

            let index = finished.index;
            let action = &plan.actions[index];
            schedule.reports[index].attempts = finished.attempts;

            match finished.result {
                Ok(outcome) => {
                    info!("Finished: {}", action.description());
                    match outcome {
                        Outcome::Saved(entry) => {
                            entries.insert(entry.address.clone(), *entry);
                        }
                        Outcome::Removed => {
                            entries.remove(&action.address);
                        }
                        Outcome::Unchanged => {}
                    }
                    if let Some(lifecycle) = settled(action) {
                        lifecycles.insert(action.address.clone(), lifecycle);
                    }
                    schedule.succeed(index);
                }
                Err(e) => {
                    error!("Failed: {}: {e}", action.description());
                    lifecycles.insert(action.address.clone(), Lifecycle::Failed);
                    schedule.fail(index, e.to_string());
                }
            }
        }

        let report = ApplyReport {
            actions: schedule.reports,
            lifecycles,
            duration: started.elapsed(),
        };
        info!("{report}");
        report
    }
}

impl Schedule {
    fn new(plan: &Plan) -> Self {
        let count = plan.actions.len();
        let mut dependents = vec![Vec::new(); count];
        for (index, action) in plan.actions.iter().enumerate() {
            for &dependency in &action.dependencies {
                dependents[dependency].push(index);
            }
        }
        Self {
            reports: plan
                .actions
                .iter()
                .map(|a| ActionReport {
                    address: a.address.clone(),
                    kind: a.kind,
                    status: ActionStatus::Pending,
                    attempts: 0,
                    error: None,
                })
                .collect(),
            waiting: plan.actions.iter().map(|a| a.dependencies.len()).collect(),
            ready: (0..count).filter(|&i| plan.actions[i].dependencies.is_empty()).collect(),
            dependents,
        }
    }

    fn succeed(&mut self, index: usize) {
        self.reports[index].status = ActionStatus::Succeeded;
        for &dependent in &self.dependents[index] {
            self.waiting[dependent] -= 1;
            if self.waiting[dependent] == 0 && self.reports[dependent].status == ActionStatus::Pending {
                self.ready.insert(dependent);
            }
        }
    }

    fn fail(&mut self, index: usize, message: String) {
        self.reports[index].status = ActionStatus::Failed;
        self.reports[index].error = Some(message);

        let failed = self.reports[index].address.clone();
        let mut stack = self.dependents[index].clone();
        while let Some(next) = stack.pop() {
            if self.reports[next].status != ActionStatus::Pending {
                continue;
            }
            warn!("Skipping {} {}: {failed} failed", self.reports[next].kind, self.reports[next].address);
            self.reports[next].status = ActionStatus::Skipped;
            self.reports[next].error = Some(format!("dependency {failed} failed"));
            self.ready.remove(&next);
            stack.extend(self.dependents[next].iter().copied());
        }
    }
}

/// Resolves the action's attributes against what has been applied so far.
fn prepare(
    index: usize,
    action: &PlannedAction,
    entries: &BTreeMap<ResourceAddress, ResourceState>,
) -> Result<Job> {
    let mut attributes = BTreeMap::new();
    if matches!(action.kind, ActionKind::Create | ActionKind::Update) {
        let outputs = AppliedOutputs(entries);
        for (key, value) in &action.desired {
            match value.resolve(&outputs) {
                Resolved::Known(value) => {
                    attributes.insert(key.clone(), value);
                }
                Resolved::Deferred(reference) => {
                    return Err(PlanError::UnresolvedReference {
                        address: action.address.to_string(),
                        reference: reference.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    Ok(Job {
        index,
        action: action.clone(),
        attributes,
        prior: entries.get(&action.address).cloned(),
    })
}

const fn in_progress(action: &PlannedAction) -> Option<Lifecycle> {
    match action.kind {
        ActionKind::Create => Some(Lifecycle::Creating),
        ActionKind::Update => Some(Lifecycle::Updating),
        ActionKind::Delete if !action.deposed => Some(Lifecycle::Deleting),
        ActionKind::Delete | ActionKind::NoOp => None,
    }
}

const fn settled(action: &PlannedAction) -> Option<Lifecycle> {
    match action.kind {
        ActionKind::Create | ActionKind::Update | ActionKind::NoOp => Some(Lifecycle::Created),
        ActionKind::Delete if !action.deposed => Some(Lifecycle::Deleted),
        ActionKind::Delete => None,
    }
}

async fn run_action(
    job: Job,
    provider: Arc<dyn Provider>,
    store: Arc<dyn StateStore>,
    settings: ApplySettings,
) -> Finished {
    let mut attempts = 0;
    let provider = provider.as_ref();
    let store = store.as_ref();

    let result = match job.action.kind {
        ActionKind::Create => create(&job, provider, store, &settings, &mut attempts).await,
        ActionKind::Update => update(&job, provider, store, &settings, &mut attempts).await,
        ActionKind::Delete => delete(&job, provider, store, &settings, &mut attempts).await,
        ActionKind::NoOp => Ok(Outcome::Unchanged),
    };

    Finished {
        index: job.index,
        attempts,
        result,
    }
}

async fn create(
    job: &Job,
    provider: &dyn Provider,
    store: &dyn StateStore,
    settings: &ApplySettings,
    attempts: &mut u32,
) -> Result<Outcome> {
    let action = &job.action;
    let hasher = ConfigHasher::new();
    let physical_name = physical_name(job, &hasher);
    let request = &request_for(job, physical_name.as_deref());

    let output = with_retries(settings, &action.address, attempts, move || {
        provider.create(request)
    })
    .await?;

    let mut deposed = Vec::new();
    if let Some(prior) = &job.prior {
        deposed.clone_from(&prior.deposed);
        if action.replace == Some(ReplaceStrategy::CreateBeforeDestroy) {
            deposed.push(DeposedObject {
                id: prior.id.clone(),
                physical_name: prior.physical_name.clone(),
            });
        }
    }

    let entry = ResourceState {
        address: action.address.clone(),
        id: output.id,
        attributes: job.attributes.clone(),
        outputs: output.outputs,
        dependencies: action.requires.clone(),
        ordinal: action.ordinal,
        fingerprint: hasher.hash_attributes(&job.attributes),
        physical_name,
        deposed,
        updated_at: Utc::now(),
    };
    store.save(entry.clone()).await?;
    info!("Created {} ({})", entry.address, entry.id);
    Ok(Outcome::Saved(Box::new(entry)))
}

async fn update(
    job: &Job,
    provider: &dyn Provider,
    store: &dyn StateStore,
    settings: &ApplySettings,
    attempts: &mut u32,
) -> Result<Outcome> {
    let action = &job.action;
    let Some(prior) = &job.prior else {
        return Err(InfraplanError::internal(format!(
            "{} has no state entry to update",
            action.address
        )));
    };

    let id = action.object_id.as_deref().unwrap_or(&prior.id);
    let changed: Vec<String> = action.changes.iter().map(|c| c.key.clone()).collect();
    let changed = changed.as_slice();
    let request = &request_for(job, prior.physical_name.as_deref());

    let output = with_retries(settings, &action.address, attempts, move || {
        provider.update(id, request, changed)
    })
    .await?;

    let entry = ResourceState {
        id: output.id,
        attributes: job.attributes.clone(),
        outputs: output.outputs,
        dependencies: action.requires.clone(),
        ordinal: action.ordinal,
        fingerprint: ConfigHasher::new().hash_attributes(&job.attributes),
        updated_at: Utc::now(),
        ..prior.clone()
    };
    store.save(entry.clone()).await?;
    info!("Updated {} ({})", entry.address, entry.id);
    Ok(Outcome::Saved(Box::new(entry)))
}

async fn delete(
    job: &Job,
    provider: &dyn Provider,
    store: &dyn StateStore,
    settings: &ApplySettings,
    attempts: &mut u32,
) -> Result<Outcome> {
    let action = &job.action;
    let Some(id) = action.object_id.as_deref() else {
        return Err(InfraplanError::internal(format!(
            "{} has no object to delete",
            action.address
        )));
    };
    let address = &action.address;

    match with_retries(settings, address, attempts, move || provider.delete(address, id)).await {
        Ok(()) => info!("Deleted {address} ({id})"),
        Err(InfraplanError::Provider(e)) if e.is_not_found() => {
            info!("{address} ({id}) was already deleted");
        }
        Err(e) => return Err(e),
    }

    if !action.deposed {
        store.delete(address).await?;
        return Ok(Outcome::Removed);
    }

    let Some(prior) = &job.prior else {
        return Ok(Outcome::Unchanged);
    };
    let mut entry = prior.clone();
    entry.deposed.retain(|object| object.id != id);
    entry.updated_at = Utc::now();
    store.save(entry.clone()).await?;
    Ok(Outcome::Saved(Box::new(entry)))
}

/// Name to give the object in place of the declared one, if any.
///
/// A create-before-destroy replacement gets a suffixed name while the old
/// object still holds the declared one. Updates keep whatever name the
/// object was created with.
fn physical_name(job: &Job, hasher: &ConfigHasher) -> Option<String> {
    let action = &job.action;
    let prior = job.prior.as_ref()?;
    let key = catalog::name_attribute(&action.address.resource_type)?;
    let name = job.attributes.get(key)?.as_str()?;

    match action.kind {
        ActionKind::Create if action.replace == Some(ReplaceStrategy::CreateBeforeDestroy) => {
            let current = prior
                .physical_name
                .as_deref()
                .or_else(|| prior.attributes.get(key).and_then(AttributeValue::as_str));
            (current == Some(name))
                .then(|| format!("{name}-{}", hasher.replacement_suffix(&action.address, &prior.id)))
        }
        ActionKind::Update => prior.physical_name.clone(),
        _ => None,
    }
}

fn request_for(job: &Job, physical_name: Option<&str>) -> ResourceRequest {
    let mut attributes = job.attributes.clone();
    if let (Some(name), Some(key)) = (
        physical_name,
        catalog::name_attribute(&job.action.address.resource_type),
    ) {
        attributes.insert(key.to_string(), AttributeValue::string(name));
    }
    ResourceRequest {
        address: job.action.address.clone(),
        attributes,
    }
}

/// Calls the provider until it succeeds, fails terminally, or the attempt
/// budget runs out.
async fn with_retries<T, F, Fut>(
    settings: &ApplySettings,
    address: &ResourceAddress,
    attempts: &mut u32,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    loop {
        *attempts += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && *attempts < settings.max_attempts => {
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| settings.backoff_delay(*attempts))
                    .min(settings.max_backoff);
                warn!(
                    "{address}: attempt {} failed ({e}), retrying in {}ms",
                    *attempts,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_retryable() => {
                return Err(ApplyError::RetriesExhausted {
                    address: address.to_string(),
                    attempts: *attempts,
                    message: e.to_string(),
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

impl ApplyReport {
    /// Counts actions with a given status.
    #[must_use]
    pub fn count(&self, status: ActionStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.actions.iter().all(|a| a.status == ActionStatus::Succeeded)
    }

    /// Final status per address. An address with several actions reports
    /// the worst of them.
    #[must_use]
    pub fn address_statuses(&self) -> BTreeMap<String, ActionStatus> {
        let mut statuses: BTreeMap<String, ActionStatus> = BTreeMap::new();
        for action in &self.actions {
            statuses
                .entry(action.address.to_string())
                .and_modify(|current| {
                    if severity(action.status) > severity(*current) {
                        *current = action.status;
                    }
                })
                .or_insert(action.status);
        }
        statuses
    }

    /// Returns the error describing a partial failure, if any.
    #[must_use]
    pub fn failure(&self) -> Option<ApplyError> {
        (!self.is_success()).then(|| ApplyError::PartialApplyFailure {
            statuses: self.address_statuses(),
        })
    }

    /// Actions that did not succeed, with their errors.
    #[must_use]
    pub fn problems(&self) -> Vec<&ActionReport> {
        self.actions
            .iter()
            .filter(|a| a.status != ActionStatus::Succeeded)
            .collect()
    }
}

const fn severity(status: ActionStatus) -> u8 {
    match status {
        ActionStatus::Succeeded => 0,
        ActionStatus::InFlight => 1,
        ActionStatus::Pending => 2,
        ActionStatus::Skipped => 3,
        ActionStatus::Failed => 4,
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InFlight => "in flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Executed {} actions in {:.1}s: {} succeeded, {} failed, {} skipped",
            self.actions.len(),
            self.duration.as_secs_f64(),
            self.count(ActionStatus::Succeeded),
            self.count(ActionStatus::Failed),
            self.count(ActionStatus::Skipped)
        )
    }
}

//! Plan executor for applying plans.
//!
//! A single coordinator owns the bookkeeping of a run. Ready actions are
//! handed to worker tasks bounded by a semaphore; workers call the provider,
//! commit the resulting state record and only then report back over a
//! channel, so a dependent never starts before its dependency is persisted.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{Attributes, Expr, Reference, ResourceKey};
use crate::context::RunContext;
use crate::error::{GraphError, HalldyllError, ProviderError, Result};
use crate::provider::{Provider, ProviderRegistry};
use crate::state::{StateRecord, StateSnapshot, StateStore};

use super::plan::{ActionType, Plan, PlanAction};

/// Default number of provider calls in flight.
pub const DEFAULT_PARALLELISM: usize = 4;

/// Executor for plans.
pub struct PlanExecutor {
    /// Providers by kind.
    registry: ProviderRegistry,
    /// State store records are committed to.
    store: Arc<dyn StateStore>,
    /// Maximum number of provider calls in flight.
    parallelism: usize,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("registry", &self.registry)
            .field("store", &self.store.location())
            .field("parallelism", &self.parallelism)
            .finish()
    }
}

/// Final outcome of one action.
#[derive(Debug, Clone)]
pub enum ActionOutcome {
    /// The provider call succeeded and state was committed.
    Applied,
    /// Nothing to do.
    Unchanged,
    /// The action failed.
    Failed {
        /// Cause of the failure.
        error: Arc<HalldyllError>,
    },
    /// Never attempted because a dependency failed.
    Blocked {
        /// Index of the failed action.
        by: usize,
    },
    /// Never attempted because the run was cancelled.
    Cancelled,
}

/// Result of executing a single action.
#[derive(Debug, Clone)]
pub struct ActionResult {
    /// Action index.
    pub index: usize,
    /// Resource identity.
    pub key: ResourceKey,
    /// Action type.
    pub action_type: ActionType,
    /// What happened.
    pub outcome: ActionOutcome,
}

/// Result of executing the entire plan.
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// Individual action results, in plan order.
    pub results: Vec<ActionResult>,
    /// Number of applied actions.
    pub applied: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of actions blocked by a failed dependency.
    pub blocked: usize,
    /// Number of actions cancelled before dispatch.
    pub cancelled: usize,
}

impl ActionOutcome {
    /// Short label used in output.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Failed { .. } => "failed",
            Self::Blocked { .. } => "blocked",
            Self::Cancelled => "cancelled",
        }
    }
}

impl ExecutionResult {
    fn from_results(results: Vec<ActionResult>) -> Self {
        let mut summary = Self::default();
        for result in &results {
            match result.outcome {
                ActionOutcome::Applied => summary.applied += 1,
                ActionOutcome::Unchanged => summary.unchanged += 1,
                ActionOutcome::Failed { .. } => summary.failed += 1,
                ActionOutcome::Blocked { .. } => summary.blocked += 1,
                ActionOutcome::Cancelled => summary.cancelled += 1,
            }
        }
        summary.results = results;
        summary
    }

    /// Returns true if every action was applied or unchanged.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0 && self.cancelled == 0
    }

    /// Result of one action.
    #[must_use]
    pub fn result_for(&self, key: &ResourceKey) -> Option<&ActionResult> {
        self.results.iter().find(|r| &r.key == key)
    }
}

/// Work handed to a worker task.
struct Job {
    index: usize,
    action_type: ActionType,
    key: ResourceKey,
    provider: Option<Arc<dyn Provider>>,
    provider_id: Option<String>,
    attributes: Attributes,
    previous: Option<StateRecord>,
    declared: BTreeSet<String>,
    dependencies: Vec<ResourceKey>,
}

/// Message from a worker to the coordinator.
struct Completion {
    index: usize,
    result: Result<Option<Attributes>>,
}

impl PlanExecutor {
    /// Creates a new plan executor.
    #[must_use]
    pub fn new(registry: ProviderRegistry, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// Sets the maximum number of provider calls in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Executes a plan against the state it was computed from.
    ///
    /// Action failures do not abort the run: independent branches keep
    /// going and the failures are reported in the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan refers to an action index it does not
    /// contain.
    pub async fn execute(
        &self,
        plan: &Plan,
        snapshot: &StateSnapshot,
        ctx: &RunContext,
    ) -> Result<ExecutionResult> {
        info!(
            "Executing plan with {} actions (parallelism {})",
            plan.action_count(),
            self.parallelism
        );

        let count = plan.action_count();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut pending: Vec<usize> = vec![0; count];
        for action in &plan.actions {
            let deps: BTreeSet<usize> = action.dependencies.iter().copied().collect();
            for dep in deps {
                if dep >= count || dep == action.index {
                    return Err(HalldyllError::internal(format!(
                        "action {} depends on invalid action {dep}",
                        action.index
                    )));
                }
                dependents[dep].push(action.index);
                pending[action.index] += 1;
            }
        }

        let mut outcomes: Vec<Option<ActionOutcome>> = vec![None; count];
        let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
            .filter(|&i| pending[i] == 0)
            .map(Reverse)
            .collect();
        let mut applied: HashMap<ResourceKey, Attributes> = snapshot
            .records()
            .map(|r| (r.key(), r.attributes.clone()))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let (tx, mut rx) = mpsc::channel::<Completion>(count.max(1));
        let mut in_flight = 0_usize;
        let mut cancelled = ctx.is_cancelled();

        loop {
            while let Some(&Reverse(index)) = ready.peek() {
                let action = &plan.actions[index];

                // Nothing to call, so these finish even after cancellation.
                if action.action_type == ActionType::NoOp && !action.refresh_record {
                    ready.pop();
                    debug!("No change for {}", action.key);
                    outcomes[index] = Some(ActionOutcome::Unchanged);
                    release(index, &dependents, &mut pending, &outcomes, &mut ready);
                    continue;
                }

                if cancelled {
                    ready.pop();
                    continue;
                }

                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                ready.pop();

                let job = match self.prepare(plan, action, snapshot, &applied) {
                    Ok(job) => job,
                    Err(err) => {
                        drop(permit);
                        error!("Cannot start {}: {err}", action.description());
                        fail(index, err, &dependents, &mut outcomes);
                        continue;
                    }
                };

                info!("Starting {}", action.description());
                in_flight += 1;
                let tx = tx.clone();
                let store = Arc::clone(&self.store);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let index = job.index;
                    let key = job.key.clone();
                    let worker = tokio::spawn(run_job(job, store, ctx));
                    let result = match worker.await {
                        Ok(result) => result,
                        Err(e) => Err(HalldyllError::internal(format!(
                            "worker for {key} did not complete: {e}"
                        ))),
                    };
                    drop(permit);
                    if tx.send(Completion { index, result }).await.is_err() {
                        warn!("Coordinator gone before {key} reported");
                    }
                });
            }

            if in_flight == 0 {
                break;
            }

            tokio::select! {
                Some(done) = rx.recv() => {
                    in_flight -= 1;
                    let action = &plan.actions[done.index];
                    match done.result {
                        Ok(attributes) => {
                            info!("Completed {}", action.description());
                            match attributes {
                                Some(attributes) => {
                                    applied.insert(action.key.clone(), attributes);
                                }
                                None => {
                                    applied.remove(&action.key);
                                }
                            }
                            // A metadata refresh leaves the resource itself untouched.
                            outcomes[done.index] = Some(if action.action_type == ActionType::NoOp {
                                ActionOutcome::Unchanged
                            } else {
                                ActionOutcome::Applied
                            });
                            release(done.index, &dependents, &mut pending, &outcomes, &mut ready);
                        }
                        Err(err) => {
                            error!("{} failed: {err}", action.description());
                            fail(done.index, err, &dependents, &mut outcomes);
                        }
                    }
                }
                () = ctx.cancelled(), if !cancelled => {
                    warn!("Cancellation requested; waiting for {in_flight} in-flight action(s)");
                    cancelled = true;
                }
                else => break,
            }
        }

        let results: Vec<ActionResult> = plan
            .actions
            .iter()
            .zip(outcomes)
            .map(|(action, outcome)| ActionResult {
                index: action.index,
                key: action.key.clone(),
                action_type: action.action_type,
                outcome: outcome.unwrap_or(ActionOutcome::Cancelled),
            })
            .collect();

        let result = ExecutionResult::from_results(results);
        info!(
            "Execution finished: {} applied, {} unchanged, {} failed, {} blocked, {} cancelled",
            result.applied, result.unchanged, result.failed, result.blocked, result.cancelled
        );
        Ok(result)
    }

    /// Resolves an action's attributes against what has been applied so far.
    fn prepare(
        &self,
        plan: &Plan,
        action: &PlanAction,
        snapshot: &StateSnapshot,
        applied: &HashMap<ResourceKey, Attributes>,
    ) -> Result<Job> {
        let lookup = |reference: &Reference| {
            plan.key_for(&reference.target)
                .and_then(|key| applied.get(key))
                .and_then(|attributes| reference.select(attributes))
        };
        let resolve = |name: &str, expr: &Expr| {
            expr.resolve(&lookup).ok_or_else(|| {
                HalldyllError::Graph(GraphError::UnresolvedReference {
                    resource: action.key.to_string(),
                    reference: format!("{name} = {expr}"),
                })
            })
        };

        let attributes = match action.action_type {
            ActionType::Create => action
                .desired
                .iter()
                .map(|(name, expr)| resolve(name, expr).map(|v| (name.clone(), v)))
                .collect::<Result<Attributes>>()?,
            ActionType::Update => action
                .changes
                .iter()
                .map(|change| match action.desired.get(&change.name) {
                    Some(expr) => resolve(&change.name, expr).map(|v| (change.name.clone(), v)),
                    None => Ok((change.name.clone(), serde_json::Value::Null)),
                })
                .collect::<Result<Attributes>>()?,
            ActionType::Delete | ActionType::NoOp => Attributes::new(),
        };

        let provider = match action.action_type {
            ActionType::NoOp => None,
            _ => Some(self.registry.get(&action.key.kind).ok_or_else(|| {
                ProviderError::UnsupportedKind {
                    kind: action.key.kind.clone(),
                    provider: String::from("none"),
                }
            })?),
        };

        Ok(Job {
            index: action.index,
            action_type: action.action_type,
            key: action.key.clone(),
            provider,
            provider_id: action.provider_id.clone(),
            attributes,
            previous: snapshot.get(&action.key).cloned(),
            declared: action.declared().map(String::from).collect(),
            dependencies: action.resource_dependencies.clone(),
        })
    }
}

/// Marks `index` done and queues dependents whose dependencies all succeeded.
fn release(
    index: usize,
    dependents: &[Vec<usize>],
    pending: &mut [usize],
    outcomes: &[Option<ActionOutcome>],
    ready: &mut BinaryHeap<Reverse<usize>>,
) {
    for &dependent in &dependents[index] {
        pending[dependent] = pending[dependent].saturating_sub(1);
        if pending[dependent] == 0 && outcomes[dependent].is_none() {
            ready.push(Reverse(dependent));
        }
    }
}

/// Records a failure and blocks every transitive dependent.
fn fail(
    index: usize,
    err: HalldyllError,
    dependents: &[Vec<usize>],
    outcomes: &mut [Option<ActionOutcome>],
) {
    outcomes[index] = Some(ActionOutcome::Failed {
        error: Arc::new(err),
    });

    let mut queue: VecDeque<usize> = dependents[index].iter().copied().collect();
    while let Some(next) = queue.pop_front() {
        if outcomes[next].is_some() {
            continue;
        }
        outcomes[next] = Some(ActionOutcome::Blocked { by: index });
        queue.extend(dependents[next].iter().copied());
    }
}

/// Performs one action and persists its effect.
///
/// Returns the resource's attributes after the action, or `None` once it is
/// deleted.
async fn run_job(job: Job, store: Arc<dyn StateStore>, ctx: RunContext) -> Result<Option<Attributes>> {
    let timeout = ctx.timeout();
    let timed_out = || HalldyllError::Timeout {
        resource: job.key.to_string(),
        timeout_secs: timeout.as_secs(),
    };
    let provider = || {
        job.provider.as_ref().ok_or_else(|| {
            HalldyllError::internal(format!("no provider resolved for {}", job.key))
        })
    };
    let provider_id = || {
        job.provider_id.as_deref().ok_or_else(|| {
            HalldyllError::internal(format!("{} has no provider identifier", job.key))
        })
    };

    match job.action_type {
        ActionType::Create => {
            let created = tokio::time::timeout(
                timeout,
                provider()?.create(&ctx, &job.key.kind, &job.attributes),
            )
            .await
            .map_err(|_| timed_out())??;

            let record = StateRecord::new(&job.key, created.provider_id, created.attributes)
                .with_declared(job.declared)
                .with_dependencies(job.dependencies);
            commit(&store, &record).await?;
            Ok(Some(record.attributes))
        }
        ActionType::Update => {
            let id = provider_id()?;
            let attributes = tokio::time::timeout(
                timeout,
                provider()?.update(&ctx, &job.key.kind, id, &job.attributes),
            )
            .await
            .map_err(|_| timed_out())??;

            let record = match job.previous {
                Some(previous) => previous.updated(attributes),
                None => StateRecord::new(&job.key, id, attributes),
            }
            .with_declared(job.declared)
            .with_dependencies(job.dependencies);
            commit(&store, &record).await?;
            Ok(Some(record.attributes))
        }
        ActionType::Delete => {
            let id = provider_id()?;
            let result = tokio::time::timeout(timeout, provider()?.delete(&ctx, &job.key.kind, id))
                .await
                .map_err(|_| timed_out())?;
            match result {
                Ok(()) => {}
                Err(ProviderError::NotFound { .. }) => {
                    warn!("{} was already gone; removing its record", job.key);
                }
                Err(err) => return Err(err.into()),
            }

            store.remove(&job.key).await?;
            Ok(None)
        }
        ActionType::NoOp => {
            let Some(previous) = job.previous else {
                return Err(HalldyllError::internal(format!(
                    "no state record to refresh for {}",
                    job.key
                )));
            };
            let record = previous
                .updated(previous.attributes.clone())
                .with_declared(job.declared)
                .with_dependencies(job.dependencies);
            commit(&store, &record).await?;
            debug!("Refreshed record metadata for {}", job.key);
            Ok(Some(record.attributes))
        }
    }
}

async fn commit(store: &Arc<dyn StateStore>, record: &StateRecord) -> Result<()> {
    store.commit(record).await.inspect_err(|e| {
        error!(
            "{} exists as {} but its state record could not be written: {e}",
            record.key(),
            record.provider_id
        );
    })
}

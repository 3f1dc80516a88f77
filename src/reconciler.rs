//! Reconciler driving plan, apply and destroy runs.
//!
//! The reconciler ties the pieces together: it turns a loaded configuration
//! into a resource graph, reads the applied state, computes a plan and hands
//! it to the executor. Mutating runs hold the state lock for their duration.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ConfigParser, ConfigValidator, InfraConfig, ResourceKey};
use crate::context::RunContext;
use crate::error::{ReconcileError, Result, StateError};
use crate::graph::{GraphBuilder, ResourceGraph};
use crate::planner::{DiffEngine, ExecutionResult, Plan, PlanExecutor};
use crate::provider::ProviderRegistry;
use crate::state::{StateLock, StateRecord, StateSnapshot, StateStore, open_store};

/// Reconciler for one configuration.
pub struct Reconciler {
    /// Project name and environment, for logs.
    project: String,
    /// Desired resources.
    graph: ResourceGraph,
    /// Providers by kind.
    registry: ProviderRegistry,
    /// Applied state.
    store: Arc<dyn StateStore>,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Maximum number of provider calls in flight.
    parallelism: usize,
    /// Deadline for each provider call.
    timeout: Duration,
}

/// A computed plan together with the state it was computed from.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    /// The plan.
    pub plan: Plan,
    /// Snapshot the plan was diffed against.
    pub snapshot: StateSnapshot,
}

/// Result of an apply or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Fingerprint of the executed plan.
    pub fingerprint: String,
    /// Number of created resources.
    pub created: usize,
    /// Number of updated resources.
    pub updated: usize,
    /// Number of deleted resources.
    pub deleted: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of actions blocked by a failure.
    pub blocked: usize,
    /// Number of actions cancelled.
    pub cancelled: usize,
    /// Per-action errors, as `kind.name: message`.
    pub errors: Vec<String>,
    /// Detailed per-action outcomes.
    #[serde(skip)]
    pub execution: ExecutionResult,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.project)
            .field("resources", &self.graph.len())
            .field("store", &self.store.location())
            .field("parallelism", &self.parallelism)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler from its parts.
    #[must_use]
    pub fn new(graph: ResourceGraph, registry: ProviderRegistry, store: Arc<dyn StateStore>) -> Self {
        Self {
            project: String::from("default"),
            graph,
            registry,
            store,
            diff_engine: DiffEngine::new(),
            parallelism: crate::planner::DEFAULT_PARALLELISM,
            timeout: Duration::from_secs(300),
        }
    }

    /// Builds a reconciler for a loaded configuration.
    ///
    /// Relative paths in the configuration resolve against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns the first load-time error: invalid settings, malformed
    /// resources, unresolved references, cycles, or an unusable backend.
    pub async fn from_config(config: &InfraConfig, base_dir: &Path) -> Result<Self> {
        let validation = ConfigValidator::new().validate(config)?;
        for warning in &validation.warnings {
            warn!("{warning}");
        }

        let specs = ConfigParser::resource_specs(config)?;
        let graph = GraphBuilder::new().build(specs)?;
        let registry = ProviderRegistry::from_config(config, base_dir)?;
        let store = open_store(&config.state, base_dir).await?;

        let mut reconciler = Self::new(graph, registry, store)
            .with_parallelism(config.execution.parallelism)
            .with_timeout(Duration::from_secs(config.execution.timeout_secs));
        reconciler.project = config.qualified_name();
        Ok(reconciler)
    }

    /// Sets the maximum number of provider calls in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the per-call deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Desired resources.
    #[must_use]
    pub const fn graph(&self) -> &ResourceGraph {
        &self.graph
    }

    /// State store used by this reconciler.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Per-call deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Takes the run lock for a mutating operation.
    ///
    /// # Errors
    ///
    /// Returns an error if another run holds the lock.
    pub async fn lock(&self, operation: &str) -> Result<StateLock> {
        StateLock::acquire(Arc::clone(&self.store), operation).await
    }

    /// Computes the plan converging state to the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn plan(&self) -> Result<PlannedRun> {
        info!("Planning {}", self.project);
        let snapshot = self.store.load().await?;
        let plan = self.diff_engine.plan(&self.graph, &snapshot);
        debug!("Plan fingerprint {}", plan.fingerprint());
        Ok(PlannedRun { plan, snapshot })
    }

    /// Computes the plan deleting every resource in state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn plan_destroy(&self) -> Result<PlannedRun> {
        info!("Planning destruction of {}", self.project);
        let snapshot = self.store.load().await?;
        let plan = self.diff_engine.plan(&ResourceGraph::empty(), &snapshot);
        Ok(PlannedRun { plan, snapshot })
    }

    /// Executes a previously computed plan.
    ///
    /// The caller is expected to hold the run lock.
    ///
    /// # Errors
    ///
    /// Returns an error only if execution could not start; action failures
    /// are reported in the returned report.
    pub async fn execute(&self, planned: &PlannedRun, ctx: &RunContext) -> Result<ApplyReport> {
        let executor = PlanExecutor::new(self.registry.clone(), Arc::clone(&self.store))
            .with_parallelism(self.parallelism);
        let execution = executor
            .execute(&planned.plan, &planned.snapshot, ctx)
            .await?;
        Ok(ApplyReport::new(&planned.plan, execution))
    }

    /// Plans and applies the configuration under the run lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held or state cannot be loaded.
    pub async fn apply(&self, ctx: &RunContext) -> Result<ApplyReport> {
        let lock = self.lock("apply").await?;
        let result: Result<_> = async {
            let planned = self.plan().await?;
            self.execute(&planned, ctx).await
        }
        .await;
        lock.release().await;
        result
    }

    /// Deletes every resource in state under the run lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is held or state cannot be loaded.
    pub async fn destroy(&self, ctx: &RunContext) -> Result<ApplyReport> {
        let lock = self.lock("destroy").await?;
        let result: Result<_> = async {
            let planned = self.plan_destroy().await?;
            self.execute(&planned, ctx).await
        }
        .await;
        lock.release().await;
        result
    }
}

impl ApplyReport {
    fn new(plan: &Plan, execution: ExecutionResult) -> Self {
        use crate::planner::{ActionOutcome, ActionType};

        let mut report = Self {
            fingerprint: plan.fingerprint(),
            created: 0,
            updated: 0,
            deleted: 0,
            unchanged: execution.unchanged,
            failed: execution.failed,
            blocked: execution.blocked,
            cancelled: execution.cancelled,
            errors: Vec::new(),
            execution: ExecutionResult::default(),
        };

        for result in &execution.results {
            match (&result.outcome, result.action_type) {
                (ActionOutcome::Applied, ActionType::Create) => report.created += 1,
                (ActionOutcome::Applied, ActionType::Update) => report.updated += 1,
                (ActionOutcome::Applied, ActionType::Delete) => report.deleted += 1,
                (ActionOutcome::Failed { error }, _) => {
                    report.errors.push(format!("{}: {error}", result.key));
                }
                (ActionOutcome::Blocked { by }, _) => {
                    let cause = execution
                        .results
                        .get(*by)
                        .map_or_else(|| format!("action {by}"), |r| r.key.to_string());
                    report
                        .errors
                        .push(format!("{}: blocked by failed {cause}", result.key));
                }
                _ => {}
            }
        }

        report.execution = execution;
        report
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.execution.is_success()
    }

    /// Converts an unsuccessful run into an error.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Cancelled`] if the run was interrupted and
    /// [`ReconcileError::Incomplete`] if any action failed or was blocked.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.failed > 0 || self.blocked > 0 {
            return Err(ReconcileError::Incomplete {
                failed: self.failed,
                blocked: self.blocked,
                cancelled: self.cancelled,
            }
            .into());
        }
        if self.cancelled > 0 {
            return Err(ReconcileError::Cancelled {
                applied: self.created + self.updated + self.deleted,
                cancelled: self.cancelled,
            }
            .into());
        }
        Ok(())
    }
}

/// Reads one state record.
///
/// # Errors
///
/// Returns [`StateError::RecordNotFound`] if no record exists.
pub async fn show_record(store: &dyn StateStore, key: &ResourceKey) -> Result<StateRecord> {
    let snapshot = store.load().await?;
    snapshot.get(key).cloned().ok_or_else(|| {
        StateError::RecordNotFound {
            key: key.to_string(),
        }
        .into()
    })
}

/// Forgets a resource without touching the provider.
///
/// The object itself is left in place; the next plan treats it as absent.
///
/// # Errors
///
/// Returns [`StateError::RecordNotFound`] if no record exists.
pub async fn forget_record(store: &dyn StateStore, key: &ResourceKey) -> Result<StateRecord> {
    let record = show_record(store, key).await?;
    store.remove(key).await?;
    warn!(
        "Removed {key} from state; {} is no longer managed",
        record.provider_id
    );
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceSpec;
    use crate::error::HalldyllError;
    use crate::planner::ActionType;
    use crate::provider::LocalProvider;
    use crate::state::LocalStateStore;

    fn reconciler(dir: &Path, specs: Vec<ResourceSpec>) -> Reconciler {
        let mut registry = ProviderRegistry::new();
        registry.set_fallback("sandbox", Arc::new(LocalProvider::new(dir.join("sandbox"))));
        let store = Arc::new(LocalStateStore::with_base_dir(dir.join("state")));
        Reconciler::new(GraphBuilder::new().build(specs).unwrap(), registry, store)
    }

    fn ctx() -> RunContext {
        RunContext::new(Duration::from_secs(5)).0
    }

    fn specs() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16"),
            ResourceSpec::new("vm", "vm").with_reference("subnet_id", "net.id"),
        ]
    }

    #[tokio::test]
    async fn test_apply_then_plan_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = reconciler(dir.path(), specs());

        let report = reconciler.apply(&ctx()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.created, 2);
        assert!(report.ensure_complete().is_ok());

        let planned = reconciler.plan().await.unwrap();
        assert!(!planned.plan.has_changes());
        assert!(!reconciler.store().is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = reconciler(dir.path(), specs());
        reconciler.apply(&ctx()).await.unwrap();

        let planned = reconciler.plan_destroy().await.unwrap();
        let order: Vec<_> = planned.plan.actions.iter().map(|a| a.key.name.as_str()).collect();
        assert_eq!(order, vec!["vm", "net"]);
        assert!(planned.plan.actions.iter().all(|a| a.action_type == ActionType::Delete));

        let report = reconciler.destroy(&ctx()).await.unwrap();
        assert_eq!(report.deleted, 2);
        assert!(reconciler.store().load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_refuses_when_locked() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = reconciler(dir.path(), specs());
        let held = reconciler.lock("apply").await.unwrap();

        let err = reconciler.apply(&ctx()).await.unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::State(StateError::LockedByOther { .. })
        ));
        held.release().await;
    }

    #[tokio::test]
    async fn test_forget_record() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = reconciler(dir.path(), specs());
        reconciler.apply(&ctx()).await.unwrap();

        let key = ResourceKey::new("vm", "vm");
        let store = reconciler.store().as_ref();
        assert_eq!(show_record(store, &key).await.unwrap().name, "vm");
        forget_record(store, &key).await.unwrap();
        assert!(matches!(
            show_record(store, &key).await.unwrap_err(),
            HalldyllError::State(StateError::RecordNotFound { .. })
        ));

        // The forgotten vm is planned again.
        let planned = reconciler.plan().await.unwrap();
        assert_eq!(planned.plan.count(ActionType::Create), 1);
    }

    #[tokio::test]
    async fn test_new_dependency_rewrites_record_only() {
        let dir = tempfile::tempdir().unwrap();
        let independent = vec![
            ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16"),
            ResourceSpec::new("vm", "vm").with_literal("size", "B1s"),
        ];
        reconciler(dir.path(), independent).apply(&ctx()).await.unwrap();

        let ordered = vec![
            ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16"),
            ResourceSpec::new("vm", "vm")
                .with_literal("size", "B1s")
                .with_dependency("net"),
        ];
        let reconciler = reconciler(dir.path(), ordered);
        let planned = reconciler.plan().await.unwrap();
        assert!(!planned.plan.has_changes());
        assert!(planned.plan.actions.iter().any(|a| a.refresh_record));

        let report = reconciler.apply(&ctx()).await.unwrap();
        assert!(report.is_success());
        assert_eq!((report.created, report.updated, report.unchanged), (0, 0, 2));

        let state = reconciler.store().load().await.unwrap();
        let vm = state.get(&ResourceKey::new("vm", "vm")).unwrap();
        assert_eq!(vm.dependencies, vec![ResourceKey::new("net", "net")]);

        let replanned = reconciler.plan().await.unwrap();
        assert!(replanned.plan.actions.iter().all(|a| !a.refresh_record));
    }

    #[test]
    fn test_incomplete_report_is_error() {
        let report = ApplyReport {
            fingerprint: String::new(),
            created: 1,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            failed: 1,
            blocked: 2,
            cancelled: 0,
            errors: vec![],
            execution: ExecutionResult::default(),
        };
        assert!(matches!(
            report.ensure_complete(),
            Err(HalldyllError::Reconcile(ReconcileError::Incomplete { failed: 1, blocked: 2, .. }))
        ));
    }
}

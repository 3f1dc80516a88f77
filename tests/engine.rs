//! End-to-end runs through configuration, planning, execution and state.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

use halldyll_provision::config::{Attributes, ConfigParser, InfraConfig, ResourceKey};
use halldyll_provision::error::{GraphError, HalldyllError, ProviderError, ReconcileError};
use halldyll_provision::planner::{ActionOutcome, ActionType};
use halldyll_provision::provider::{Created, LocalProvider, Provider, ProviderRegistry};
use halldyll_provision::state::LocalStateStore;
use halldyll_provision::{GraphBuilder, Reconciler, RunContext, StateStore};

const NET_VM: &str = r"
project:
  name: example
resources:
  - kind: vm
    name: vm
    attributes:
      size: B1s
      subnet_id: ${net.id}
  - kind: network
    name: net
    attributes:
      cidr: 10.0.0.0/16
";

fn parse(yaml: &str) -> InfraConfig {
    ConfigParser::new().parse_yaml(yaml, None).unwrap()
}

fn ctx() -> RunContext {
    RunContext::new(Duration::from_secs(10)).0
}

async fn reconciler(yaml: &str, dir: &Path) -> Reconciler {
    Reconciler::from_config(&parse(yaml), dir).await.unwrap()
}

#[tokio::test]
async fn net_vm_example_converges() {
    let dir = tempfile::tempdir().unwrap();
    let reconciler = reconciler(NET_VM, dir.path()).await;

    let planned = reconciler.plan().await.unwrap();
    let order: Vec<_> = planned
        .plan
        .actions
        .iter()
        .map(|a| (a.action_type, a.key.name.as_str()))
        .collect();
    assert_eq!(order, vec![(ActionType::Create, "net"), (ActionType::Create, "vm")]);

    let report = assert_ok!(reconciler.apply(&ctx()).await);
    assert_ok!(report.ensure_complete());
    assert_eq!(report.created, 2);

    let state = reconciler.store().load().await.unwrap();
    let net = state.get(&ResourceKey::new("network", "net")).unwrap();
    let vm = state.get(&ResourceKey::new("vm", "vm")).unwrap();
    assert_eq!(vm.attributes["subnet_id"], net.attributes["id"]);
    assert_eq!(vm.dependencies, vec![net.key()]);

    let replanned = reconciler.plan().await.unwrap();
    assert!(!replanned.plan.has_changes());
    assert!(
        replanned
            .plan
            .actions
            .iter()
            .all(|a| a.action_type == ActionType::NoOp)
    );
}

#[tokio::test]
async fn changed_attribute_updates_in_place() {
    let dir = tempfile::tempdir().unwrap();
    reconciler(NET_VM, dir.path()).await.apply(&ctx()).await.unwrap();
    let before = LocalStateStore::with_base_dir(dir.path().join(".halldyll"))
        .load()
        .await
        .unwrap();

    let resized = NET_VM.replace("size: B1s", "size: B2s");
    let reconciler = reconciler(&resized, dir.path()).await;
    let planned = reconciler.plan().await.unwrap();
    assert_eq!(planned.plan.count(ActionType::Update), 1);
    assert_eq!(planned.plan.count(ActionType::NoOp), 1);

    reconciler.apply(&ctx()).await.unwrap();
    let after = reconciler.store().load().await.unwrap();
    let key = ResourceKey::new("vm", "vm");
    assert_eq!(after.get(&key).unwrap().attributes["size"], json!("B2s"));
    assert_eq!(
        after.get(&key).unwrap().provider_id,
        before.get(&key).unwrap().provider_id
    );
}

#[tokio::test]
async fn plan_order_respects_every_edge() {
    let dir = tempfile::tempdir().unwrap();
    let config = parse(include_str!("../templates/halldyll.infra.yaml"));
    let reconciler = Reconciler::from_config(&config, dir.path()).await.unwrap();

    let planned = reconciler.plan().await.unwrap();
    assert_eq!(planned.plan.count(ActionType::Create), 6);

    let position: HashMap<_, _> = planned
        .plan
        .actions
        .iter()
        .map(|a| (a.key.name.clone(), a.index))
        .collect();
    let graph = reconciler.graph();
    for &(dependent, dependency) in graph.edges() {
        let dependent = &graph.node(dependent).unwrap().name;
        let dependency = &graph.node(dependency).unwrap().name;
        assert!(
            position[dependency] < position[dependent],
            "{dependency} must precede {dependent}"
        );
    }

    let again = reconciler.plan().await.unwrap();
    assert_eq!(again.plan.fingerprint(), planned.plan.fingerprint());
}

#[tokio::test]
async fn destroy_deletes_dependents_first_and_empties_state() {
    let dir = tempfile::tempdir().unwrap();
    let config = parse(include_str!("../templates/halldyll.infra.yaml"));
    let reconciler = Reconciler::from_config(&config, dir.path()).await.unwrap();
    reconciler.apply(&ctx()).await.unwrap();

    let planned = reconciler.plan_destroy().await.unwrap();
    let names: Vec<_> = planned.plan.actions.iter().map(|a| a.key.name.as_str()).collect();
    let at = |name: &str| names.iter().position(|n| *n == name).unwrap();
    assert!(at("vm") < at("nic"));
    assert!(at("nic") < at("internal"));
    assert!(at("nic") < at("nsg"));
    assert!(at("internal") < at("vnet"));
    assert!(at("vnet") < at("rg"));

    let report = reconciler.destroy(&ctx()).await.unwrap();
    assert_eq!(report.deleted, 6);
    assert!(reconciler.store().load().await.unwrap().is_empty());
}

#[tokio::test]
async fn cycle_is_rejected_with_every_member() {
    let yaml = r"
project:
  name: cyclic
resources:
  - kind: res
    name: a
    attributes:
      x: ${c.id}
  - kind: res
    name: b
    attributes:
      x: ${a.id}
  - kind: res
    name: c
    attributes:
      x: ${b.id}
  - kind: res
    name: d
";
    let dir = tempfile::tempdir().unwrap();
    let err = Reconciler::from_config(&parse(yaml), dir.path())
        .await
        .unwrap_err();
    let mut members = match err {
        HalldyllError::Graph(GraphError::Cycle { cycle }) => cycle,
        other => panic!("expected a cycle, got {other}"),
    };
    members.sort();
    assert_eq!(members, vec!["res.a", "res.b", "res.c"]);
}

#[tokio::test]
async fn unresolved_reference_names_the_resource() {
    let yaml = r"
project:
  name: dangling
resources:
  - kind: vm
    name: vm
    attributes:
      subnet_id: ${missing.id}
";
    let specs = ConfigParser::resource_specs(&parse(yaml)).unwrap();
    let err = GraphBuilder::new().build(specs).unwrap_err();
    assert!(matches!(
        err,
        HalldyllError::Graph(GraphError::UnresolvedReference { ref resource, .. })
            if resource == "vm.vm"
    ));
}

/// Fails every call for one kind and delegates the rest to a sandbox.
struct FailingKind {
    kind: &'static str,
    inner: LocalProvider,
}

#[async_trait]
impl Provider for FailingKind {
    async fn create(
        &self,
        ctx: &RunContext,
        kind: &str,
        attributes: &Attributes,
    ) -> Result<Created, ProviderError> {
        if kind == self.kind {
            return Err(ProviderError::Quota {
                message: String::from("no capacity"),
            });
        }
        self.inner.create(ctx, kind, attributes).await
    }

    async fn update(
        &self,
        ctx: &RunContext,
        kind: &str,
        provider_id: &str,
        changes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        self.inner.update(ctx, kind, provider_id, changes).await
    }

    async fn delete(&self, ctx: &RunContext, kind: &str, provider_id: &str) -> Result<(), ProviderError> {
        self.inner.delete(ctx, kind, provider_id).await
    }
}

#[tokio::test]
async fn failure_blocks_dependents_and_spares_the_rest() {
    let yaml = r"
project:
  name: partial
resources:
  - kind: flaky
    name: a
  - kind: app
    name: b
    attributes:
      a_id: ${a.id}
  - kind: app
    name: c
";
    let dir = tempfile::tempdir().unwrap();
    let config = parse(yaml);
    let specs = ConfigParser::resource_specs(&config).unwrap();
    let graph = GraphBuilder::new().build(specs).unwrap();

    let mut registry = ProviderRegistry::new();
    registry.set_fallback(
        "flaky",
        Arc::new(FailingKind {
            kind: "flaky",
            inner: LocalProvider::new(dir.path().join("sandbox")),
        }),
    );
    let store = Arc::new(LocalStateStore::with_base_dir(dir.path().join("state")));
    let reconciler = Reconciler::new(graph, registry, store);

    let report = reconciler.apply(&ctx()).await.unwrap();
    let outcome = |name: &str| {
        report
            .execution
            .results
            .iter()
            .find(|r| r.key.name == name)
            .map(|r| r.outcome.clone())
            .unwrap()
    };
    assert!(matches!(outcome("a"), ActionOutcome::Failed { .. }));
    assert!(matches!(outcome("b"), ActionOutcome::Blocked { .. }));
    assert!(matches!(outcome("c"), ActionOutcome::Applied));
    assert!(matches!(
        report.ensure_complete(),
        Err(HalldyllError::Reconcile(ReconcileError::Incomplete { failed: 1, blocked: 1, .. }))
    ));

    let state = reconciler.store().load().await.unwrap();
    assert_eq!(state.len(), 1);
    assert!(state.contains(&ResourceKey::new("app", "c")));

    // The next plan retries exactly what did not happen.
    let planned = reconciler.plan().await.unwrap();
    assert_eq!(planned.plan.count(ActionType::Create), 2);
    assert_eq!(planned.plan.count(ActionType::NoOp), 1);
}

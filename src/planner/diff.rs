//! Diff engine for comparing the desired graph against applied state.
//!
//! Planning is a pure function of the graph and a state snapshot: the same
//! inputs always produce the same action sequence.

use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use tracing::{debug, warn};

use crate::config::{Expr, Reference, ResourceKey, ResourceSpec};
use crate::graph::ResourceGraph;
use crate::state::{StateRecord, StateSnapshot};

use super::plan::{ActionType, AttributeChange, Plan, PlanAction, PlannedValue};

/// Planned attributes of one desired resource.
type PlannedAttributes = BTreeMap<String, PlannedValue>;

/// Engine computing plans.
#[derive(Debug, Default)]
pub struct DiffEngine;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the plan turning `snapshot` into `graph`.
    ///
    /// Creates, updates and no-ops come first in topological order; deletes
    /// follow, dependents before their dependencies.
    #[must_use]
    pub fn plan(&self, graph: &ResourceGraph, snapshot: &StateSnapshot) -> Plan {
        let mut actions: Vec<PlanAction> = Vec::with_capacity(graph.len() + snapshot.len());
        let mut action_of_node: HashMap<usize, usize> = HashMap::with_capacity(graph.len());
        let mut planned: HashMap<String, PlannedAttributes> = HashMap::with_capacity(graph.len());

        for node in graph.topological_order() {
            let Some(spec) = graph.node(node) else {
                continue;
            };
            let key = spec.key();
            let record = snapshot.get(&key);

            let desired = resolve_desired(spec, &planned);
            let resource_dependencies: Vec<ResourceKey> = graph
                .dependencies(node)
                .iter()
                .filter_map(|&d| graph.node(d).map(ResourceSpec::key))
                .collect();
            let dependencies: Vec<usize> = graph
                .dependencies(node)
                .iter()
                .filter_map(|d| action_of_node.get(d).copied())
                .collect();

            let index = actions.len();
            let action = match record {
                None => {
                    let changes = desired
                        .iter()
                        .map(|(name, value)| AttributeChange {
                            name: name.clone(),
                            old: None,
                            new: value.clone(),
                        })
                        .collect();
                    planned.insert(spec.name.clone(), desired);
                    PlanAction {
                        index,
                        action_type: ActionType::Create,
                        key,
                        provider_id: None,
                        changes,
                        desired: spec.attributes.clone(),
                        resource_dependencies,
                        dependencies,
                        refresh_record: false,
                        reason: String::from("not in state"),
                    }
                }
                Some(record) => {
                    let changes = attribute_changes(record, &desired);
                    let declared: BTreeSet<String> = spec.attributes.keys().cloned().collect();
                    let refresh_record = record.declared != declared
                        || record.dependencies != resource_dependencies;
                    planned.insert(spec.name.clone(), planned_from_state(record, desired));

                    let (action_type, reason) = if changes.is_empty() {
                        (ActionType::NoOp, String::new())
                    } else {
                        let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
                        (ActionType::Update, format!("changed: {}", names.join(", ")))
                    };
                    PlanAction {
                        index,
                        action_type,
                        key,
                        provider_id: Some(record.provider_id.clone()),
                        changes,
                        desired: spec.attributes.clone(),
                        resource_dependencies,
                        dependencies,
                        refresh_record,
                        reason,
                    }
                }
            };

            debug!("Planned {} {}", action.action_type, action.key);
            action_of_node.insert(node, index);
            actions.push(action);
        }

        Self::plan_deletes(graph, snapshot, &mut actions);

        let names = graph
            .nodes()
            .iter()
            .map(|spec| (spec.name.clone(), spec.key()))
            .collect();
        Plan::new(actions, names)
    }

    /// Appends deletes for records absent from the graph.
    fn plan_deletes(graph: &ResourceGraph, snapshot: &StateSnapshot, actions: &mut Vec<PlanAction>) {
        let orphans: BTreeMap<ResourceKey, &StateRecord> = snapshot
            .records()
            .filter(|r| graph.index_of_key(&r.key()).is_none())
            .map(|r| (r.key(), r))
            .collect();
        if orphans.is_empty() {
            return;
        }

        // Dense positions in key order; ties in the order below go by key.
        let keys: Vec<&ResourceKey> = orphans.keys().collect();
        let position: HashMap<&ResourceKey, usize> =
            keys.iter().enumerate().map(|(i, k)| (*k, i)).collect();

        // dependents[y] = orphans whose record depended on y
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); keys.len()];
        for (i, key) in keys.iter().enumerate() {
            for dep in &orphans[*key].dependencies {
                if let Some(&j) = position.get(dep) {
                    if i != j {
                        dependents[j].push(i);
                    }
                }
            }
        }

        // Reverse topological order: a record is deleted once every record
        // that depended on it has been deleted.
        let mut remaining: Vec<usize> = dependents.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|&(_, n)| *n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(keys.len());
        let mut done = vec![false; keys.len()];
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            done[i] = true;
            for dep in &orphans[keys[i]].dependencies {
                if let Some(&j) = position.get(dep) {
                    if j != i {
                        remaining[j] -= 1;
                        if remaining[j] == 0 {
                            ready.push(Reverse(j));
                        }
                    }
                }
            }
        }
        if order.len() < keys.len() {
            warn!("Stored dependencies form a cycle; deleting the rest in key order");
            order.extend((0..keys.len()).filter(|&i| !done[i]));
        }

        let mut delete_action: HashMap<usize, usize> = HashMap::with_capacity(keys.len());
        for i in order {
            let key = keys[i];
            let record = orphans[key];
            let index = actions.len();

            let mut dependencies: BTreeSet<usize> = dependents[i]
                .iter()
                .filter_map(|d| delete_action.get(d).copied())
                .collect();
            // Desired resources that used to depend on this one must be
            // updated first.
            for action in actions.iter().filter(|a| a.action_type != ActionType::Delete) {
                if snapshot
                    .get(&action.key)
                    .is_some_and(|r| r.dependencies.contains(key))
                {
                    dependencies.insert(action.index);
                }
            }

            debug!("Planned delete {key}");
            delete_action.insert(i, index);
            actions.push(PlanAction {
                index,
                action_type: ActionType::Delete,
                key: key.clone(),
                provider_id: Some(record.provider_id.clone()),
                changes: Vec::new(),
                desired: BTreeMap::new(),
                resource_dependencies: Vec::new(),
                dependencies: dependencies.into_iter().collect(),
                refresh_record: false,
                reason: String::from("not in configuration"),
            });
        }
    }
}

/// Resolves desired attributes against the planned values of earlier nodes.
fn resolve_desired(
    spec: &ResourceSpec,
    planned: &HashMap<String, PlannedAttributes>,
) -> PlannedAttributes {
    let lookup = |reference: &Reference| -> Option<Value> {
        match planned.get(&reference.target)?.get(reference.attribute())? {
            PlannedValue::Known(value) => {
                select_path(value, reference.path.get(1..).unwrap_or_default())
            }
            PlannedValue::Unknown => None,
        }
    };

    spec.attributes
        .iter()
        .map(|(name, expr)| {
            let value = resolve(expr, &lookup);
            (name.clone(), value)
        })
        .collect()
}

fn resolve<F>(expr: &Expr, lookup: &F) -> PlannedValue
where
    F: Fn(&Reference) -> Option<Value>,
{
    expr.resolve(lookup)
        .map_or(PlannedValue::Unknown, PlannedValue::Known)
}

fn select_path(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Changed attributes of an existing resource.
fn attribute_changes(record: &StateRecord, desired: &PlannedAttributes) -> Vec<AttributeChange> {
    let mut changes = Vec::new();

    for (name, value) in desired {
        let old = record.attributes.get(name);
        let changed = match value {
            PlannedValue::Unknown => true,
            PlannedValue::Known(new) => old != Some(new),
        };
        if changed {
            changes.push(AttributeChange {
                name: name.clone(),
                old: old.cloned(),
                new: value.clone(),
            });
        }
    }

    for name in record.declared.iter().filter(|n| !desired.contains_key(*n)) {
        match record.attributes.get(name) {
            None | Some(Value::Null) => {}
            Some(old) => changes.push(AttributeChange {
                name: name.clone(),
                old: Some(old.clone()),
                new: PlannedValue::Known(Value::Null),
            }),
        }
    }

    changes.sort_by(|a, b| a.name.cmp(&b.name));
    changes
}

/// State attributes overlaid with desired values.
fn planned_from_state(record: &StateRecord, desired: PlannedAttributes) -> PlannedAttributes {
    let mut planned: PlannedAttributes = record
        .attributes
        .iter()
        .filter(|(name, _)| desired.contains_key(*name) || !record.declared.contains(*name))
        .map(|(name, value)| (name.clone(), PlannedValue::Known(value.clone())))
        .collect();
    planned.extend(desired);
    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attributes;
    use crate::graph::GraphBuilder;
    use serde_json::json;

    fn graph(specs: Vec<ResourceSpec>) -> ResourceGraph {
        GraphBuilder::new().build(specs).unwrap()
    }

    fn record(kind: &str, name: &str, attrs: Value) -> StateRecord {
        let attributes: Attributes = serde_json::from_value(attrs).unwrap();
        StateRecord::new(&ResourceKey::new(kind, name), format!("{name}-id"), attributes)
    }

    fn net_vm() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::new("vm", "vm")
                .with_literal("size", "B1s")
                .with_reference("subnet_id", "net.id"),
            ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16"),
        ]
    }

    fn kinds(plan: &Plan) -> Vec<(ActionType, String)> {
        plan.actions
            .iter()
            .map(|a| (a.action_type, a.key.name.clone()))
            .collect()
    }

    #[test]
    fn test_empty_state_creates_in_dependency_order() {
        let plan = DiffEngine::new().plan(&graph(net_vm()), &StateSnapshot::new());
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionType::Create, String::from("net")),
                (ActionType::Create, String::from("vm")),
            ]
        );
        assert_eq!(plan.actions[1].dependencies, vec![0]);

        let subnet = plan.actions[1]
            .changes
            .iter()
            .find(|c| c.name == "subnet_id")
            .unwrap();
        assert_eq!(subnet.new, PlannedValue::Unknown);
    }

    #[test]
    fn test_unchanged_state_is_noop() {
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"cidr": "10.0.0.0/16", "id": "net-id"}))
                .with_declared(["cidr"]),
            record("vm", "vm", json!({"size": "B1s", "subnet_id": "net-id", "id": "vm-id"}))
                .with_declared(["size", "subnet_id"])
                .with_dependencies(vec![ResourceKey::new("net", "net")]),
        ]
        .into_iter()
        .collect();

        let plan = DiffEngine::new().plan(&graph(net_vm()), &snapshot);
        assert!(!plan.has_changes());
        assert!(plan.actions.iter().all(|a| !a.refresh_record));
    }

    #[test]
    fn test_update_carries_only_changed_attributes() {
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"cidr": "10.0.0.0/16", "id": "net-id"}))
                .with_declared(["cidr"]),
            record("vm", "vm", json!({"size": "B2s", "subnet_id": "net-id", "id": "vm-id"}))
                .with_declared(["size", "subnet_id"])
                .with_dependencies(vec![ResourceKey::new("net", "net")]),
        ]
        .into_iter()
        .collect();

        let plan = DiffEngine::new().plan(&graph(net_vm()), &snapshot);
        assert_eq!(plan.actions[1].action_type, ActionType::Update);
        assert_eq!(
            plan.actions[1].changes,
            vec![AttributeChange {
                name: String::from("size"),
                old: Some(json!("B2s")),
                new: PlannedValue::Known(json!("B1s")),
            }]
        );
        assert_eq!(plan.actions[1].provider_id.as_deref(), Some("vm-id"));
    }

    #[test]
    fn test_removed_attribute_becomes_null() {
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"cidr": "10.0.0.0/16", "tags": {"a": 1}, "id": "n"}))
                .with_declared(["cidr", "tags"]),
        ]
        .into_iter()
        .collect();
        let specs = vec![ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16")];

        let plan = DiffEngine::new().plan(&graph(specs), &snapshot);
        assert_eq!(plan.actions[0].action_type, ActionType::Update);
        assert_eq!(plan.actions[0].changes[0].name, "tags");
        assert_eq!(plan.actions[0].changes[0].new, PlannedValue::Known(Value::Null));
    }

    #[test]
    fn test_updated_reference_propagates_new_value() {
        // net changes an attribute that vm references: vm must be updated too.
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"cidr": "10.0.0.0/8", "id": "net-id"}))
                .with_declared(["cidr"]),
            record("vm", "vm", json!({"size": "B1s", "net_cidr": "10.0.0.0/8", "id": "vm-id"}))
                .with_declared(["net_cidr", "size"])
                .with_dependencies(vec![ResourceKey::new("net", "net")]),
        ]
        .into_iter()
        .collect();
        let specs = vec![
            ResourceSpec::new("net", "net").with_literal("cidr", "10.0.0.0/16"),
            ResourceSpec::new("vm", "vm")
                .with_literal("size", "B1s")
                .with_reference("net_cidr", "net.cidr"),
        ];

        let plan = DiffEngine::new().plan(&graph(specs), &snapshot);
        assert_eq!(plan.actions[1].action_type, ActionType::Update);
        assert_eq!(
            plan.actions[1].changes[0].new,
            PlannedValue::Known(json!("10.0.0.0/16"))
        );
    }

    #[test]
    fn test_deletes_follow_and_run_dependents_first() {
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"id": "n"})),
            record("subnet", "subnet", json!({"id": "s"}))
                .with_dependencies(vec![ResourceKey::new("net", "net")]),
            record("vm", "vm", json!({"id": "v"}))
                .with_dependencies(vec![ResourceKey::new("subnet", "subnet")]),
        ]
        .into_iter()
        .collect();

        let plan = DiffEngine::new().plan(&ResourceGraph::empty(), &snapshot);
        assert_eq!(
            kinds(&plan),
            vec![
                (ActionType::Delete, String::from("vm")),
                (ActionType::Delete, String::from("subnet")),
                (ActionType::Delete, String::from("net")),
            ]
        );
        assert_eq!(plan.actions[1].dependencies, vec![0]);
        assert_eq!(plan.actions[2].dependencies, vec![1]);
    }

    #[test]
    fn test_delete_waits_for_former_dependent_update() {
        let snapshot: StateSnapshot = vec![
            record("nsg", "old", json!({"id": "o"})),
            record("nic", "nic", json!({"nsg": "o", "id": "n"}))
                .with_declared(["nsg"])
                .with_dependencies(vec![ResourceKey::new("nsg", "old")]),
        ]
        .into_iter()
        .collect();
        let specs = vec![ResourceSpec::new("nic", "nic").with_literal("nsg", "none")];

        let plan = DiffEngine::new().plan(&graph(specs), &snapshot);
        assert_eq!(plan.actions[0].action_type, ActionType::Update);
        assert_eq!(plan.actions[1].action_type, ActionType::Delete);
        assert_eq!(plan.actions[1].dependencies, vec![0]);
    }

    #[test]
    fn test_plan_is_idempotent() {
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"cidr": "10.9.0.0/16", "id": "net-id"}))
                .with_declared(["cidr"]),
            record("old", "gone", json!({"id": "g"})),
        ]
        .into_iter()
        .collect();
        let g = graph(net_vm());

        let first = DiffEngine::new().plan(&g, &snapshot);
        let second = DiffEngine::new().plan(&g, &snapshot);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(kinds(&first), kinds(&second));
    }

    #[test]
    fn test_new_dependency_refreshes_record() {
        let snapshot: StateSnapshot = vec![
            record("net", "net", json!({"id": "n"})),
            record("vm", "vm", json!({"id": "v"})),
        ]
        .into_iter()
        .collect();
        let specs = vec![
            ResourceSpec::new("net", "net"),
            ResourceSpec::new("vm", "vm").with_dependency("net"),
        ];

        let plan = DiffEngine::new().plan(&graph(specs), &snapshot);
        assert!(!plan.has_changes());
        assert!(plan.actions[1].refresh_record);
    }
}

//! Plan types.
//!
//! A [`Plan`] is an ordered list of [`PlanAction`]s. Actions reference each
//! other by index; the executor only starts an action once every action it
//! depends on has succeeded. Plans are built fresh on every run and never
//! persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::{Expr, ResourceKey};

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Actions in execution rank order.
    pub actions: Vec<PlanAction>,
    /// Logical name to identity of every desired resource.
    #[serde(skip)]
    pub(crate) names: BTreeMap<String, ResourceKey>,
}

/// Types of actions in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a resource absent from state.
    Create,
    /// Update attributes of an existing resource.
    Update,
    /// Delete a resource no longer declared.
    Delete,
    /// No change; listed but never sent to a provider.
    #[serde(rename = "noop")]
    NoOp,
}

/// A planned value: known now, or only known after apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum PlannedValue {
    /// Value known at plan time.
    Known(Value),
    /// Value depends on a resource not yet applied.
    Unknown,
}

/// Change of one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Last applied value, if any.
    pub old: Option<Value>,
    /// Planned value.
    pub new: PlannedValue,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlanAction {
    /// Position in the plan.
    pub index: usize,
    /// Action type.
    pub action_type: ActionType,
    /// Resource identity.
    pub key: ResourceKey,
    /// Provider identifier, when the resource exists.
    pub provider_id: Option<String>,
    /// Attribute changes (all declared attributes for a create).
    pub changes: Vec<AttributeChange>,
    /// Desired attribute expressions, resolved at dispatch.
    #[serde(skip)]
    pub desired: BTreeMap<String, Expr>,
    /// Resources this one depends on in the desired graph.
    pub resource_dependencies: Vec<ResourceKey>,
    /// Indices of actions that must succeed first.
    pub dependencies: Vec<usize>,
    /// The stored record's metadata is stale and must be rewritten.
    #[serde(skip)]
    pub refresh_record: bool,
    /// Reason for this action.
    pub reason: String,
}

#[derive(Serialize)]
struct FingerprintEntry<'a> {
    action_type: ActionType,
    key: &'a ResourceKey,
    provider_id: Option<&'a str>,
    changes: &'a [AttributeChange],
    dependencies: &'a [usize],
}

impl Plan {
    /// Creates a plan from ordered actions.
    #[must_use]
    pub fn new(actions: Vec<PlanAction>, names: BTreeMap<String, ResourceKey>) -> Self {
        Self {
            created_at: Utc::now(),
            actions,
            names,
        }
    }

    /// Creates an empty plan.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new(), BTreeMap::new())
    }

    /// Identity of a desired resource by logical name.
    #[must_use]
    pub fn key_for(&self, name: &str) -> Option<&ResourceKey> {
        self.names.get(name)
    }

    /// Returns true if the plan has no actions at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if at least one action is not a no-op.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|a| a.action_type != ActionType::NoOp)
    }

    /// Returns the number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// Returns the number of actions of a type.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> usize {
        self.actions
            .iter()
            .filter(|a| a.action_type == action_type)
            .count()
    }

    /// Gets actions that depend on a specific action index.
    #[must_use]
    pub fn dependent_actions(&self, action_idx: usize) -> Vec<usize> {
        self.actions
            .iter()
            .filter(|a| a.dependencies.contains(&action_idx))
            .map(|a| a.index)
            .collect()
    }

    /// SHA-256 over the action sequence.
    ///
    /// Two plans computed from the same graph and state share a fingerprint.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for action in &self.actions {
            let entry = FingerprintEntry {
                action_type: action.action_type,
                key: &action.key,
                provider_id: action.provider_id.as_deref(),
                changes: &action.changes,
                dependencies: &action.dependencies,
            };
            hasher.update(serde_json::to_vec(&entry).unwrap_or_default());
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }
}

impl PlanAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action_type {
            ActionType::Create => format!("Create {}", self.key),
            ActionType::Update => format!("Update {}", self.key),
            ActionType::Delete => format!("Delete {}", self.key),
            ActionType::NoOp => format!("No change for {}", self.key),
        }
    }

    /// Names of the attributes declared by the desired resource.
    pub fn declared(&self) -> impl Iterator<Item = &str> {
        self.desired.keys().map(String::as_str)
    }
}

impl ActionType {
    /// Plan symbol used in text output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.old {
            Some(old) => write!(f, "{}: {old} -> {}", self.name, self.new),
            None => write!(f, "{}: {}", self.name, self.new),
        }
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action_type.symbol(), self.key)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan: {} to create, {} to update, {} to delete",
            self.count(ActionType::Create),
            self.count(ActionType::Update),
            self.count(ActionType::Delete)
        )?;
        for action in self.actions.iter().filter(|a| a.action_type != ActionType::NoOp) {
            writeln!(f, "  {action}")?;
            for change in &action.changes {
                writeln!(f, "      {change}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(index: usize, action_type: ActionType, name: &str, deps: Vec<usize>) -> PlanAction {
        PlanAction {
            index,
            action_type,
            key: ResourceKey::new("res", name),
            provider_id: None,
            changes: vec![AttributeChange {
                name: String::from("size"),
                old: None,
                new: PlannedValue::Known(json!(1)),
            }],
            desired: BTreeMap::new(),
            resource_dependencies: vec![],
            dependencies: deps,
            refresh_record: false,
            reason: String::new(),
        }
    }

    #[test]
    fn test_counts_and_dependents() {
        let plan = Plan::new(
            vec![
                action(0, ActionType::Create, "a", vec![]),
                action(1, ActionType::NoOp, "b", vec![0]),
                action(2, ActionType::Delete, "c", vec![0, 1]),
            ],
            BTreeMap::new(),
        );
        assert!(plan.has_changes());
        assert_eq!(plan.count(ActionType::Create), 1);
        assert_eq!(plan.dependent_actions(0), vec![1, 2]);
    }

    #[test]
    fn test_fingerprint_ignores_creation_time() {
        let a = Plan::new(vec![action(0, ActionType::Create, "a", vec![])], BTreeMap::new());
        let mut b = a.clone();
        b.created_at = Utc::now() + chrono::Duration::seconds(60);
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Plan::new(vec![action(0, ActionType::Update, "a", vec![])], BTreeMap::new());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_noop_only_plan_has_no_changes() {
        let plan = Plan::new(vec![action(0, ActionType::NoOp, "a", vec![])], BTreeMap::new());
        assert!(!plan.has_changes());
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_change_display() {
        let change = AttributeChange {
            name: String::from("subnet_id"),
            old: Some(json!("s-1")),
            new: PlannedValue::Unknown,
        };
        assert_eq!(change.to_string(), "subnet_id: \"s-1\" -> (known after apply)");
    }
}

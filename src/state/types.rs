//! State types for tracking applied resources.
//!
//! One [`StateRecord`] exists per resource ever created and not yet deleted.
//! A [`StateSnapshot`] is an owned copy of all records, read by the planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{Attributes, ResourceKey};

/// Current version of the record format.
pub const STATE_VERSION: u32 = 1;

/// Last applied state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    pub version: u32,
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Attributes as last returned by the provider.
    pub attributes: Attributes,
    /// Attribute names declared in configuration when last applied.
    #[serde(default)]
    pub declared: BTreeSet<String>,
    /// Resources this one depended on when last applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceKey>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(key: &ResourceKey, provider_id: impl Into<String>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            kind: key.kind.clone(),
            name: key.name.clone(),
            provider_id: provider_id.into(),
            attributes,
            declared: BTreeSet::new(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the declared attribute names.
    #[must_use]
    pub fn with_declared<I, S>(mut self, declared: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared = declared.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<ResourceKey>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Returns the resource identity.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.name)
    }

    /// Returns a copy carrying new attributes, keeping the creation time.
    #[must_use]
    pub fn updated(&self, attributes: Attributes) -> Self {
        Self {
            attributes,
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    /// File or object name used by the persisted layout.
    #[must_use]
    pub fn file_name(key: &ResourceKey) -> String {
        format!("{}.{}.json", key.kind, key.name)
    }

    /// Checks the record against the location it was read from.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch.
    pub fn check(&self, file_name: &str) -> Result<(), String> {
        if self.version != STATE_VERSION {
            return Err(format!(
                "unsupported record version {} (expected {STATE_VERSION})",
                self.version
            ));
        }
        if self.kind.is_empty() || self.name.is_empty() {
            return Err(String::from("record has an empty kind or name"));
        }
        let expected = Self::file_name(&self.key());
        if expected != file_name {
            return Err(format!("record for {} stored as {file_name}", self.key()));
        }
        Ok(())
    }
}

/// Owned copy of all records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    records: BTreeMap<ResourceKey, StateRecord>,
}

impl StateSnapshot {
    /// An empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a record.
    pub fn insert(&mut self, record: StateRecord) {
        self.records.insert(record.key(), record);
    }

    /// Removes a record.
    pub fn remove(&mut self, key: &ResourceKey) -> Option<StateRecord> {
        self.records.remove(key)
    }

    /// Record for a key.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<&StateRecord> {
        self.records.get(key)
    }

    /// Returns true if a record exists for the key.
    #[must_use]
    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.records.contains_key(key)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records ordered by key.
    pub fn records(&self) -> impl Iterator<Item = &StateRecord> {
        self.records.values()
    }
}

impl FromIterator<StateRecord> for StateSnapshot {
    fn from_iter<T: IntoIterator<Item = StateRecord>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: &str, name: &str) -> StateRecord {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("id"), json!(format!("{name}-1")));
        StateRecord::new(&ResourceKey::new(kind, name), format!("{name}-1"), attrs)
    }

    #[test]
    fn test_check_accepts_matching_location() {
        let r = record("azurerm_subnet", "internal");
        assert!(r.check("azurerm_subnet.internal.json").is_ok());
        assert!(r.check("azurerm_subnet.other.json").is_err());
    }

    #[test]
    fn test_check_rejects_unknown_version() {
        let mut r = record("net", "a");
        r.version = 99;
        assert!(r.check("net.a.json").unwrap_err().contains("version 99"));
    }

    #[test]
    fn test_updated_keeps_creation_time() {
        let r = record("net", "a");
        let next = r.updated(Attributes::new());
        assert_eq!(next.created_at, r.created_at);
        assert!(next.updated_at >= r.updated_at);
        assert!(next.attributes.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_by_key() {
        let snapshot: StateSnapshot = vec![record("vm", "b"), record("net", "z"), record("net", "a")]
            .into_iter()
            .collect();
        let keys: Vec<_> = snapshot.records().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["net.a", "net.z", "vm.b"]);
    }

    #[test]
    fn test_old_records_default_new_fields() {
        let raw = json!({
            "version": 1,
            "kind": "net",
            "name": "a",
            "provider_id": "n-1",
            "attributes": {"id": "n-1"},
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z"
        });
        let r: StateRecord = serde_json::from_value(raw).unwrap();
        assert!(r.declared.is_empty());
        assert!(r.dependencies.is_empty());
    }
}

//! Resource specifications.
//!
//! A [`ResourceSpec`] is one declared infrastructure object: its identity,
//! its desired attributes and its explicit dependencies. Specs are immutable
//! once loaded for a run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::LoadError;

use super::expr::{Expr, Reference};
use super::spec::ResourceConfig;

/// Identity of a resource: `(kind, logical name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind, e.g. `azurerm_virtual_network`.
    pub kind: String,
    /// Logical name, unique across the configuration.
    pub name: String,
}

impl ResourceKey {
    /// Creates a new key.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parses `kind.name`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (kind, name) = s.split_once('.')?;
        if kind.is_empty() || name.is_empty() || name.contains('.') {
            return None;
        }
        Some(Self::new(kind, name))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
    /// Desired attributes.
    pub attributes: BTreeMap<String, Expr>,
    /// Explicit dependencies, by logical name.
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    /// Creates a spec with no attributes.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds a literal attribute.
    #[must_use]
    pub fn with_literal(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), Expr::literal(value));
        self
    }

    /// Adds a reference attribute, `target` being `name.attribute[.path]`.
    ///
    /// A malformed target is stored as a literal string.
    #[must_use]
    pub fn with_reference(mut self, attribute: impl Into<String>, target: &str) -> Self {
        let expr = Reference::parse(target)
            .map_or_else(|_| Expr::literal(target), Expr::Reference);
        self.attributes.insert(attribute.into(), expr);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Builds a spec from its configuration form.
    ///
    /// # Errors
    ///
    /// Returns an error if an attribute holds a malformed reference.
    pub fn from_config(config: &ResourceConfig) -> Result<Self, LoadError> {
        let mut attributes = BTreeMap::new();
        for (attribute, value) in &config.attributes {
            let expr = Expr::parse(value).map_err(|reason| LoadError::MalformedReference {
                resource: config.name.clone(),
                attribute: attribute.clone(),
                expression: value.to_string(),
                reason,
            })?;
            attributes.insert(attribute.clone(), expr);
        }

        Ok(Self {
            kind: config.kind.clone(),
            name: config.name.clone(),
            attributes,
            depends_on: config.depends_on.clone(),
        })
    }

    /// Returns the resource identity.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.kind, &self.name)
    }

    /// All references in the desired attributes.
    pub fn references(&self) -> impl Iterator<Item = &Reference> {
        self.attributes.values().flat_map(Expr::references)
    }

    /// Names of every resource this spec depends on, implicit or explicit.
    #[must_use]
    pub fn dependency_names(&self) -> BTreeSet<&str> {
        self.references()
            .map(|r| r.target.as_str())
            .chain(self.depends_on.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_parse_and_display() {
        let key = ResourceKey::parse("azurerm_subnet.internal").unwrap();
        assert_eq!(key.kind, "azurerm_subnet");
        assert_eq!(key.name, "internal");
        assert_eq!(key.to_string(), "azurerm_subnet.internal");
        assert!(ResourceKey::parse("nodot").is_none());
        assert!(ResourceKey::parse("a.b.c").is_none());
    }

    #[test]
    fn test_dependency_names_merge_implicit_and_explicit() {
        let spec = ResourceSpec::new("vm", "vm")
            .with_reference("nic_id", "nic.id")
            .with_reference("subnet", "subnet.id")
            .with_dependency("nsg")
            .with_dependency("nic");
        let names: Vec<_> = spec.dependency_names().into_iter().collect();
        assert_eq!(names, vec!["nic", "nsg", "subnet"]);
    }

    #[test]
    fn test_from_config_reports_malformed_reference() {
        let config = ResourceConfig {
            kind: String::from("azurerm_subnet"),
            name: String::from("internal"),
            attributes: [(String::from("vnet"), json!("${vnet}"))].into_iter().collect(),
            depends_on: vec![],
        };
        let err = ResourceSpec::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            LoadError::MalformedReference { ref resource, ref attribute, .. }
                if resource == "internal" && attribute == "vnet"
        ));
    }
}

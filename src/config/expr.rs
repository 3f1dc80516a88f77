//! Attribute expressions.
//!
//! An attribute value is either a literal or a reference to an attribute of
//! another resource. References are written as a whole string value of the
//! form `${name.attribute[.path...]}`. Anywhere in a string, `$${` escapes a
//! literal `${`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map exchanged with providers and persisted in state.
pub type Attributes = BTreeMap<String, Value>;

/// A reference to an attribute of another resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Logical name of the referenced resource.
    pub target: String,
    /// Attribute name followed by nested keys or list indices.
    pub path: Vec<String>,
}

/// A possibly-unresolved attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// A JSON scalar (null, bool, number or string).
    Literal(Value),
    /// A list of expressions.
    List(Vec<Expr>),
    /// A map of expressions.
    Map(BTreeMap<String, Expr>),
    /// A reference to another resource's attribute.
    Reference(Reference),
}

impl Reference {
    /// Parses the inside of `${...}`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the text is not
    /// `name.attribute[.path...]` with non-empty segments.
    pub fn parse(inner: &str) -> Result<Self, String> {
        let segments: Vec<&str> = inner.split('.').map(str::trim).collect();
        if segments.len() < 2 {
            return Err(String::from("expected `name.attribute`"));
        }
        if segments.iter().any(|s| s.is_empty()) {
            return Err(String::from("empty path segment"));
        }
        if segments.iter().any(|s| s.contains(['$', '{', '}'])) {
            return Err(String::from("nested expressions are not supported"));
        }

        Ok(Self {
            target: segments[0].to_string(),
            path: segments[1..].iter().map(|s| (*s).to_string()).collect(),
        })
    }

    /// Name of the first path segment (the top-level attribute).
    #[must_use]
    pub fn attribute(&self) -> &str {
        self.path.first().map_or("", String::as_str)
    }

    /// Selects the referenced value out of the target's attributes.
    ///
    /// Object segments are looked up by key, array segments by index.
    #[must_use]
    pub fn select(&self, attributes: &Attributes) -> Option<Value> {
        let mut current = attributes.get(self.attribute())?;
        for segment in self.path.iter().skip(1) {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current.clone())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.target, self.path.join("."))
    }
}

impl Expr {
    /// Parses a configuration value into an expression tree.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed reference found.
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => Self::parse_string(s),
            Value::Array(items) => items
                .iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::List),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Self::parse(v).map(|e| (k.clone(), e)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Self::Map),
            scalar => Ok(Self::Literal(scalar.clone())),
        }
    }

    fn parse_string(s: &str) -> Result<Self, String> {
        if let Some(inner) = s.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
            return Reference::parse(inner).map(Self::Reference);
        }

        let mut literal = String::with_capacity(s.len());
        let mut rest = s;
        while let Some(at) = rest.find("${") {
            let (before, after) = rest.split_at(at);
            let Some(before) = before.strip_suffix('$') else {
                return Err(String::from(
                    "references must be the whole value; string interpolation is not supported",
                ));
            };
            literal.push_str(before);
            literal.push_str("${");
            rest = after.get(2..).unwrap_or_default();
        }
        literal.push_str(rest);
        Ok(Self::Literal(Value::String(literal)))
    }

    /// Shorthand for a literal.
    #[must_use]
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Collects every reference in the tree, depth first.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|e| e.collect_references(out)),
            Self::Map(map) => map.values().for_each(|e| e.collect_references(out)),
        }
    }

    /// Resolves the tree to a concrete value.
    ///
    /// Returns `None` if any reference cannot be resolved by `lookup`.
    pub fn resolve<F>(&self, lookup: &F) -> Option<Value>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Literal(v) => Some(v.clone()),
            Self::Reference(r) => lookup(r),
            Self::List(items) => items
                .iter()
                .map(|e| e.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, e)| e.resolve(lookup).map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Value::Object),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Reference(r) => write!(f, "{r}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_whole_value_reference() {
        let expr = Expr::parse(&json!("${net.id}")).unwrap();
        assert_eq!(
            expr,
            Expr::Reference(Reference {
                target: String::from("net"),
                path: vec![String::from("id")],
            })
        );
    }

    #[test]
    fn test_parse_nested_references() {
        let expr = Expr::parse(&json!({
            "subnets": ["${a.id}", "${b.id}"],
            "location": "westeurope",
        }))
        .unwrap();
        let targets: Vec<_> = expr.references().iter().map(|r| r.target.as_str()).collect();
        assert_eq!(targets, vec!["a", "b"]);
    }

    #[test]
    fn test_interpolation_rejected() {
        assert!(Expr::parse(&json!("prefix-${net.id}")).is_err());
        assert!(Expr::parse(&json!("${net}")).is_err());
        assert!(Expr::parse(&json!("${net..id}")).is_err());
    }

    #[test]
    fn test_escape_inside_string() {
        let expr = Expr::parse(&json!("echo $${HOME} and $${USER}")).unwrap();
        assert_eq!(expr, Expr::literal("echo ${HOME} and ${USER}"));
        assert!(expr.references().is_empty());
    }

    #[test]
    fn test_escape_does_not_hide_interpolation() {
        assert!(Expr::parse(&json!("$${a} ${net.id}")).is_err());
    }

    #[test]
    fn test_escape_is_literal() {
        let expr = Expr::parse(&json!("$${not.a.ref}")).unwrap();
        assert_eq!(expr, Expr::literal("${not.a.ref}"));
    }

    #[test]
    fn test_select_nested_path() {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("ip"), json!({ "private": ["10.0.0.4"] }));
        let reference = Reference::parse("nic.ip.private.0").unwrap();
        assert_eq!(reference.select(&attrs), Some(json!("10.0.0.4")));

        let missing = Reference::parse("nic.ip.public").unwrap();
        assert_eq!(missing.select(&attrs), None);
    }

    #[test]
    fn test_resolve_unknown_reference_is_none() {
        let expr = Expr::parse(&json!(["${a.id}", "x"])).unwrap();
        let unknown = |_: &Reference| None::<Value>;
        let known = |_: &Reference| Some(json!("id-1"));
        assert_eq!(expr.resolve(&unknown), None);
        assert_eq!(expr.resolve(&known), Some(json!(["id-1", "x"])));
    }
}

//! Provider interface and registry.
//!
//! A provider performs the actual create/update/delete calls for a set of
//! resource kinds. The engine treats kinds as opaque strings and only talks
//! to providers through [`Provider`].

mod http;
mod local;

pub use http::HttpProvider;
pub use local::LocalProvider;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Attributes, InfraConfig, ProviderBackend, ProviderConfig};
use crate::context::RunContext;
use crate::error::{HalldyllError, LoadError, ProviderError, Result};

/// Default sandbox directory for the local provider, relative to the
/// configuration directory.
pub const DEFAULT_SANDBOX_DIR: &str = ".halldyll/sandbox";

/// Result of a successful create call.
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Attributes of the created object, including computed ones.
    pub attributes: Attributes,
}

/// A backend able to create, update and delete resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates an object and returns its identifier and attributes.
    async fn create(
        &self,
        ctx: &RunContext,
        kind: &str,
        attributes: &Attributes,
    ) -> std::result::Result<Created, ProviderError>;

    /// Applies attribute changes to an existing object and returns its full
    /// attributes. A `null` change removes the attribute.
    async fn update(
        &self,
        ctx: &RunContext,
        kind: &str,
        provider_id: &str,
        changes: &Attributes,
    ) -> std::result::Result<Attributes, ProviderError>;

    /// Deletes an object.
    async fn delete(
        &self,
        ctx: &RunContext,
        kind: &str,
        provider_id: &str,
    ) -> std::result::Result<(), ProviderError>;
}

#[derive(Clone)]
struct Registered {
    name: String,
    provider: Arc<dyn Provider>,
}

/// Maps resource kinds to providers.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_kind: BTreeMap<String, Registered>,
    fallback: Option<Registered>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider for the given kinds, replacing earlier entries.
    pub fn register<I, S>(&mut self, name: &str, kinds: I, provider: Arc<dyn Provider>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for kind in kinds {
            let kind = kind.into();
            debug!("Registering provider {name} for kind {kind}");
            self.by_kind.insert(
                kind,
                Registered {
                    name: name.to_string(),
                    provider: Arc::clone(&provider),
                },
            );
        }
    }

    /// Registers a provider serving every kind without an explicit entry.
    pub fn set_fallback(&mut self, name: &str, provider: Arc<dyn Provider>) {
        self.fallback = Some(Registered {
            name: name.to_string(),
            provider,
        });
    }

    fn entry(&self, kind: &str) -> Option<&Registered> {
        self.by_kind.get(kind).or(self.fallback.as_ref())
    }

    /// Provider serving `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Provider>> {
        self.entry(kind).map(|r| Arc::clone(&r.provider))
    }

    /// Name of the provider serving `kind`.
    #[must_use]
    pub fn provider_name(&self, kind: &str) -> Option<&str> {
        self.entry(kind).map(|r| r.name.as_str())
    }

    /// Returns true if some provider serves `kind`.
    #[must_use]
    pub fn supports(&self, kind: &str) -> bool {
        self.entry(kind).is_some()
    }

    /// Explicitly registered kinds.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.by_kind.keys().map(String::as_str)
    }

    /// Builds the registry described by a configuration.
    ///
    /// Relative paths are resolved against `base_dir`. Without any provider
    /// configured, a local sandbox provider serves every kind.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider cannot be constructed.
    pub fn from_config(config: &InfraConfig, base_dir: &Path) -> Result<Self> {
        let mut registry = Self::new();

        if config.providers.is_empty() {
            let provider = LocalProvider::new(base_dir.join(DEFAULT_SANDBOX_DIR));
            info!("Using local sandbox provider at {}", provider.root().display());
            registry.set_fallback("sandbox", Arc::new(provider));
            return Ok(registry);
        }

        for provider_config in &config.providers {
            let provider = build_provider(provider_config, base_dir)?;
            info!(
                "Configured {} provider {} for {} kind(s)",
                provider_config.backend,
                provider_config.name,
                provider_config.kinds.len()
            );
            registry.register(&provider_config.name, provider_config.kinds.iter().cloned(), provider);
        }

        Ok(registry)
    }
}

fn build_provider(config: &ProviderConfig, base_dir: &Path) -> Result<Arc<dyn Provider>> {
    match config.backend {
        ProviderBackend::Local => {
            let dir = config
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(DEFAULT_SANDBOX_DIR), |p| base_dir.join(p));
            Ok(Arc::new(LocalProvider::new(dir)))
        }
        ProviderBackend::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                HalldyllError::Load(LoadError::validation(
                    format!("Provider '{}' uses http backend but no endpoint", config.name),
                    "providers.endpoint",
                ))
            })?;
            let token = config
                .token_env
                .as_deref()
                .map(crate::config::ConfigParser::require_env)
                .transpose()?;
            Ok(Arc::new(HttpProvider::new(endpoint, token)?))
        }
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: BTreeMap<&str, &str> = self
            .by_kind
            .iter()
            .map(|(k, r)| (k.as_str(), r.name.as_str()))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("kinds", &kinds)
            .field("fallback", &self.fallback.as_ref().map(|r| r.name.as_str()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        let provider: Arc<dyn Provider> = Arc::new(MockProvider::new());
        registry.register("cloud", ["net", "vm"], provider);

        assert!(registry.supports("net"));
        assert!(!registry.supports("disk"));
        assert_eq!(registry.provider_name("vm"), Some("cloud"));
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec!["net", "vm"]);
    }

    #[test]
    fn test_fallback_serves_unregistered_kinds() {
        let mut registry = ProviderRegistry::new();
        registry.set_fallback("sandbox", Arc::new(MockProvider::new()));
        registry.register("cloud", ["net"], Arc::new(MockProvider::new()));

        assert_eq!(registry.provider_name("net"), Some("cloud"));
        assert_eq!(registry.provider_name("anything"), Some("sandbox"));
    }

    #[test]
    fn test_from_config_without_providers_uses_sandbox() {
        let config = ConfigParser::new()
            .parse_yaml("project:\n  name: demo\n", None)
            .unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let registry = ProviderRegistry::from_config(&config, dir.path()).unwrap();
        assert_eq!(registry.provider_name("azurerm_subnet"), Some("sandbox"));
    }

    #[test]
    fn test_from_config_missing_token_env() {
        let config = ConfigParser::new()
            .parse_yaml(
                r"
project:
  name: demo
providers:
  - name: cloud
    backend: http
    endpoint: http://localhost:1
    token_env: HALLDYLL_TEST_TOKEN_THAT_IS_NOT_SET
    kinds: [net]
",
                None,
            )
            .unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let err = ProviderRegistry::from_config(&config, dir.path()).unwrap_err();
        assert!(matches!(err, HalldyllError::Load(LoadError::MissingEnvVar { .. })));
    }
}

//! Configuration specification types.
//!
//! This module defines all the structs that map to the `halldyll.infra.yaml` file.
//! The file is a declarative description of the desired infrastructure plus
//! the settings the engine needs to reconcile it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use validator::Validate;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
pub struct InfraConfig {
    /// Project-level configuration.
    #[validate(nested)]
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Execution settings.
    #[serde(default)]
    #[validate(nested)]
    pub execution: ExecutionConfig,
    /// Provider backends and the kinds they serve.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ProjectConfig {
    /// Unique name for the project.
    #[validate(length(min = 1, max = 63))]
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    #[validate(length(min = 1, max = 63))]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Execution settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum number of provider calls in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 256))]
    pub parallelism: usize,
    /// Deadline for each provider call, in seconds.
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1, max = 86400))]
    pub timeout_secs: u64,
}

/// A provider backend serving a set of kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Name used in logs and output.
    pub name: String,
    /// Backend implementation.
    pub backend: ProviderBackend,
    /// Resource kinds served by this provider.
    pub kinds: Vec<String>,
    /// Base URL (http backend).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token (http backend).
    #[serde(default)]
    pub token_env: Option<String>,
    /// Storage directory (local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// Provider backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderBackend {
    /// File-backed sandbox provider.
    Local,
    /// Generic JSON-over-HTTP provider.
    Http,
}

/// A resource as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Resource kind.
    pub kind: String,
    /// Logical name.
    pub name: String,
    /// Desired attributes; string values of the form `${name.attr}` are references.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependencies, by logical name.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

// Default value functions

const fn default_parallelism() -> usize {
    4
}

const fn default_timeout_secs() -> u64 {
    300
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl InfraConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Finds the provider configuration serving a kind.
    #[must_use]
    pub fn provider_for(&self, kind: &str) -> Option<&ProviderConfig> {
        self.providers
            .iter()
            .find(|p| p.kinds.iter().any(|k| k == kind))
    }
}

impl std::fmt::Display for ProviderBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Http => "http",
        };
        write!(f, "{s}")
    }
}

//! Configuration module for the Halldyll provisioning engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halldyll.infra.yaml`
//! - Turning declared resources into [`ResourceSpec`]s with parsed references
//! - Validation of names, settings and provider coverage
//! - Computing configuration hashes for change detection

mod expr;
mod hash;
mod parser;
mod resource;
mod spec;
mod validator;

pub use expr::{Attributes, Expr, Reference};
pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use resource::{ResourceKey, ResourceSpec};
pub use spec::{
    ExecutionConfig, InfraConfig, ProjectConfig, ProviderBackend, ProviderConfig,
    ResourceConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};

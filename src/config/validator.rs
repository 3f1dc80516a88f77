//! Configuration validation for infrastructure definitions.
//!
//! This module checks a parsed configuration for everything that can be
//! decided before a graph is built: naming, uniqueness, reference syntax,
//! provider coverage and execution settings.

use crate::error::{HalldyllError, LoadError, Result};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use validator::Validate;

use super::resource::ResourceSpec;
use super::spec::{InfraConfig, ProviderBackend, ProviderConfig, ResourceConfig, StateBackend};

/// Validator for infrastructure configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
    /// Typed error reported when this is the first failure.
    cause: Option<LoadError>,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            cause: None,
        }
    }

    fn typed(field: impl Into<String>, cause: LoadError) -> Self {
        Self {
            field: field.into(),
            message: cause.to_string(),
            cause: Some(cause),
        }
    }

    fn into_load_error(self) -> LoadError {
        self.cause.unwrap_or(LoadError::ValidationError {
            message: self.message,
            field: Some(self.field),
        })
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an infrastructure configuration, collecting every problem.
    #[must_use]
    pub fn check(&self, config: &InfraConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_settings(config, &mut result);
        Self::validate_project(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_providers(&config.providers, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_coverage(config, &mut result);

        result
    }

    /// Validates an infrastructure configuration.
    ///
    /// # Errors
    ///
    /// Returns the first error found.
    pub fn validate(&self, config: &InfraConfig) -> Result<ValidationResult> {
        let mut result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first = result.errors.remove(0);
            Err(HalldyllError::Load(first.into_load_error()))
        }
    }

    /// Applies the derive rules on project and execution settings.
    fn validate_settings(config: &InfraConfig, result: &mut ValidationResult) {
        let Err(errors) = config.validate() else {
            return;
        };
        let mut fields: Vec<(String, String)> = Vec::new();
        collect_field_errors("", &errors, &mut fields);
        fields.sort();
        for (field, message) in fields {
            result.errors.push(ValidationError::new(field, message));
        }
    }

    fn validate_project(config: &InfraConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if !project.name.is_empty() && !is_valid_name(&project.name) {
            result.errors.push(ValidationError::new(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            ));
        }
    }

    fn validate_state(config: &InfraConfig, result: &mut ValidationResult) {
        let state = &config.state;
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError::new(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    ));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_providers(providers: &[ProviderConfig], result: &mut ValidationResult) {
        let mut seen_names = HashSet::new();
        let mut served: HashMap<&str, &str> = HashMap::new();

        for (i, provider) in providers.iter().enumerate() {
            let prefix = format!("providers[{i}]");

            if !seen_names.insert(provider.name.as_str()) {
                result.errors.push(ValidationError::new(
                    format!("{prefix}.name"),
                    format!("Duplicate provider name: {}", provider.name),
                ));
            }

            if provider.kinds.is_empty() {
                result.warnings.push(format!(
                    "{prefix}.kinds: provider '{}' serves no kinds",
                    provider.name
                ));
            }

            for kind in &provider.kinds {
                if let Some(other) = served.insert(kind.as_str(), provider.name.as_str()) {
                    result.errors.push(ValidationError::new(
                        format!("{prefix}.kinds"),
                        format!(
                            "Kind '{kind}' is served by both '{other}' and '{}'",
                            provider.name
                        ),
                    ));
                }
            }

            match provider.backend {
                ProviderBackend::Http => {
                    if provider.endpoint.as_ref().is_none_or(String::is_empty) {
                        result.errors.push(ValidationError::new(
                            format!("{prefix}.endpoint"),
                            format!("Provider '{}' uses http backend but no endpoint", provider.name),
                        ));
                    }
                    if provider.path.is_some() {
                        result
                            .warnings
                            .push(format!("{prefix}.path is ignored by the http backend"));
                    }
                }
                ProviderBackend::Local => {
                    if provider.endpoint.is_some() {
                        result
                            .warnings
                            .push(format!("{prefix}.endpoint is ignored by the local backend"));
                    }
                }
            }
        }
    }

    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let mut seen: HashMap<&str, &str> = HashMap::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !is_valid_kind(&resource.kind) {
                result.errors.push(ValidationError::typed(
                    format!("{prefix}.kind"),
                    LoadError::InvalidIdentifier {
                        what: "kind",
                        value: resource.kind.clone(),
                        resource: resource.name.clone(),
                        reason: String::from(
                            "must start with a lowercase letter and contain only [a-z0-9_]",
                        ),
                    },
                ));
            }

            if !is_valid_identifier(&resource.name) {
                result.errors.push(ValidationError::typed(
                    format!("{prefix}.name"),
                    LoadError::InvalidIdentifier {
                        what: "name",
                        value: resource.name.clone(),
                        resource: resource.name.clone(),
                        reason: String::from(
                            "must start with a letter or underscore and contain only [A-Za-z0-9_-]",
                        ),
                    },
                ));
            }

            if let Some(first_kind) = seen.insert(resource.name.as_str(), resource.kind.as_str()) {
                result.errors.push(ValidationError::typed(
                    format!("{prefix}.name"),
                    LoadError::DuplicateName {
                        name: resource.name.clone(),
                        first_kind: first_kind.to_string(),
                        second_kind: resource.kind.clone(),
                    },
                ));
            }

            for attribute in resource.attributes.keys() {
                if attribute.is_empty() || attribute.contains('.') {
                    result.errors.push(ValidationError::typed(
                        format!("{prefix}.attributes"),
                        LoadError::InvalidIdentifier {
                            what: "attribute",
                            value: attribute.clone(),
                            resource: resource.name.clone(),
                            reason: String::from("must be non-empty and contain no '.'"),
                        },
                    ));
                }
            }

            let mut deps = HashSet::new();
            for dep in &resource.depends_on {
                if !deps.insert(dep.as_str()) {
                    result.warnings.push(format!(
                        "{prefix}.depends_on: '{dep}' is listed more than once"
                    ));
                }
            }

            if let Err(e) = ResourceSpec::from_config(resource) {
                result
                    .errors
                    .push(ValidationError::typed(format!("{prefix}.attributes"), e));
            }
        }
    }

    /// Every declared kind must be served by a provider, unless no provider is
    /// configured at all, in which case the local sandbox serves everything.
    fn validate_coverage(config: &InfraConfig, result: &mut ValidationResult) {
        if config.providers.is_empty() {
            if !config.resources.is_empty() {
                result.warnings.push(String::from(
                    "No providers configured; every kind will use the local sandbox provider",
                ));
            }
            return;
        }

        let mut reported = HashSet::new();
        for (i, resource) in config.resources.iter().enumerate() {
            if config.provider_for(&resource.kind).is_none()
                && reported.insert(resource.kind.as_str())
            {
                result.errors.push(ValidationError::typed(
                    format!("resources[{i}].kind"),
                    LoadError::NoProvider {
                        kind: resource.kind.clone(),
                        resource: resource.name.clone(),
                    },
                ));
            }
        }
    }
}

fn collect_field_errors(
    prefix: &str,
    errors: &validator::ValidationErrors,
    out: &mut Vec<(String, String)>,
) {
    for (field, kind) in errors.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            validator::ValidationErrorsKind::Field(list) => {
                for error in list {
                    let message = error
                        .message
                        .as_ref()
                        .map_or_else(|| format!("failed '{}' check", error.code), ToString::to_string);
                    out.push((path.clone(), message));
                }
            }
            validator::ValidationErrorsKind::Struct(inner) => {
                collect_field_errors(&path, inner, out);
            }
            validator::ValidationErrorsKind::List(items) => {
                for (index, inner) in items {
                    collect_field_errors(&format!("{path}[{index}]"), inner, out);
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Resource kinds: `[a-z][a-z0-9_]*`.
fn is_valid_kind(kind: &str) -> bool {
    let mut chars = kind.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Logical names: `[A-Za-z_][A-Za-z0-9_-]*`. Dots are reserved for references.
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

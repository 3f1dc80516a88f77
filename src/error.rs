//! Error types for the Halldyll provisioning engine.
//!
//! Errors are grouped by the phase that raises them:
//!
//! - load time: [`LoadError`] and [`GraphError`], fatal to the run;
//! - apply time: [`ProviderError`] and [`HalldyllError::Timeout`], local to
//!   a single action;
//! - persistence: [`StateError`], where corruption on load is fatal.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halldyll provisioning engine.
#[derive(Debug, Error)]
pub enum HalldyllError {
    /// Malformed configuration or resource specification.
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Dependency graph construction failed.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// A provider call failed.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A provider call exceeded its deadline.
    #[error("Provider call for {resource} timed out after {timeout_secs}s")]
    Timeout {
        /// Resource whose call timed out.
        resource: String,
        /// Deadline that was exceeded.
        timeout_secs: u64,
    },

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Run-level reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised while loading configuration and resource specifications.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A setting failed validation.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Two resources share a logical name.
    #[error("Duplicate resource name: {name} (declared as {first_kind} and {second_kind})")]
    DuplicateName {
        /// The duplicated name.
        name: String,
        /// Kind of the first declaration.
        first_kind: String,
        /// Kind of the second declaration.
        second_kind: String,
    },

    /// A resource kind or name does not match the allowed format.
    #[error("Invalid {what} '{value}' on resource '{resource}': {reason}")]
    InvalidIdentifier {
        /// What is invalid (kind, name, attribute).
        what: &'static str,
        /// The offending value.
        value: String,
        /// Resource carrying the value.
        resource: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A `${...}` expression could not be parsed.
    #[error("Malformed reference '{expression}' in {resource}.{attribute}: {reason}")]
    MalformedReference {
        /// Resource carrying the expression.
        resource: String,
        /// Attribute carrying the expression.
        attribute: String,
        /// The expression text.
        expression: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No provider is registered for a resource kind.
    #[error("No provider registered for kind '{kind}' (needed by '{resource}')")]
    NoProvider {
        /// Unregistered kind.
        kind: String,
        /// First resource needing it.
        resource: String,
    },
}

/// Errors raised while building the dependency graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A reference targets a resource that is not declared.
    #[error("Resource '{resource}' references undeclared resource in '{reference}'")]
    UnresolvedReference {
        /// Resource carrying the reference.
        resource: String,
        /// The reference as written.
        reference: String,
    },

    /// The declared references form a cycle.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle {
        /// Participating resources, in cycle order.
        cycle: Vec<String>,
    },
}

/// Errors reported by provider backends.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure talking to the backend.
    #[error("Network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// Credentials were rejected.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Description of the auth failure.
        message: String,
    },

    /// Backend quota or rate limit exhausted.
    #[error("Quota exceeded: {message}")]
    Quota {
        /// Description of the quota issue.
        message: String,
    },

    /// Backend reported a conflicting resource.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The resource does not exist on the backend.
    #[error("Resource not found: {kind}/{provider_id}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// Backend rejected the request.
    #[error("Request rejected ({status}): {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Message from the backend.
        message: String,
    },

    /// Backend answered with something unreadable.
    #[error("Invalid response: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },

    /// Kind not served by this provider.
    #[error("Kind '{kind}' is not supported by provider '{provider}'")]
    UnsupportedKind {
        /// The kind.
        kind: String,
        /// The provider name.
        provider: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// A persisted record is unreadable or inconsistent.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Storage backend error.
    #[error("{backend} state backend error: {message}")]
    Backend {
        /// Backend name.
        backend: &'static str,
        /// Description of the error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// No record exists for a key.
    #[error("No state record for {key}")]
    RecordNotFound {
        /// The requested key.
        key: String,
    },
}

/// Run-level errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The run finished but not every action succeeded.
    #[error("Apply incomplete: {failed} failed, {blocked} blocked, {cancelled} cancelled")]
    Incomplete {
        /// Actions whose provider call failed.
        failed: usize,
        /// Actions withheld because a dependency failed.
        blocked: usize,
        /// Actions never dispatched because the run was cancelled.
        cancelled: usize,
    },

    /// The run was cancelled before every action was dispatched.
    #[error("Apply cancelled: {applied} applied, {cancelled} never started")]
    Cancelled {
        /// Actions applied before cancellation.
        applied: usize,
        /// Actions never dispatched.
        cancelled: usize,
    },

    /// The run was aborted before execution started.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, HalldyllError>;

fn format_cycle(cycle: &[String]) -> String {
    let mut path = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        path.push_str(" -> ");
        path.push_str(first);
    }
    path
}

impl HalldyllError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true for errors raised before any action could run.
    #[must_use]
    pub const fn is_load_time(&self) -> bool {
        matches!(self, Self::Load(_) | Self::Graph(_))
    }
}

impl LoadError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl ProviderError {
    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Returns true if the provider may succeed on a later attempt.
    ///
    /// The engine itself never retries; providers use this for their own
    /// retry policy.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Quota { .. })
    }
}

impl StateError {
    /// Creates a corruption error.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a backend error.
    #[must_use]
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

//! Run-level advisory locking.
//!
//! `apply` and `destroy` hold the lock for the duration of a run so two
//! concurrent runs cannot interleave writes to the same state. Locks expire,
//! so a crashed run does not block the state forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

use super::store::StateStore;

/// Lock expiry duration in seconds.
pub const LOCK_EXPIRY_SECS: i64 = 3600;

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Who holds the lock.
    pub holder: String,
    /// Operation being performed (apply, destroy, manual).
    #[serde(default)]
    pub operation: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock info.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// A held lock, released explicitly at the end of a run.
pub struct StateLock {
    store: Arc<dyn StateStore>,
    info: LockInfo,
}

impl StateLock {
    /// Acquires the run lock on `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if another live lock exists or the backend fails.
    pub async fn acquire(store: Arc<dyn StateStore>, operation: &str) -> Result<Self> {
        let info = store.acquire_lock(&generate_holder_id(), operation).await?;
        Ok(Self { store, info })
    }

    /// Gets the lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Releases the lock. Failures are logged; an unreleased lock expires.
    pub async fn release(self) {
        if let Err(e) = self.store.release_lock(&self.info.lock_id).await {
            warn!("Failed to release state lock {}: {e}", self.info.lock_id);
        }
    }
}

impl std::fmt::Debug for StateLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateLock")
            .field("backend", &self.store.backend_type())
            .field("info", &self.info)
            .finish()
    }
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get()
        .map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_creation() {
        let info = LockInfo::new("test-holder", "apply");
        assert_eq!(info.holder, "test-holder");
        assert_eq!(info.operation, "apply");
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 0);
    }

    #[test]
    fn test_expired_lock() {
        let mut info = LockInfo::new("h", "apply");
        info.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(info.is_expired());
        assert_eq!(info.remaining_secs(), 0);
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}

//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Each record is written and removed on its own, so a crash between two
//! commits never leaves a half-written state behind.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{StateRecord, StateSnapshot};
use crate::config::ResourceKey;
use crate::error::Result;

/// Directory (or key segment) holding one file per record.
pub const RECORDS_DIR: &str = "records";

/// Lock file name.
pub const LOCK_FILE: &str = "state.lock";

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every record.
    ///
    /// An unreadable record is a corruption error.
    async fn load(&self) -> Result<StateSnapshot>;

    /// Atomically inserts or replaces one record.
    async fn commit(&self, record: &StateRecord) -> Result<()>;

    /// Atomically removes one record. Removing a missing record succeeds.
    async fn remove(&self, key: &ResourceKey) -> Result<()>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still owns it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the run lock regardless of its owner.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked by a live lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Human-readable location of the state.
    fn location(&self) -> String;
}

//! State management module for the Halldyll provisioning engine.
//!
//! This module provides persistent per-resource state: one record for each
//! resource the engine has created, committed as soon as its action succeeds.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, StateLock, generate_holder_id};
pub use s3::S3StateStore;
pub use store::{LOCK_FILE, RECORDS_DIR, StateStore};
pub use types::{STATE_VERSION, StateRecord, StateSnapshot};

use std::path::Path;
use std::sync::Arc;

use crate::config::{StateBackend, StateConfig};
use crate::error::{HalldyllError, LoadError, Result};

/// Opens the state store described by a configuration.
///
/// A relative local path is resolved against `base_dir`.
///
/// # Errors
///
/// Returns an error if the S3 backend lacks a bucket or cannot be initialized.
pub async fn open_store(config: &StateConfig, base_dir: &Path) -> Result<Arc<dyn StateStore>> {
    match config.backend {
        StateBackend::Local => {
            let dir = config
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            Ok(Arc::new(LocalStateStore::with_base_dir(dir)))
        }
        StateBackend::S3 => {
            let bucket = config.bucket.as_deref().ok_or_else(|| {
                HalldyllError::Load(LoadError::validation(
                    "S3 bucket name is required when using S3 backend",
                    "state.bucket",
                ))
            })?;
            let store =
                S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref()).await?;
            Ok(Arc::new(store))
        }
    }
}

//! Local file-based state storage backend.
//!
//! Layout:
//!
//! ```text
//! <base_dir>/records/<kind>.<name>.json
//! <base_dir>/state.lock
//! ```
//!
//! Records are written to a temporary file, synced and renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ResourceKey;
use crate::error::{HalldyllError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::{LOCK_FILE, RECORDS_DIR, StateStore};
use super::types::{StateRecord, StateSnapshot};

/// Default state directory name.
pub const STATE_DIR: &str = ".halldyll";

/// Suffix of in-flight temporary files.
const TEMP_SUFFIX: &str = ".tmp";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory holding one file per record.
    records_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Serializes writes.
    write_lock: Mutex<()>,
}

fn backend_error(message: String) -> HalldyllError {
    HalldyllError::State(StateError::backend("local", message))
}

impl LocalStateStore {
    /// Creates a new local state store in `.halldyll` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| HalldyllError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let records_dir = base_dir.join(RECORDS_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            records_dir,
            lock_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Base directory of the store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, key: &ResourceKey) -> PathBuf {
        self.records_dir.join(StateRecord::file_name(key))
    }

    async fn ensure_dir(path: &Path) -> Result<()> {
        if !path.exists() {
            debug!("Creating state directory: {}", path.display());
            fs::create_dir_all(path)
                .await
                .map_err(|e| backend_error(format!("Failed to create {}: {e}", path.display())))?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a synced temporary file.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        let mut temp = path.as_os_str().to_owned();
        temp.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| backend_error(format!("Failed to create temp file: {e}")))?;
        file.write_all(content)
            .await
            .map_err(|e| backend_error(format!("Failed to write temp file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| backend_error(format!("Failed to sync temp file: {e}")))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| backend_error(format!("Failed to rename {}: {e}", temp_path.display())))
    }

    async fn read_record(path: &Path, file_name: &str) -> Result<StateRecord> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StateError::corrupted(format!("Failed to read {}: {e}", path.display()))
        })?;

        let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display()))
        })?;

        record
            .check(file_name)
            .map_err(|reason| StateError::corrupted(format!("{}: {reason}", path.display())))?;

        Ok(record)
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!("Failed to read lock file: {e}")).into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse lock file: {e}"))
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file, failing if it already exists.
    async fn create_lock_file(&self, lock_info: &LockInfo) -> Result<bool> {
        Self::ensure_dir(&self.base_dir).await?;

        let content = serde_json::to_vec_pretty(lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to create lock file: {e}"),
                }
                .into());
            }
        };

        file.write_all(&content).await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to write lock file: {e}"),
        })?;
        file.sync_all().await.map_err(|e| StateError::LockFailed {
            message: format!("Failed to sync lock file: {e}"),
        })?;

        Ok(true)
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();

        let mut entries = match fs::read_dir(&self.records_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state at {}", self.records_dir.display());
                return Ok(snapshot);
            }
            Err(e) => return Err(backend_error(format!("Failed to list records: {e}"))),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| backend_error(format!("Failed to list records: {e}")))?
        {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(TEMP_SUFFIX) {
                warn!("Ignoring leftover temporary file {file_name}");
                continue;
            }
            if !file_name.ends_with(".json") {
                continue;
            }
            snapshot.insert(Self::read_record(&entry.path(), &file_name).await?);
        }

        info!(
            "Loaded {} state record(s) from {}",
            snapshot.len(),
            self.base_dir.display()
        );
        Ok(snapshot)
    }

    async fn commit(&self, record: &StateRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        Self::ensure_dir(&self.records_dir).await?;

        let content = serde_json::to_vec_pretty(record)
            .map_err(|e| StateError::serialization(format!("Failed to serialize record: {e}")))?;

        let path = self.record_path(&record.key());
        Self::write_atomic(&path, &content).await?;

        debug!("Committed state record {}", record.key());
        Ok(())
    }

    async fn remove(&self, key: &ResourceKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(key);

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed state record {key}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(backend_error(format!("Failed to remove {}: {e}", path.display()))),
        }
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let lock_info = LockInfo::new(holder, operation);

        if !self.create_lock_file(&lock_info).await? {
            match self.read_lock_file().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                _ => {
                    debug!("Expired lock found, taking over");
                    self.delete_lock_file().await?;
                    if !self.create_lock_file(&lock_info).await? {
                        return Err(StateError::LockFailed {
                            message: String::from("Lock was taken concurrently"),
                        }
                        .into());
                    }
                }
            }
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!("Force-removing state lock at {}", self.lock_path.display());
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }

    fn location(&self) -> String {
        self.base_dir.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attributes;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(kind: &str, name: &str) -> StateRecord {
        let mut attrs = Attributes::new();
        attrs.insert(String::from("id"), json!(format!("{name}-id")));
        StateRecord::new(&ResourceKey::new(kind, name), format!("{name}-id"), attrs)
            .with_declared(["location"])
    }

    #[tokio::test]
    async fn test_commit_and_load() {
        let (store, temp) = create_test_store();

        store.commit(&record("net", "main")).await.unwrap();
        store.commit(&record("vm", "web")).await.unwrap();

        assert!(temp.path().join("records").join("net.main.json").exists());

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        let net = snapshot.get(&ResourceKey::new("net", "main")).unwrap();
        assert_eq!(net.provider_id, "main-id");
        assert!(net.declared.contains("location"));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_replaces_and_remove_deletes() {
        let (store, _temp) = create_test_store();
        let first = record("net", "main");
        store.commit(&first).await.unwrap();

        let mut attrs = Attributes::new();
        attrs.insert(String::from("cidr"), json!("10.1.0.0/16"));
        store.commit(&first.updated(attrs)).await.unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.records().all(|r| r.attributes.contains_key("cidr")));

        store.remove(&first.key()).await.unwrap();
        store.remove(&first.key()).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_record_is_fatal() {
        let (store, temp) = create_test_store();
        let dir = temp.path().join("records");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("net.main.json"), "{ not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, HalldyllError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_misplaced_record_is_corrupted() {
        let (store, temp) = create_test_store();
        store.commit(&record("net", "main")).await.unwrap();
        let dir = temp.path().join("records");
        std::fs::rename(dir.join("net.main.json"), dir.join("net.other.json")).unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, HalldyllError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_ignored() {
        let (store, temp) = create_test_store();
        store.commit(&record("net", "main")).await.unwrap();
        std::fs::write(temp.path().join("records").join("vm.x.json.tmp"), "{").unwrap();

        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store.acquire_lock("test-holder", "apply").await.unwrap();
        assert!(store.is_locked().await.unwrap());
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().operation, "apply");

        store.release_lock("someone-else").await.unwrap();
        assert!(store.is_locked().await.unwrap());

        store.release_lock(&lock.lock_id).await.unwrap();
        assert!(!store.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store.acquire_lock("holder-1", "apply").await.unwrap();
        let err = store.acquire_lock("holder-2", "apply").await.unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::State(StateError::LockedByOther { ref holder, .. }) if holder == "holder-1"
        ));

        store.force_unlock().await.unwrap();
        store.acquire_lock("holder-2", "destroy").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, temp) = create_test_store();
        let mut stale = LockInfo::new("crashed", "apply");
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        std::fs::write(
            temp.path().join("state.lock"),
            serde_json::to_vec(&stale).unwrap(),
        )
        .unwrap();

        assert!(!store.is_locked().await.unwrap());
        let lock = store.acquire_lock("fresh", "apply").await.unwrap();
        assert_eq!(store.get_lock_info().await.unwrap().unwrap().lock_id, lock.lock_id);
    }
}

//! S3-based state storage backend.
//!
//! This module provides a remote state storage using AWS S3 (or compatible services)
//! for team use. Each record is its own object under `<prefix>records/`; an
//! object PUT is atomic, so readers never see a partial record.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::ProvideErrorMetadata;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ResourceKey;
use crate::error::{HalldyllError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo};
use super::store::{LOCK_FILE, RECORDS_DIR, StateStore};
use super::types::{StateRecord, StateSnapshot};

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
    /// Serializes writes.
    write_lock: Mutex<()>,
}

/// Precondition for writing the lock object.
enum LockCondition {
    /// No lock object exists.
    Absent,
    /// The expired lock with this ETag is still in place.
    Unchanged(String),
}

fn s3_error(message: String) -> HalldyllError {
    HalldyllError::State(StateError::backend("s3", message))
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            write_lock: Mutex::new(()),
        }
    }

    fn records_prefix(&self) -> String {
        format!("{}{RECORDS_DIR}/", self.prefix)
    }

    fn record_key(&self, key: &ResourceKey) -> String {
        format!("{}{}", self.records_prefix(), StateRecord::file_name(key))
    }

    fn lock_key(&self) -> String {
        format!("{}{LOCK_FILE}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_tagged(key).await?.map(|(content, _)| content))
    }

    /// Gets an object and its ETag.
    async fn get_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(String::from);
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| s3_error(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StateError::corrupted(format!("Invalid UTF-8 in s3://{}/{key}: {e}", self.bucket))
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(s3_error(format!("S3 get error: {service_err}")))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| s3_error(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Writes the lock object only if the condition still holds.
    ///
    /// Returns `false` when another writer got there first.
    async fn put_lock(&self, key: &str, content: Vec<u8>, condition: LockCondition) -> Result<bool> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json");
        let request = match condition {
            LockCondition::Absent => request.if_none_match("*"),
            LockCondition::Unchanged(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let status = err.raw_response().map(|r| r.status().as_u16());
                let code = err.as_service_error().and_then(ProvideErrorMetadata::code);
                if matches!(status, Some(409 | 412))
                    || matches!(code, Some("PreconditionFailed" | "ConditionalRequestConflict"))
                {
                    Ok(false)
                } else {
                    Err(s3_error(format!("S3 put error: {err}")))
                }
            }
        }
    }

    /// Error for a lock write that lost the race.
    async fn contended(&self) -> HalldyllError {
        match self.get_lock_info().await {
            Ok(Some(winner)) => StateError::LockedByOther {
                holder: winner.holder,
                since: winner.acquired_at.to_rfc3339(),
            }
            .into(),
            Ok(None) => StateError::LockFailed {
                message: String::from("state lock changed while acquiring it"),
            }
            .into(),
            Err(e) => e,
        }
    }

    /// Deletes an object from S3. Deleting a missing key succeeds.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| s3_error(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists every object key under a prefix.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| s3_error(format!("S3 list error: {e}")))?;

            keys.extend(response.contents().iter().filter_map(|o| o.key().map(String::from)));

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    fn parse_lock(&self, content: &str) -> Result<LockInfo> {
        serde_json::from_str(content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse lock in s3://{}: {e}", self.bucket)).into()
        })
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let prefix = self.records_prefix();
        debug!("Loading state from s3://{}/{prefix}", self.bucket);

        let mut snapshot = StateSnapshot::new();
        for key in self.list_keys(&prefix).await? {
            let Some(file_name) = key.strip_prefix(&prefix) else {
                continue;
            };
            if !file_name.ends_with(".json") || file_name.contains('/') {
                warn!("Ignoring unexpected object s3://{}/{key}", self.bucket);
                continue;
            }

            // Listed objects can vanish before they are read.
            let Some(content) = self.get_object(&key).await? else {
                continue;
            };

            let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
                StateError::corrupted(format!("Failed to parse s3://{}/{key}: {e}", self.bucket))
            })?;
            record.check(file_name).map_err(|reason| {
                StateError::corrupted(format!("s3://{}/{key}: {reason}", self.bucket))
            })?;
            snapshot.insert(record);
        }

        info!(
            "Loaded {} state record(s) from s3://{}/{}",
            snapshot.len(),
            self.bucket,
            self.prefix
        );
        Ok(snapshot)
    }

    async fn commit(&self, record: &StateRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = self.record_key(&record.key());

        let content = serde_json::to_vec_pretty(record).map_err(|e| {
            StateError::serialization(format!("Failed to serialize record: {e}"))
        })?;

        self.put_object(&key, content).await?;
        debug!("Committed s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn remove(&self, key: &ResourceKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let object_key = self.record_key(key);
        self.delete_object(&object_key).await?;
        debug!("Removed s3://{}/{object_key}", self.bucket);
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        let condition = match self.get_tagged(&key).await? {
            Some((content, etag)) => {
                let existing = self.parse_lock(&content)?;
                if !existing.is_expired() {
                    return Err(StateError::LockedByOther {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }
                    .into());
                }
                let etag = etag.ok_or_else(|| StateError::LockFailed {
                    message: String::from("expired lock has no ETag; use force-unlock"),
                })?;
                debug!("Expired lock found, taking over");
                LockCondition::Unchanged(etag)
            }
            None => LockCondition::Absent,
        };

        let lock_info = LockInfo::new(holder, operation);
        let content = serde_json::to_vec_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        if !self.put_lock(&key, content, condition).await? {
            return Err(self.contended().await);
        }

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = self.parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        let key = self.lock_key();
        warn!("Force-removing state lock s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        match self.get_object(&self.lock_key()).await? {
            Some(content) => self.parse_lock(&content).map(Some),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::{Credentials, Region, retry::RetryConfig};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NO_SUCH_KEY: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>";
    const PRECONDITION_FAILED: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
        <Error><Code>PreconditionFailed</Code><Message>At least one of the pre-conditions you specified did not hold</Message></Error>";

    /// Store talking to a local S3 stand-in.
    fn served_store(server: &MockServer) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("key", "secret", None, None, "static"))
            .endpoint_url(server.uri())
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .build();
        S3StateStore::with_client(Client::from_conf(config), "bucket", None)
    }

    fn lock_body(holder: &str, expired: bool) -> String {
        let mut lock = LockInfo::new(holder, "apply");
        if expired {
            lock.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        }
        serde_json::to_string(&lock).unwrap()
    }

    fn xml(status: u16, body: &str) -> ResponseTemplate {
        ResponseTemplate::new(status).set_body_raw(body.as_bytes().to_vec(), "application/xml")
    }

    #[tokio::test]
    async fn test_live_lock_blocks_acquire() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/state.lock"))
            .respond_with(ResponseTemplate::new(200).set_body_string(lock_body("ci-1", false)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = served_store(&server).acquire_lock("ci-2", "apply").await.unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::State(StateError::LockedByOther { ref holder, .. }) if holder == "ci-1"
        ));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_loses_conditional_write() {
        let server = MockServer::start().await;
        // Both runs saw no lock; the other run's write landed first.
        Mock::given(method("GET"))
            .and(path("/bucket/state.lock"))
            .respond_with(xml(404, NO_SUCH_KEY))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bucket/state.lock"))
            .respond_with(ResponseTemplate::new(200).set_body_string(lock_body("ci-1", false)))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bucket/state.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(xml(412, PRECONDITION_FAILED))
            .expect(1)
            .mount(&server)
            .await;

        let err = served_store(&server).acquire_lock("ci-2", "apply").await.unwrap_err();
        assert!(matches!(
            err,
            HalldyllError::State(StateError::LockedByOther { ref holder, .. }) if holder == "ci-1"
        ));
    }

    #[tokio::test]
    async fn test_free_lock_is_created_conditionally() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/state.lock"))
            .respond_with(xml(404, NO_SUCH_KEY))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bucket/state.lock"))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let lock = served_store(&server).acquire_lock("ci-1", "apply").await.unwrap();
        assert_eq!(lock.holder, "ci-1");
    }

    #[tokio::test]
    async fn test_expired_lock_takeover_requires_same_etag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bucket/state.lock"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"stale\"")
                    .set_body_string(lock_body("crashed", true)),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bucket/state.lock"))
            .and(header("if-match", "\"stale\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let lock = served_store(&server).acquire_lock("ci-1", "apply").await.unwrap();
        assert_eq!(lock.operation, "apply");
    }

    fn store(prefix: Option<&str>) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3StateStore::with_client(Client::from_conf(config), "bucket", prefix)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/team/prod/")), "team/prod/");
    }

    #[test]
    fn test_object_layout() {
        let store = store(Some("azure/prod"));
        assert_eq!(
            store.record_key(&ResourceKey::new("azurerm_subnet", "internal")),
            "azure/prod/records/azurerm_subnet.internal.json"
        );
        assert_eq!(store.lock_key(), "azure/prod/state.lock");
        assert_eq!(store.location(), "s3://bucket/azure/prod/");
        assert_eq!(store.backend_type(), "s3");
    }
}

//! File-backed sandbox provider.
//!
//! Objects are stored as `<root>/<kind>/<id>.json`. Useful for dry runs,
//! demos and tests; the returned attributes are the given ones plus a
//! generated `id`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::config::Attributes;
use crate::context::RunContext;
use crate::error::ProviderError;

use super::{Created, Provider};

/// Sandbox provider persisting objects on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Creates a provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the objects.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{id}.json"))
    }

    async fn read(&self, kind: &str, id: &str) -> Result<Attributes, ProviderError> {
        let path = self.object_path(kind, id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProviderError::NotFound {
                    kind: kind.to_string(),
                    provider_id: id.to_string(),
                });
            }
            Err(e) => return Err(io_error(&path, &e)),
        };
        serde_json::from_str(&content).map_err(|e| ProviderError::InvalidResponse {
            message: format!("{}: {e}", path.display()),
        })
    }

    async fn write(&self, kind: &str, id: &str, attributes: &Attributes) -> Result<(), ProviderError> {
        let path = self.object_path(kind, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, &e))?;
        }

        let content = serde_json::to_vec_pretty(attributes).map_err(|e| {
            ProviderError::InvalidResponse {
                message: format!("Failed to serialize object: {e}"),
            }
        })?;

        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error(&temp_path, &e))?;
        file.write_all(&content)
            .await
            .map_err(|e| io_error(&temp_path, &e))?;
        file.sync_all().await.map_err(|e| io_error(&temp_path, &e))?;
        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| io_error(&path, &e))?;
        Ok(())
    }
}

fn io_error(path: &Path, e: &std::io::Error) -> ProviderError {
    ProviderError::network(format!("{}: {e}", path.display()))
}

#[async_trait]
impl Provider for LocalProvider {
    async fn create(
        &self,
        _ctx: &RunContext,
        kind: &str,
        attributes: &Attributes,
    ) -> Result<Created, ProviderError> {
        let id = Uuid::new_v4().simple().to_string();
        let mut stored = attributes.clone();
        stored.insert(String::from("id"), serde_json::Value::String(id.clone()));

        self.write(kind, &id, &stored).await?;
        debug!("Sandbox created {kind}/{id}");

        Ok(Created {
            provider_id: id,
            attributes: stored,
        })
    }

    async fn update(
        &self,
        _ctx: &RunContext,
        kind: &str,
        provider_id: &str,
        changes: &Attributes,
    ) -> Result<Attributes, ProviderError> {
        let mut stored = self.read(kind, provider_id).await?;
        for (name, value) in changes {
            if name == "id" {
                continue;
            }
            if value.is_null() {
                stored.remove(name);
            } else {
                stored.insert(name.clone(), value.clone());
            }
        }

        self.write(kind, provider_id, &stored).await?;
        debug!("Sandbox updated {kind}/{provider_id}");
        Ok(stored)
    }

    async fn delete(
        &self,
        _ctx: &RunContext,
        kind: &str,
        provider_id: &str,
    ) -> Result<(), ProviderError> {
        let path = self.object_path(kind, provider_id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Sandbox deleted {kind}/{provider_id}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProviderError::NotFound {
                kind: kind.to_string(),
                provider_id: provider_id.to_string(),
            }),
            Err(e) => Err(io_error(&path, &e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ctx() -> RunContext {
        RunContext::new(Duration::from_secs(5)).0
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path());
        let ctx = ctx();

        let mut attrs = Attributes::new();
        attrs.insert(String::from("cidr"), json!("10.0.0.0/16"));
        attrs.insert(String::from("tags"), json!({"env": "dev"}));

        let created = provider.create(&ctx, "net", &attrs).await.unwrap();
        assert_eq!(created.attributes["id"], json!(created.provider_id));
        assert!(dir
            .path()
            .join("net")
            .join(format!("{}.json", created.provider_id))
            .exists());

        let mut changes = Attributes::new();
        changes.insert(String::from("cidr"), json!("10.1.0.0/16"));
        changes.insert(String::from("tags"), serde_json::Value::Null);
        let updated = provider
            .update(&ctx, "net", &created.provider_id, &changes)
            .await
            .unwrap();
        assert_eq!(updated["cidr"], json!("10.1.0.0/16"));
        assert!(!updated.contains_key("tags"));
        assert_eq!(updated["id"], json!(created.provider_id));

        provider.delete(&ctx, "net", &created.provider_id).await.unwrap();
        let again = provider.delete(&ctx, "net", &created.provider_id).await;
        assert!(matches!(again, Err(ProviderError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_update_missing_object() {
        let dir = TempDir::new().unwrap();
        let provider = LocalProvider::new(dir.path());
        let err = provider
            .update(&ctx(), "vm", "nope", &Attributes::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::NotFound {
                kind: String::from("vm"),
                provider_id: String::from("nope"),
            }
        );
    }
}

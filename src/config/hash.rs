//! Configuration hashing for change detection.
//!
//! Hashes are computed over the canonical JSON form of the declarations.
//! All maps involved are ordered, so equal declarations always hash equal.

use sha2::{Digest, Sha256};

use super::spec::InfraConfig;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the declared resources.
    ///
    /// Declaration order is significant, settings (parallelism, timeouts,
    /// state location) are not.
    #[must_use]
    pub fn hash_config(&self, config: &InfraConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.project.environment.as_bytes());

        for resource in &config.resources {
            hasher.update([0u8]);
            hasher.update(resource.kind.as_bytes());
            hasher.update([0u8]);
            hasher.update(resource.name.as_bytes());
            hasher.update(canonical(&resource.attributes).as_bytes());

            let mut deps: Vec<_> = resource.depends_on.iter().collect();
            deps.sort();
            deps.dedup();
            for dep in deps {
                hasher.update([1u8]);
                hasher.update(dep.as_bytes());
            }
        }

        hex::encode(hasher.finalize())
    }

    /// First 8 characters of a hash, for display.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

fn canonical<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

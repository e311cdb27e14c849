//! Object store adapter.
//!
//! A thin capability surface over the object-storage service: stat, copy,
//! delete, presigned GET and presigned POST policy. Single-object operations
//! only, no retries, no business logic.
//!
//! Backends:
//! - [`S3Store`]: any S3-compatible service (AWS, MinIO, ...)
//! - [`LocalStore`]: objects on local disk, credentials served by this process

pub mod error;
pub mod local;
pub mod post_policy;
pub mod s3;

pub use error::{StoreError, StoreResult};
pub use local::LocalStore;
pub use s3::S3Store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use crate::config::StorageConfig;

/// Inclusive content-length bounds for an upload credential.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeRange {
    pub min: u64,
    pub max: u64,
}

impl SizeRange {
    pub fn contains(&self, size: u64) -> bool {
        size >= self.min && size <= self.max
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<DateTime<Utc>>,
}

/// A browser-usable form upload: POST `url` with `fields` plus a `file` part.
#[derive(Clone, Debug, Serialize)]
pub struct PresignedPost {
    pub url: String,
    pub fields: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Existence plus metadata. A missing object is `Ok(None)`, never an error.
    async fn stat(&self, key: &str) -> StoreResult<Option<ObjectMeta>>;

    /// Server-side copy. Copying onto an existing key overwrites it.
    async fn copy(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Delete an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Time-limited download URL for `key`.
    async fn presign_get(&self, key: &str, ttl: Duration) -> StoreResult<String>;

    /// Time-limited, size-bounded upload form that can only write `key`.
    async fn presign_post_policy(
        &self,
        key: &str,
        ttl: Duration,
        size: SizeRange,
    ) -> StoreResult<PresignedPost>;

    /// Bucket every key of this store lives in.
    fn bucket(&self) -> &str;

    /// Static backend identifier for logs ("s3", "local", ...).
    fn backend_name(&self) -> &'static str;

    /// Lightweight connectivity check used by the readiness probe.
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Run one adapter call under `limit`.
///
/// An elapsed timer becomes [`StoreError::Timeout`], so a slow store can never
/// be mistaken for a missing object.
pub async fn with_timeout<T, F>(limit: Duration, op: &'static str, key: &str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            op,
            key: key.to_string(),
            limit_ms: limit.as_millis() as u64,
        }),
    }
}

/// Backends built from configuration.
///
/// The local backend is also returned concretely because its upload and
/// download endpoints are served by this process.
pub struct StoreHandles {
    pub store: Arc<dyn ObjectStore>,
    pub local: Option<Arc<LocalStore>>,
}

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StoreResult<StoreHandles> {
    match config {
        StorageConfig::Local {
            dir,
            bucket,
            public_url,
            signing_secret,
        } => {
            let local = Arc::new(
                LocalStore::new(dir, bucket, public_url, signing_secret).await?,
            );
            Ok(StoreHandles {
                store: local.clone(),
                local: Some(local),
            })
        }
        StorageConfig::S3(s3) => {
            let backend = S3Store::new(s3).await?;
            Ok(StoreHandles {
                store: Arc::new(backend),
                local: None,
            })
        }
    }
}

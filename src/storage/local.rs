//! Local filesystem backend.
//!
//! Objects live sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`.
//! Because there is no external service to hand browsers to, this process
//! also serves the presigned endpoints: form uploads are checked with the same
//! POST policy rules S3 applies, downloads with an HMAC over key and expiry.

use crate::storage::post_policy::{self, PolicyError, PostPolicy, SigningCredentials, VerifiedPolicy};
use crate::storage::{ObjectMeta, ObjectStore, PresignedPost, SizeRange, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::Sha256;
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, instrument};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const LOCAL_ACCESS_KEY_ID: &str = "local";
const LOCAL_REGION: &str = "local";

/// Path characters left unescaped in presigned URLs.
const URL_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub struct LocalStore {
    base_path: PathBuf,
    bucket: String,
    /// Base URL browsers use to reach this process.
    public_url: String,
    credentials: SigningCredentials,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("base_path", &self.base_path)
            .field("bucket", &self.bucket)
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Create the store, making sure the bucket directory exists.
    pub async fn new(
        base_path: impl Into<PathBuf>,
        bucket: &str,
        public_url: &str,
        signing_secret: &str,
    ) -> StoreResult<Self> {
        if bucket.is_empty()
            || !bucket
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return Err(StoreError::Config(format!("invalid bucket name `{bucket}`")));
        }
        if signing_secret.is_empty() {
            return Err(StoreError::Config("local signing secret is empty".into()));
        }

        let store = Self {
            base_path: base_path.into(),
            bucket: bucket.to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            credentials: SigningCredentials {
                access_key_id: LOCAL_ACCESS_KEY_ID.to_string(),
                secret_access_key: signing_secret.to_string(),
                session_token: None,
                region: LOCAL_REGION.to_string(),
            },
        };
        fs::create_dir_all(store.bucket_root()).await?;
        Ok(store)
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key).
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        let mut path = self.bucket_root();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    /// Create parent directories of `path` and return a fresh temp path next to it.
    async fn prepare_tmp(path: &Path) -> StoreResult<PathBuf> {
        let parent = path.parent().ok_or_else(|| {
            StoreError::Io(io::Error::other("object path missing parent directory"))
        })?;
        fs::create_dir_all(parent).await?;
        Ok(parent.join(format!(".tmp-{}", Uuid::new_v4())))
    }

    /// Durably move a fully written temp file into place.
    async fn commit_tmp(mut file: File, tmp_path: &Path, path: &Path) -> StoreResult<()> {
        let result = async {
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(tmp_path, path).await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    /// Stream an upload to disk, enforcing `size` before it becomes visible.
    ///
    /// Returns the number of bytes written.
    #[instrument(skip(self, stream), fields(backend = "local"))]
    pub async fn write_stream<S>(&self, key: &str, stream: S, size: SizeRange) -> StoreResult<u64>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        ensure_key_safe(key)?;
        let path = self.object_path(key);
        let tmp_path = Self::prepare_tmp(&path).await?;
        let mut file = File::create(&tmp_path).await?;

        let mut written: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Io(err));
                }
            };
            written += chunk.len() as u64;
            if written > size.max {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::SizeOutOfRange {
                    size: written,
                    min: size.min,
                    max: size.max,
                });
            }
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if !size.contains(written) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::SizeOutOfRange {
                size: written,
                min: size.min,
                max: size.max,
            });
        }

        Self::commit_tmp(file, &tmp_path, &path).await?;
        debug!(key, written, "stored object");
        Ok(written)
    }

    /// Open an object for streaming out, with its size.
    pub async fn open(&self, key: &str) -> StoreResult<(File, u64)> {
        ensure_key_safe(key)?;
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(err)
            }
        })?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    fn get_mac(&self, key: &str, expires: i64) -> StoreResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.credentials.secret_access_key.as_bytes())
            .map_err(|e| StoreError::Signing(e.to_string()))?;
        mac.update(format!("GET\n{}/{}\n{}", self.bucket, key, expires).as_bytes());
        Ok(mac)
    }

    /// Check a presigned download produced by [`ObjectStore::presign_get`].
    pub fn verify_get(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), PolicyError> {
        let signature = hex::decode(signature).map_err(|_| PolicyError::SignatureMismatch)?;
        self.get_mac(key, expires)
            .map_err(|e| PolicyError::Malformed(e.to_string()))?
            .verify_slice(&signature)
            .map_err(|_| PolicyError::SignatureMismatch)?;

        let expires_at = DateTime::<Utc>::from_timestamp(expires, 0)
            .ok_or_else(|| PolicyError::Malformed("expires".into()))?;
        if expires_at <= now {
            return Err(PolicyError::Expired(expires_at));
        }
        Ok(())
    }

    /// Check a submitted upload form against its signed policy and this bucket.
    pub fn verify_post(
        &self,
        fields: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<VerifiedPolicy, PolicyError> {
        let verified = post_policy::verify(fields, &self.credentials, now)?;
        if verified.bucket != self.bucket {
            return Err(PolicyError::ConditionFailed("bucket".into()));
        }
        Ok(verified)
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.bucket_root();
        let mut current = start.to_path_buf();
        while current.starts_with(&stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Reject keys that could escape the bucket directory.
fn ensure_key_safe(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.len() > MAX_OBJECT_KEY_LEN
        || key.starts_with('/')
        || key.contains("..")
        || key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalStore {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn stat(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        ensure_key_safe(key)?;
        match fs::metadata(self.object_path(key)).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        ensure_key_safe(from)?;
        ensure_key_safe(to)?;
        let mut source = File::open(self.object_path(from))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StoreError::NotFound(from.to_string())
                } else {
                    StoreError::Io(err)
                }
            })?;

        let path = self.object_path(to);
        let tmp_path = Self::prepare_tmp(&path).await?;
        let mut file = File::create(&tmp_path).await?;
        if let Err(err) = tokio::io::copy(&mut source, &mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Self::commit_tmp(file, &tmp_path, &path).await
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        ensure_key_safe(key)?;
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> StoreResult<String> {
        ensure_key_safe(key)?;
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Signing(e.to_string()))?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = hex::encode(self.get_mac(key, expires)?.finalize().into_bytes());
        Ok(format!(
            "{}/storage/{}/{}?expires={}&signature={}",
            self.public_url,
            self.bucket,
            utf8_percent_encode(key, URL_PATH),
            expires,
            signature
        ))
    }

    async fn presign_post_policy(
        &self,
        key: &str,
        ttl: Duration,
        size: SizeRange,
    ) -> StoreResult<PresignedPost> {
        ensure_key_safe(key)?;
        let now = Utc::now();
        let expires_at =
            now + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Signing(e.to_string()))?;
        let policy = PostPolicy {
            bucket: self.bucket.clone(),
            key: key.to_string(),
            expires_at,
            content_length: size,
        };
        Ok(PresignedPost {
            url: format!("{}/storage/{}", self.public_url, self.bucket),
            fields: policy.sign(&self.credentials, now)?,
            expires_at,
        })
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn health_check(&self) -> StoreResult<()> {
        let meta = fs::metadata(self.bucket_root()).await?;
        if !meta.is_dir() {
            return Err(StoreError::Io(io::Error::other("bucket root is not a directory")));
        }
        Ok(())
    }
}

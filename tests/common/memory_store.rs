//! In-memory object store with failure and latency injection.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use scheduler_avatars::storage::{
    ObjectMeta, ObjectStore, PresignedPost, SizeRange, StoreError, StoreResult,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Adapter operations that can be made to fail or stall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Stat,
    Copy,
    Delete,
    PresignGet,
    PresignPost,
}

/// Wildcard key for [`MemoryStore::fail`].
#[allow(dead_code)]
pub const ANY_KEY: &str = "*";

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct IssuedPost {
    pub key: String,
    pub ttl: Duration,
    pub size: SizeRange,
}

#[allow(dead_code)]
pub struct MemoryStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Bytes>>,
    failures: Mutex<HashSet<(Op, String)>>,
    delays: Mutex<HashMap<Op, Duration>>,
    posts: Mutex<Vec<IssuedPost>>,
    copies: AtomicUsize,
}

#[allow(dead_code)]
impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            posts: Mutex::new(Vec::new()),
            copies: AtomicUsize::new(0),
        }
    }

    /// Store an object directly, as a client upload would.
    pub fn put(&self, key: &str, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.into());
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Make `op` fail for `key` (the destination for copies, or [`ANY_KEY`]).
    pub fn fail(&self, op: Op, key: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert((op, key.to_string()));
    }

    /// Remove every injected failure.
    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Stall `op` for `delay` before it runs.
    pub fn delay(&self, op: Op, delay: Duration) {
        self.delays.lock().unwrap().insert(op, delay);
    }

    /// Number of copies that actually ran.
    pub fn copy_count(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn issued_posts(&self) -> Vec<IssuedPost> {
        self.posts.lock().unwrap().clone()
    }

    async fn enter(&self, op: Op, key: &str) -> StoreResult<()> {
        let delay = self.delays.lock().unwrap().get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failures = self.failures.lock().unwrap();
        if failures.contains(&(op, key.to_string())) || failures.contains(&(op, ANY_KEY.to_string()))
        {
            return Err(StoreError::S3(Box::new(io::Error::other(format!(
                "injected {op:?} failure for {key}"
            )))));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn stat(&self, key: &str) -> StoreResult<Option<ObjectMeta>> {
        self.enter(Op::Stat, key).await?;
        Ok(self.get(key).map(|data| ObjectMeta {
            size: data.len() as u64,
            last_modified: None,
        }))
    }

    async fn copy(&self, from: &str, to: &str) -> StoreResult<()> {
        self.enter(Op::Copy, to).await?;
        let data = self
            .get(from)
            .ok_or_else(|| StoreError::NotFound(from.to_string()))?;
        self.put(to, data);
        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.enter(Op::Delete, key).await?;
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> StoreResult<String> {
        self.enter(Op::PresignGet, key).await?;
        Ok(format!(
            "memory://{}/{}?ttl={}",
            self.bucket,
            key,
            ttl.as_secs()
        ))
    }

    async fn presign_post_policy(
        &self,
        key: &str,
        ttl: Duration,
        size: SizeRange,
    ) -> StoreResult<PresignedPost> {
        self.enter(Op::PresignPost, key).await?;
        self.posts.lock().unwrap().push(IssuedPost {
            key: key.to_string(),
            ttl,
            size,
        });
        let mut fields = BTreeMap::new();
        fields.insert("key".to_string(), key.to_string());
        Ok(PresignedPost {
            url: format!("memory://{}", self.bucket),
            fields,
            expires_at: Utc::now() + chrono::Duration::from_std(ttl).unwrap(),
        })
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

//! Common test utilities and fixtures.

pub mod fixtures;
pub mod memory_store;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use memory_store::{MemoryStore, Op};

use scheduler_avatars::db;
use scheduler_avatars::services::avatar_service::{AvatarService, AvatarSettings};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// In-memory SQLite with migrations applied.
///
/// A single connection that never idles out, so every query sees the same
/// in-memory database.
pub async fn memory_pool(foreign_keys: bool) -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(foreign_keys);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

/// Settings with a short storage timeout so timeout tests stay fast.
#[allow(dead_code)]
pub fn test_settings() -> AvatarSettings {
    AvatarSettings {
        storage_timeout: Duration::from_millis(200),
        ..AvatarSettings::default()
    }
}

/// Service wired to an in-memory ledger and object store.
#[allow(dead_code)]
pub struct TestContext {
    pub db: Arc<SqlitePool>,
    pub store: Arc<MemoryStore>,
    pub service: AvatarService,
}

#[allow(dead_code)]
impl TestContext {
    pub async fn new() -> Self {
        Self::with_pool(memory_pool(true).await).await
    }

    /// Foreign keys off, so ledger rows may reference users that do not exist.
    pub async fn without_foreign_keys() -> Self {
        Self::with_pool(memory_pool(false).await).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Self {
        let db = Arc::new(pool);
        let store = Arc::new(MemoryStore::new("avatars"));
        let service = AvatarService::new(db.clone(), store.clone(), test_settings());
        Self { db, store, service }
    }
}

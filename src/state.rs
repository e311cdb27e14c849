use crate::services::avatar_service::AvatarService;
use crate::storage::LocalStore;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub avatars: AvatarService,
    /// Present only with the local backend, whose presigned endpoints this
    /// process serves.
    pub local: Option<Arc<LocalStore>>,
}

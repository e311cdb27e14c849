//! Fixtures for users, intents and staged uploads.

use chrono::{DateTime, Utc};
use scheduler_avatars::db::{pending_uploads, users};
use scheduler_avatars::models::{NewUser, PendingUpload, UploadKind, User, staging_key};
use sqlx::SqlitePool;
use uuid::Uuid;

/// A few bytes that start like a WebP file.
#[allow(dead_code)]
pub const WEBP_BYTES: &[u8] = b"RIFF\x1a\x00\x00\x00WEBPVP8 avatar-bytes";

#[allow(dead_code)]
pub async fn create_user(pool: &SqlitePool, email: &str) -> User {
    users::insert(
        pool,
        &NewUser {
            email: email.to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
        },
    )
    .await
    .unwrap()
}

#[allow(dead_code)]
pub async fn reload_user(pool: &SqlitePool, user_id: Uuid) -> User {
    users::find_by_id(pool, user_id).await.unwrap().unwrap()
}

#[allow(dead_code)]
pub async fn pending_for(pool: &SqlitePool, user_id: Uuid) -> Vec<PendingUpload> {
    pending_uploads::list_for_user(pool, user_id, UploadKind::Avatar)
        .await
        .unwrap()
}

/// Write a ledger row directly, bypassing credential issuance.
#[allow(dead_code)]
pub async fn insert_intent(
    pool: &SqlitePool,
    user_id: Uuid,
    object_key: &str,
    expires_at: DateTime<Utc>,
) {
    insert_intent_at(pool, user_id, object_key, Utc::now(), expires_at).await;
}

/// Like [`insert_intent`] with an explicit creation time.
#[allow(dead_code)]
pub async fn insert_intent_at(
    pool: &SqlitePool,
    user_id: Uuid,
    object_key: &str,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) {
    pending_uploads::insert(
        pool,
        &PendingUpload {
            object_key: object_key.to_string(),
            user_id,
            kind: UploadKind::Avatar,
            expires_at,
            created_at,
        },
    )
    .await
    .unwrap();
}

#[allow(dead_code)]
pub fn staged(object_key: &str) -> String {
    staging_key(object_key)
}

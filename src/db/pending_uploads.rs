//! Pending-upload ledger access. Only the avatar service calls into this.

use crate::models::{PendingUpload, UploadKind};
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

const PENDING_COLUMNS: &str = "object_key, user_id, kind, expires_at, created_at";

pub async fn insert<'e, E>(executor: E, pending: &PendingUpload) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO pending_uploads (object_key, user_id, kind, expires_at, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&pending.object_key)
    .bind(pending.user_id)
    .bind(pending.kind)
    .bind(pending.expires_at)
    .bind(pending.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

/// All rows for (user, kind), newest first.
pub async fn list_for_user<'e, E>(
    executor: E,
    user_id: Uuid,
    kind: UploadKind,
) -> Result<Vec<PendingUpload>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, PendingUpload>(&format!(
        "SELECT {PENDING_COLUMNS} FROM pending_uploads
         WHERE user_id = ? AND kind = ?
         ORDER BY created_at DESC, rowid DESC"
    ))
    .bind(user_id)
    .bind(kind)
    .fetch_all(executor)
    .await
}

/// First unexpired intent for (user, kind), optionally pinned to one key.
///
/// Two racing credential requests can briefly leave two rows behind; the
/// newest one wins and the other is left for the sweep.
pub async fn find_active<'e, E>(
    executor: E,
    user_id: Uuid,
    kind: UploadKind,
    object_key: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<PendingUpload>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = list_for_user(executor, user_id, kind).await?;
    Ok(rows
        .into_iter()
        .filter(|row| object_key.is_none_or(|key| row.object_key == key))
        .find(|row| !row.is_expired(now)))
}

/// Drop every intent of `kind` for the user. Zero rows is not an error.
pub async fn delete_for_user<'e, E>(
    executor: E,
    user_id: Uuid,
    kind: UploadKind,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("DELETE FROM pending_uploads WHERE user_id = ? AND kind = ?")
        .bind(user_id)
        .bind(kind)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Consume one specific intent. Zero rows means someone else consumed it.
pub async fn delete_intent<'e, E>(
    executor: E,
    user_id: Uuid,
    object_key: &str,
    kind: UploadKind,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        "DELETE FROM pending_uploads WHERE user_id = ? AND object_key = ? AND kind = ?",
    )
    .bind(user_id)
    .bind(object_key)
    .bind(kind)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

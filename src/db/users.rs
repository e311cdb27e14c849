//! User record store. The avatar pointer is only written by the coordinator.

use crate::models::{NewUser, User};
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};
use uuid::Uuid;

const USER_COLUMNS: &str =
    "id, email, first_name, last_name, avatar_key, created_at, updated_at";

pub async fn insert<'e, E>(executor: E, new_user: &NewUser) -> Result<User, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let now = Utc::now();
    sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (id, email, first_name, last_name, avatar_key, created_at, updated_at)
         VALUES (?, ?, ?, ?, NULL, ?, ?)
         RETURNING {USER_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(&new_user.email)
    .bind(&new_user.first_name)
    .bind(&new_user.last_name)
    .bind(now)
    .bind(now)
    .fetch_one(executor)
    .await
}

pub async fn find_by_id<'e, E>(executor: E, user_id: Uuid) -> Result<Option<User>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

/// Re-read a user while taking the write lock.
///
/// Bumps `updated_at` and returns the row as it is after that bump, which
/// leaves every other column (notably `avatar_key`) at its prior value. Used as
/// the first statement of the pointer-swap transaction so SQLite upgrades to a
/// writer before anything is read.
pub async fn lock_for_update<'e, E>(
    executor: E,
    user_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<User>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET updated_at = ? WHERE id = ? RETURNING {USER_COLUMNS}"
    ))
    .bind(now)
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

/// Point the user at a new committed avatar key. Returns rows affected.
pub async fn set_avatar_key<'e, E>(
    executor: E,
    user_id: Uuid,
    avatar_key: Option<&str>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query("UPDATE users SET avatar_key = ?, updated_at = ? WHERE id = ?")
        .bind(avatar_key)
        .bind(now)
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

//! Represents an outstanding upload intent recorded in the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Key prefix of the staging namespace clients upload into.
pub const PENDING_PREFIX: &str = "pending/";

/// Staging location for a committed object key.
pub fn staging_key(object_key: &str) -> String {
    format!("{PENDING_PREFIX}{object_key}")
}

/// What an upload intent is for. Only avatars exist today.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UploadKind {
    Avatar,
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadKind::Avatar => f.write_str("avatar"),
        }
    }
}

/// A ledger row: "user `user_id` expects an object to land at `object_key`".
///
/// The row is keyed by `object_key`; the service keeps at most one row per
/// (`user_id`, `kind`) by deleting before inserting.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct PendingUpload {
    /// Destination key once committed. The client writes to
    /// [`PendingUpload::staging_key`] instead.
    pub object_key: String,

    /// Owner of the intent.
    pub user_id: Uuid,

    pub kind: UploadKind,

    /// After this instant the intent counts as abandoned.
    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

impl PendingUpload {
    pub fn staging_key(&self) -> String {
        staging_key(&self.object_key)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

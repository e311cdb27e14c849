//! Represents a registered user and its public projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user row as stored in the relational store.
///
/// Only `avatar_key` matters to the upload protocol; the remaining columns are
/// what the public projection exposes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct User {
    /// Opaque unique identifier.
    pub id: Uuid,

    /// Login email, unique across users.
    pub email: String,

    pub first_name: String,

    pub last_name: String,

    /// Key of the current, committed avatar object. `None` means no avatar.
    ///
    /// When set, the object is expected to exist under this exact key in the
    /// committed (non-pending) namespace.
    pub avatar_key: Option<String>,

    /// When this user was registered.
    pub created_at: DateTime<Utc>,

    /// Last time the row was written.
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a user.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

/// What clients are allowed to see about a user.
///
/// The avatar is exposed as a short-lived presigned URL, never as the raw key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicUser {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub avatar_url: Option<String>,
}

impl PublicUser {
    pub fn from_user(user: &User, avatar_url: Option<String>) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            avatar_url,
        }
    }
}

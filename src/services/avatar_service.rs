//! src/services/avatar_service.rs
//!
//! AvatarService issues direct-to-storage upload credentials and reconciles
//! finished uploads with the user record. The relational commit is the source
//! of truth; object moves after it are repeatable best-effort steps.

use crate::db::{pending_uploads, users};
use crate::models::{PendingUpload, PublicUser, UploadKind, User, staging_key};
use crate::services::promotion;
use crate::storage::{ObjectStore, SizeRange, StoreError, StoreResult, with_timeout};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

/// Namespace committed avatars live in.
pub const AVATAR_KEY_PREFIX: &str = "avatars/";

/// Clients convert to WebP before uploading.
pub const AVATAR_EXTENSION: &str = "webp";

/// Tunables for credential issuance and reconciliation.
#[derive(Clone, Debug)]
pub struct AvatarSettings {
    /// How long the client may write bytes with an issued credential.
    pub credential_ttl: Duration,
    /// How long an unreconciled intent stays valid in the ledger.
    pub pending_ttl: Duration,
    /// Lifetime of presigned avatar download URLs.
    pub avatar_url_ttl: Duration,
    /// Upper content-length bound in bytes.
    pub max_avatar_bytes: u64,
    /// Bound for each individual object store call.
    pub storage_timeout: Duration,
}

impl Default for AvatarSettings {
    fn default() -> Self {
        Self {
            credential_ttl: Duration::from_secs(180),
            pending_ttl: Duration::from_secs(24 * 60 * 60),
            avatar_url_ttl: Duration::from_secs(24 * 60 * 60),
            max_avatar_bytes: 2 * 1024 * 1024,
            storage_timeout: Duration::from_millis(2000),
        }
    }
}

/// What a client needs to upload an avatar straight to storage.
#[derive(Clone, Debug, Serialize)]
pub struct UploadCredential {
    /// Destination key; echo it back on commit.
    pub object_key: String,
    pub upload_url: String,
    pub form_fields: BTreeMap<String, String>,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful commit or resume.
#[derive(Clone, Debug, Serialize)]
pub struct CommitOutcome {
    pub avatar_url: String,
    pub user: PublicUser,
}

#[derive(Debug, Error)]
pub enum AvatarError {
    #[error("no pending avatar upload")]
    NoPendingUpload,

    #[error("staged object `{key}` not found")]
    StagedObjectNotFound { key: String },

    #[error("user `{0}` not found")]
    UserNotFound(Uuid),

    /// The intent was consumed by another reconciliation.
    #[error("pending upload `{key}` was already reconciled")]
    PendingUploadNotFound { key: String },

    #[error("object store unavailable while checking `{key}`: {source}")]
    StorageUnavailable {
        key: String,
        #[source]
        source: StoreError,
    },

    /// The pointer swap committed but the object was not moved into place.
    #[error("avatar `{key}` committed but not promoted: {source}")]
    StoragePromotionFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Partial success: the avatar is live, some objects were left behind.
    #[error("avatar committed; {} object(s) left behind", failed_keys.len())]
    StorageCleanupFailed {
        outcome: Box<CommitOutcome>,
        failed_keys: Vec<String>,
    },

    /// The avatar is live but no download URL could be signed for it.
    #[error("avatar `{key}` committed; download url unavailable: {source}")]
    AvatarUrlUnavailable {
        key: String,
        user: Box<PublicUser>,
        failed_keys: Vec<String>,
        #[source]
        source: StoreError,
    },

    #[error("user has no committed avatar")]
    NoCommittedAvatar,

    #[error("post-commit task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type AvatarResult<T> = Result<T, AvatarError>;

#[derive(Clone)]
pub struct AvatarService {
    /// Shared SQLite connection pool for users and the ledger.
    pub db: Arc<SqlitePool>,

    /// Process-wide object store client.
    pub store: Arc<dyn ObjectStore>,

    pub settings: AvatarSettings,
}

impl AvatarService {
    pub fn new(db: Arc<SqlitePool>, store: Arc<dyn ObjectStore>, settings: AvatarSettings) -> Self {
        Self { db, store, settings }
    }

    async fn timed<T, F>(&self, op: &'static str, key: &str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.settings.storage_timeout, op, key, fut).await
    }

    /// Replace any outstanding avatar intent with a fresh, signed one.
    ///
    /// The credential is signed before the ledger is touched, so a signing
    /// failure leaves the previous intent in place. Delete and insert share a
    /// transaction.
    #[instrument(skip(self))]
    pub async fn issue_upload_credential(&self, user_id: Uuid) -> AvatarResult<UploadCredential> {
        let object_key = new_avatar_key();
        let staged = staging_key(&object_key);

        let size = SizeRange {
            min: 1,
            max: self.settings.max_avatar_bytes,
        };
        let post = self
            .timed(
                "presign_post_policy",
                &staged,
                self.store
                    .presign_post_policy(&staged, self.settings.credential_ttl, size),
            )
            .await?;

        let now = Utc::now();
        let pending = PendingUpload {
            object_key: object_key.clone(),
            user_id,
            kind: UploadKind::Avatar,
            expires_at: expiry(now, self.settings.pending_ttl),
            created_at: now,
        };

        let mut tx = self.db.begin().await?;
        let superseded =
            pending_uploads::delete_for_user(&mut *tx, user_id, UploadKind::Avatar).await?;
        if users::find_by_id(&mut *tx, user_id).await?.is_none() {
            tx.rollback().await?;
            return Err(AvatarError::UserNotFound(user_id));
        }
        pending_uploads::insert(&mut *tx, &pending).await?;
        tx.commit().await?;

        info!(object_key = %object_key, superseded, "issued avatar upload credential");
        Ok(UploadCredential {
            object_key,
            upload_url: post.url,
            form_fields: post.fields,
            expires_at: post.expires_at,
        })
    }

    /// Attach the uploaded avatar to the user.
    ///
    /// `object_key`, when given, pins the lookup to the key issued with the
    /// credential. Without it the newest unexpired intent is used.
    #[instrument(skip(self))]
    pub async fn commit_avatar_upload(
        &self,
        user_id: Uuid,
        object_key: Option<&str>,
    ) -> AvatarResult<CommitOutcome> {
        let now = Utc::now();
        let Some(pending) =
            pending_uploads::find_active(&*self.db, user_id, UploadKind::Avatar, object_key, now)
                .await?
        else {
            return Err(self.missing_intent(user_id, object_key).await?);
        };

        let staged = pending.staging_key();
        match self.timed("stat", &staged, self.store.stat(&staged)).await {
            Ok(Some(meta)) => debug!(key = %staged, size = meta.size, "staged object present"),
            Ok(None) => {
                debug!(key = %staged, "commit without staged object");
                return Err(AvatarError::StagedObjectNotFound { key: staged });
            }
            Err(source) => {
                error!(key = %staged, error = %source, "stat of staged object failed");
                return Err(AvatarError::StorageUnavailable { key: staged, source });
            }
        }

        let (user, replaced) = self.swap_pointer(user_id, &pending.object_key).await?;
        info!(
            object_key = %pending.object_key,
            replaced = replaced.as_deref().unwrap_or("-"),
            "avatar pointer committed"
        );

        // Detached so a dropped request cannot stop the moves half way.
        let finish = tokio::spawn(promotion::finish(
            self.store.clone(),
            self.settings.storage_timeout,
            pending.object_key.clone(),
            replaced,
        ));
        let failed_keys = match finish.await? {
            Ok(failed) => failed,
            Err(source) => {
                error!(object_key = %pending.object_key, error = %source, "avatar promotion failed");
                return Err(AvatarError::StoragePromotionFailed {
                    key: pending.object_key,
                    source,
                });
            }
        };

        self.outcome(&user, &pending.object_key, failed_keys).await
    }

    /// Finish the object moves for the user's committed avatar.
    ///
    /// Needs no ledger row, so it completes a commit that reported
    /// `StoragePromotionFailed` and is safe to call any number of times.
    #[instrument(skip(self))]
    pub async fn resume_avatar_promotion(&self, user_id: Uuid) -> AvatarResult<CommitOutcome> {
        let user = users::find_by_id(&*self.db, user_id)
            .await?
            .ok_or(AvatarError::UserNotFound(user_id))?;
        let object_key = user.avatar_key.clone().ok_or(AvatarError::NoCommittedAvatar)?;

        let finish = tokio::spawn(promotion::finish(
            self.store.clone(),
            self.settings.storage_timeout,
            object_key.clone(),
            None,
        ));
        let failed_keys = match finish.await? {
            Ok(failed) => failed,
            Err(source) if source.is_not_found() => {
                return Err(AvatarError::StagedObjectNotFound {
                    key: staging_key(&object_key),
                });
            }
            Err(source) => {
                error!(object_key = %object_key, error = %source, "avatar promotion resume failed");
                return Err(AvatarError::StoragePromotionFailed {
                    key: object_key,
                    source,
                });
            }
        };

        self.outcome(&user, &object_key, failed_keys).await
    }

    /// Public projection with a fresh download URL for the avatar.
    #[instrument(skip(self))]
    pub async fn get_public_user(&self, user_id: Uuid) -> AvatarResult<PublicUser> {
        let user = users::find_by_id(&*self.db, user_id)
            .await?
            .ok_or(AvatarError::UserNotFound(user_id))?;
        let avatar_url = match &user.avatar_key {
            Some(key) => Some(self.avatar_url(key).await?),
            None => None,
        };
        Ok(PublicUser::from_user(&user, avatar_url))
    }

    /// Pointer swap plus intent consumption, all or nothing.
    ///
    /// Returns the user as committed and the avatar key it replaced. The user
    /// row is written first so SQLite takes the write lock before any read.
    async fn swap_pointer(
        &self,
        user_id: Uuid,
        object_key: &str,
    ) -> AvatarResult<(User, Option<String>)> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let Some(mut user) = users::lock_for_update(&mut *tx, user_id, now).await? else {
            tx.rollback().await?;
            return Err(AvatarError::UserNotFound(user_id));
        };
        users::set_avatar_key(&mut *tx, user_id, Some(object_key), now).await?;
        let consumed =
            pending_uploads::delete_intent(&mut *tx, user_id, object_key, UploadKind::Avatar)
                .await?;
        if consumed == 0 {
            tx.rollback().await?;
            debug!(object_key, "intent consumed by a concurrent commit");
            return Err(AvatarError::PendingUploadNotFound {
                key: object_key.to_string(),
            });
        }
        tx.commit().await?;

        let replaced = user.avatar_key.replace(object_key.to_string());
        Ok((user, replaced))
    }

    /// Classify a commit that found no live intent.
    ///
    /// Only an echoed key that is already the committed pointer counts as a
    /// consumed intent. Without a key nothing ties the request to the current
    /// avatar, so it is `NoPendingUpload`.
    async fn missing_intent(&self, user_id: Uuid, object_key: Option<&str>) -> AvatarResult<AvatarError> {
        let Some(requested) = object_key else {
            debug!("commit without live intent or key");
            return Ok(AvatarError::NoPendingUpload);
        };
        let committed = users::find_by_id(&*self.db, user_id)
            .await?
            .and_then(|user| user.avatar_key);
        let err = match committed {
            Some(current) if current == requested => {
                AvatarError::PendingUploadNotFound { key: current }
            }
            _ => AvatarError::NoPendingUpload,
        };
        debug!(error = %err, "commit without live intent");
        Ok(err)
    }

    async fn avatar_url(&self, key: &str) -> AvatarResult<String> {
        let url = self
            .timed(
                "presign_get",
                key,
                self.store.presign_get(key, self.settings.avatar_url_ttl),
            )
            .await?;
        Ok(url)
    }

    /// Result of a committed avatar. Every error from here on is post-commit.
    async fn outcome(
        &self,
        user: &User,
        object_key: &str,
        failed_keys: Vec<String>,
    ) -> AvatarResult<CommitOutcome> {
        let avatar_url = match self.avatar_url(object_key).await {
            Ok(url) => url,
            Err(AvatarError::Storage(source)) => {
                error!(object_key, error = %source, "presign of committed avatar failed");
                return Err(AvatarError::AvatarUrlUnavailable {
                    key: object_key.to_string(),
                    user: Box::new(PublicUser::from_user(user, None)),
                    failed_keys,
                    source,
                });
            }
            Err(err) => return Err(err),
        };
        let outcome = CommitOutcome {
            user: PublicUser::from_user(user, Some(avatar_url.clone())),
            avatar_url,
        };
        if failed_keys.is_empty() {
            Ok(outcome)
        } else {
            Err(AvatarError::StorageCleanupFailed {
                outcome: Box::new(outcome),
                failed_keys,
            })
        }
    }
}

/// Fresh committed-namespace key for an avatar.
pub fn new_avatar_key() -> String {
    format!("{AVATAR_KEY_PREFIX}{}.{AVATAR_EXTENSION}", Uuid::new_v4())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_keys_are_unique_webp_objects() {
        let a = new_avatar_key();
        let b = new_avatar_key();

        assert_ne!(a, b);
        assert!(a.starts_with("avatars/") && a.ends_with(".webp"));
        let id = a
            .trim_start_matches(AVATAR_KEY_PREFIX)
            .trim_end_matches(".webp");
        assert!(Uuid::parse_str(id).is_ok());
        assert_eq!(staging_key(&a), format!("pending/{a}"));
    }

    #[test]
    fn ledger_outlives_credential_by_default() {
        let settings = AvatarSettings::default();
        assert!(settings.pending_ttl > settings.credential_ttl);
        assert_eq!(settings.credential_ttl, Duration::from_secs(180));
    }

    #[test]
    fn expiry_saturates() {
        let now = Utc::now();
        assert_eq!(expiry(now, Duration::from_secs(60)), now + TimeDelta::seconds(60));
        assert_eq!(expiry(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }
}

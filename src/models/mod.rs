//! Core data models for the avatar subsystem.
//!
//! These entities map to the `users` and `pending_uploads` tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod pending_upload;
pub mod user;

pub use pending_upload::{PENDING_PREFIX, PendingUpload, UploadKind, staging_key};
pub use user::{NewUser, PublicUser, User};

//! Defines routes for the avatar API and the local storage endpoints.
//!
//! ## Structure
//! - **User endpoints** (caller identified by `x-user-id`)
//!   - `GET  /v1/users/me` — public profile with a fresh avatar URL
//!   - `GET  /v1/users/me/avatar/upload-url` — issue an upload credential
//!   - `POST /v1/users/me/avatar` — reconcile a finished upload
//!   - `POST /v1/users/me/avatar/promote` — finish moves for the committed avatar
//!
//! - **Local storage endpoints** (only answer for the local backend)
//!   - `POST /storage/{bucket}` — signed form upload
//!   - `GET  /storage/{bucket}/{*key}` — signed download

use crate::{
    handlers::{
        avatar_handlers::{commit_avatar, get_me, get_upload_url, promote_avatar},
        health_handlers::{healthz, readyz},
        storage_handlers::{download, upload_form},
    },
    services::avatar_service::AvatarSettings,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for the policy fields and multipart framing around the file part.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build and return the router carrying `AppState` to all handlers.
pub fn routes(settings: &AvatarSettings) -> Router<AppState> {
    let upload_limit =
        usize::try_from(settings.max_avatar_bytes).unwrap_or(usize::MAX - FORM_OVERHEAD_BYTES);

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // user endpoints
        .route("/v1/users/me", get(get_me))
        .route("/v1/users/me/avatar/upload-url", get(get_upload_url))
        .route("/v1/users/me/avatar", post(commit_avatar))
        .route("/v1/users/me/avatar/promote", post(promote_avatar))
        // local storage endpoints
        .route(
            "/storage/{bucket}",
            post(upload_form).layer(DefaultBodyLimit::max(
                upload_limit.saturating_add(FORM_OVERHEAD_BYTES),
            )),
        )
        .route("/storage/{bucket}/{*key}", get(download))
}

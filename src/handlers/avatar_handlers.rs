//! HTTP handlers for the signed-in user's profile and avatar.

use crate::{
    errors::AppError,
    handlers::auth::CurrentUser,
    models::PublicUser,
    services::avatar_service::{AvatarError, CommitOutcome, UploadCredential},
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Optional body for `POST /v1/users/me/avatar`.
#[derive(Debug, Default, Deserialize)]
pub struct CommitAvatarReq {
    /// Key returned with the upload credential.
    pub object_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: PublicUser,
}

#[derive(Debug, Serialize)]
pub struct AvatarResponse {
    /// Null when the avatar committed but could not be presigned.
    pub avatar_url: Option<String>,
    pub user: PublicUser,
    /// Objects the service could not reclaim. The avatar is live regardless.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cleanup_failed: Vec<String>,
}

impl From<CommitOutcome> for AvatarResponse {
    fn from(outcome: CommitOutcome) -> Self {
        Self {
            avatar_url: Some(outcome.avatar_url),
            user: outcome.user,
            cleanup_failed: Vec::new(),
        }
    }
}

/// `GET /v1/users/me`
pub async fn get_me(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<UserResponse>, AppError> {
    let user = state.avatars.get_public_user(user_id).await?;
    Ok(Json(UserResponse { user }))
}

/// `GET /v1/users/me/avatar/upload-url`
pub async fn get_upload_url(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<UploadCredential>, AppError> {
    let credential = state.avatars.issue_upload_credential(user_id).await?;
    Ok(Json(credential))
}

/// `POST /v1/users/me/avatar` — reconcile a finished upload.
///
/// An empty body commits the newest outstanding intent.
pub async fn commit_avatar(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    body: Bytes,
) -> Result<Response, AppError> {
    let req: CommitAvatarReq = if body.iter().all(u8::is_ascii_whitespace) {
        CommitAvatarReq::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, format!("invalid body: {e}")))?
    };

    let result = state
        .avatars
        .commit_avatar_upload(user_id, req.object_key.as_deref())
        .await;
    avatar_response(StatusCode::CREATED, result)
}

/// `POST /v1/users/me/avatar/promote` — finish moves for the committed avatar.
pub async fn promote_avatar(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Response, AppError> {
    let result = state.avatars.resume_avatar_promotion(user_id).await;
    avatar_response(StatusCode::OK, result)
}

/// Post-commit failures are reported alongside a successful result, not as
/// an error, since the pointer already moved.
fn avatar_response(
    status: StatusCode,
    result: Result<CommitOutcome, AvatarError>,
) -> Result<Response, AppError> {
    match result {
        Ok(outcome) => Ok((status, Json(AvatarResponse::from(outcome))).into_response()),
        Err(AvatarError::StorageCleanupFailed {
            outcome,
            failed_keys,
        }) => {
            warn!(?failed_keys, "avatar committed with cleanup failures");
            let body = AvatarResponse {
                cleanup_failed: failed_keys,
                ..AvatarResponse::from(*outcome)
            };
            Ok((status, Json(body)).into_response())
        }
        Err(AvatarError::AvatarUrlUnavailable {
            key,
            user,
            failed_keys,
            source,
        }) => {
            warn!(object_key = %key, error = %source, "avatar committed without download url");
            let body = AvatarResponse {
                avatar_url: None,
                user: *user,
                cleanup_failed: failed_keys,
            };
            Ok((status, Json(body)).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

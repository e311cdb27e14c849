use crate::services::avatar_service::AvatarError;
use crate::storage::{StoreError, post_policy::PolicyError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<AvatarError> for AppError {
    fn from(err: AvatarError) -> Self {
        let status = match &err {
            AvatarError::NoPendingUpload
            | AvatarError::StagedObjectNotFound { .. }
            | AvatarError::UserNotFound(_)
            | AvatarError::NoCommittedAvatar => StatusCode::NOT_FOUND,
            AvatarError::PendingUploadNotFound { .. } => StatusCode::CONFLICT,
            AvatarError::StorageUnavailable { .. } | AvatarError::AvatarUrlUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AvatarError::StoragePromotionFailed { .. }
            | AvatarError::StorageCleanupFailed { .. }
            | AvatarError::Task(_)
            | AvatarError::Storage(_)
            | AvatarError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "avatar request failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match &err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            StoreError::SizeOutOfRange { .. } => StatusCode::BAD_REQUEST,
            StoreError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            StoreError::S3(_)
            | StoreError::Io(_)
            | StoreError::Signing(_)
            | StoreError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "object store request failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<PolicyError> for AppError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::MissingField(_) | PolicyError::Malformed(_) => {
                AppError::new(StatusCode::BAD_REQUEST, err.to_string())
            }
            _ => AppError::forbidden(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn avatar_errors_map_to_statuses() {
        let cases = [
            (AvatarError::NoPendingUpload, StatusCode::NOT_FOUND),
            (
                AvatarError::StagedObjectNotFound { key: "pending/avatars/a.webp".into() },
                StatusCode::NOT_FOUND,
            ),
            (AvatarError::UserNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                AvatarError::PendingUploadNotFound { key: "avatars/a.webp".into() },
                StatusCode::CONFLICT,
            ),
            (
                AvatarError::StorageUnavailable {
                    key: "pending/avatars/a.webp".into(),
                    source: StoreError::Timeout {
                        op: "stat",
                        key: "pending/avatars/a.webp".into(),
                        limit_ms: 2000,
                    },
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AvatarError::StoragePromotionFailed {
                    key: "avatars/a.webp".into(),
                    source: StoreError::Signing("boom".into()),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(AppError::from(err).status, expected);
        }
    }

    #[test]
    fn policy_failures_are_client_errors() {
        assert_eq!(
            AppError::from(PolicyError::SignatureMismatch).status,
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::from(PolicyError::MissingField("policy")).status,
            StatusCode::BAD_REQUEST
        );
    }
}

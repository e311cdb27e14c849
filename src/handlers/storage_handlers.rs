//! Presigned endpoints of the local storage backend.
//!
//! These stand in for the object storage service during development: the
//! browser posts the signed form here and fetches avatars through signed
//! download URLs. Bodies are streamed, never buffered.

use crate::{
    errors::AppError,
    state::AppState,
    storage::{LocalStore, ObjectStore, StoreError},
};
use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use futures::TryStreamExt;
use serde::Deserialize;
use std::{collections::BTreeMap, io, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Query string of a presigned download.
#[derive(Debug, Deserialize)]
pub struct SignedGetQuery {
    pub expires: i64,
    pub signature: String,
}

fn local_bucket(state: &AppState, bucket: &str) -> Result<Arc<LocalStore>, AppError> {
    match &state.local {
        Some(local) if local.bucket() == bucket => Ok(local.clone()),
        _ => Err(AppError::not_found(format!("bucket `{bucket}` not found"))),
    }
}

/// `POST /storage/{bucket}` — browser form upload.
///
/// Fields before the `file` part are checked against the signed policy;
/// anything after it is ignored. Nothing is written unless the policy holds.
pub async fn upload_form(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let local = local_bucket(&state, &bucket)?;
    let mut fields = BTreeMap::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_ascii_lowercase();
        if name != "file" {
            let value = field
                .text()
                .await
                .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
            fields.insert(name, value);
            continue;
        }

        let verified = local.verify_post(&fields, Utc::now())?;
        let stream = field.map_err(io::Error::other);
        let written = local
            .write_stream(&verified.key, stream, verified.content_length)
            .await?;
        info!(key = %verified.key, written, "accepted form upload");
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    Err(AppError::new(StatusCode::BAD_REQUEST, "form has no file part"))
}

/// `GET /storage/{bucket}/{*key}?expires=..&signature=..` — signed download.
pub async fn download(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<SignedGetQuery>,
) -> Result<Response, AppError> {
    let local = local_bucket(&state, &bucket)?;
    local.verify_get(&key, query.expires, &query.signature, Utc::now())?;

    let (file, len) = local.open(&key).await.map_err(|err| match err {
        StoreError::NotFound(_) => {
            debug!(key = %key, "signed download of missing object");
            AppError::not_found(format!("object `{key}` not found"))
        }
        other => other.into(),
    })?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&key)));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private, max-age=3600"));
    Ok(response)
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

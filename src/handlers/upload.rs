//! Multipart upload endpoint.
//!
//! # Endpoints
//!
//! - `POST /` and `POST /api/upload` - `multipart/form-data` with a `file` field
//!
//! The `file` field is streamed to disk chunk by chunk; `MAX_FILE_SIZE` is
//! enforced while streaming and an oversized upload leaves nothing behind.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::files::{FileStore, StoredFile};
use crate::metrics;
use crate::middleware::UploadedBytes;
use crate::models::UploadResponse;
use crate::state::AppState;
use crate::utils::{format_bytes, format_duration};

/// Multipart field carrying the file.
pub const FILE_FIELD: &str = "file";

/// Upload a file.
///
/// # Response Body (201)
///
/// ```json
/// {
///   "message": "File uploaded successfully",
///   "filename": "3f0c..._1700003600.pdf",
///   "original_name": "report.pdf",
///   "size": 1048576,
///   "size_human": "1.0 MB",
///   "expires_at": "2024-01-15T11:30:00Z",
///   "expires_in": "1h",
///   "download_url": "http://localhost:3000/3f0c..._1700003600.pdf"
/// }
/// ```
///
/// # Errors
///
/// - 400 if the form has no `file` field or is malformed
/// - 413 if the file exceeds `MAX_FILE_SIZE`
#[instrument(skip(state, multipart))]
pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    let max = state.files.max_file_size();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let original_name = field
            .file_name()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("upload")
            .to_string();

        let stored = match store_field(&state.files, &original_name, field).await {
            Ok(stored) => stored,
            Err(e) => {
                metrics::record_upload(upload_failure_status(&e), 0);
                return Err(e);
            }
        };

        info!(
            filename = %stored.filename,
            original_name = %original_name,
            size = stored.size,
            "File uploaded"
        );
        metrics::record_upload("success", stored.size);

        let body = UploadResponse {
            message: "File uploaded successfully".to_string(),
            download_url: state.config.download_url(&stored.filename),
            size_human: format_bytes(stored.size),
            expires_in: format_duration(state.files.expiry()),
            filename: stored.filename,
            original_name,
            size: stored.size,
            expires_at: stored.expires_at,
        };

        return Ok((
            StatusCode::CREATED,
            Extension(UploadedBytes(body.size)),
            Json(body),
        ));
    }

    metrics::record_upload("bad_request", 0);
    Err(AppError::BadRequest(format!(
        "Missing '{FILE_FIELD}' field in multipart form"
    )))
}

/// Stream one field into the store, discarding the partial file on failure.
async fn store_field(
    files: &FileStore,
    original_name: &str,
    mut field: Field<'_>,
) -> AppResult<StoredFile> {
    let max = files.max_file_size();
    let mut pending = files.begin(original_name).await?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                pending.discard().await;
                return Err(multipart_error(e, max));
            }
        };

        if let Err(e) = pending.write_chunk(&chunk).await {
            pending.discard().await;
            return Err(e);
        }
    }

    pending.finish().await
}

fn multipart_error(err: MultipartError, max: u64) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge { max }
    } else {
        AppError::BadRequest(format!("Invalid multipart form: {}", err.body_text()))
    }
}

fn upload_failure_status(err: &AppError) -> &'static str {
    match err {
        AppError::PayloadTooLarge { .. } => "too_large",
        AppError::BadRequest(_) => "bad_request",
        _ => "error",
    }
}

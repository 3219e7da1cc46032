//! File download endpoint.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::error::AppResult;
use crate::state::AppState;

/// Stream a stored file as an attachment.
///
/// Expired files are deleted and reported as 404, as are unknown names and
/// anything that does not look like a stored file name.
#[instrument(skip(state))]
pub async fn download_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> AppResult<Response> {
    let opened = state.files.open(&filename).await?;
    debug!(filename = %filename, size = opened.size, "Serving file");

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (CONTENT_DISPOSITION, disposition),
            (CONTENT_LENGTH, HeaderValue::from(opened.size)),
        ],
        Body::from_stream(ReaderStream::new(opened.file)),
    )
        .into_response())
}

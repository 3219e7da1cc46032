//! Upload admission middleware.
//!
//! Runs the rate limiter around upload handlers in two phases:
//!
//! ```text
//! Request ─► resolve identity ─► check limits ─┬─► 429 (Retry-After)
//!                                              │
//!                                              ▼
//!                                  handler (streams the file)
//!                                              │
//!                                              ▼
//!    commit true size (atomic checks: settle the reserved estimate)
//! ```
//!
//! # Response Headers
//!
//! Every checked response carries:
//! - `X-RateLimit-Limit-Uploads` / `X-RateLimit-Remaining-Uploads`
//! - `X-RateLimit-Limit-Bytes` / `X-RateLimit-Remaining-Bytes`
//! - `X-RateLimit-Reset`: Unix seconds when the current window ends
//!
//! # Request and Response Extensions
//!
//! - [`AdmissionTicket`] is inserted into the request before the handler runs.
//! - Handlers report the transferred size by inserting [`UploadedBytes`]
//!   into the response; the estimate from `Content-Length` is used otherwise.
//!   On an atomic store the estimate was reserved during the check and is
//!   corrected to the reported size afterwards.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{ACCEPT, CONTENT_LENGTH, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::metrics;
use crate::ratelimit::{AdmissionError, LimitStatus, LimitType, RateLimitError, RateLimiter};
use crate::state::AppState;

pub const HEADER_LIMIT_UPLOADS: &str = "x-ratelimit-limit-uploads";
pub const HEADER_REMAINING_UPLOADS: &str = "x-ratelimit-remaining-uploads";
pub const HEADER_LIMIT_BYTES: &str = "x-ratelimit-limit-bytes";
pub const HEADER_REMAINING_BYTES: &str = "x-ratelimit-remaining-bytes";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Identity and size checked for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTicket {
    pub client_ip: IpAddr,
    pub estimated_size: u64,
    /// The upload was recorded by the check itself.
    pub committed: bool,
}

/// Bytes actually stored by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadedBytes(pub u64);

/// Admission middleware for upload routes.
///
/// Mount with `axum::middleware::from_fn_with_state`. When admission is
/// disabled in the state the request passes straight through.
pub async fn upload_admission(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = state.limiter.clone() else {
        return next.run(request).await;
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let client_ip = match limiter.resolver().resolve(request.headers(), peer) {
        Ok(ip) => ip,
        Err(e) => {
            warn!(error = %e, "Could not determine client identity");
            return AppError::from(e).into_response();
        }
    };

    let estimated_size = estimate_size(request.headers());
    let wants_html = accepts_html(request.headers());
    let endpoint = request.uri().path().to_owned();

    let started = Instant::now();
    let outcome = limiter
        .check_limits_for_endpoint(client_ip, estimated_size, &endpoint)
        .await;
    metrics::record_check_duration(started.elapsed().as_secs_f64());

    let admission = match outcome {
        Ok(admission) => admission,
        Err(AdmissionError::RateLimitExceeded { status, error }) => {
            warn!(
                client_ip = %client_ip,
                limit_type = %error.limit_type,
                retry_after_secs = error.retry_after,
                "Upload rejected by rate limit"
            );
            metrics::record_rate_limit_rejection(error.limit_type.as_str());
            return rejection_response(&status, &error, wants_html);
        }
        Err(e) => {
            error!(client_ip = %client_ip, error = %e, "Rate limit check failed");
            metrics::record_store_error("check");
            return AppError::from(e).into_response();
        }
    };

    let ticket = AdmissionTicket {
        client_ip,
        estimated_size,
        committed: admission.committed,
    };
    request.extensions_mut().insert(ticket);

    let mut response = next.run(request).await;
    apply_limit_headers(response.headers_mut(), &admission.status);

    if response.status().is_success() {
        let uploaded = response
            .extensions()
            .get::<UploadedBytes>()
            .map(|UploadedBytes(size)| *size);
        commit_upload(&limiter, ticket, uploaded).await;
    }

    response
}

/// Record a successful upload at its true size.
///
/// An atomic check already counted the upload with the estimate, so only
/// the byte difference is written. Failures are logged; the file is
/// already stored and the response stands.
async fn commit_upload(limiter: &RateLimiter, ticket: AdmissionTicket, uploaded: Option<u64>) {
    let client_ip = ticket.client_ip;

    let outcome = match (ticket.committed, uploaded) {
        (true, Some(actual)) => {
            limiter
                .settle_upload(client_ip, ticket.estimated_size, actual)
                .await
        }
        (true, None) => return,
        (false, size) => {
            let size = size.unwrap_or(ticket.estimated_size);
            limiter.update_counters(client_ip, size).await
        }
    };

    match outcome {
        Ok(()) => debug!(client_ip = %client_ip, size = ?uploaded, "Upload counted"),
        Err(e) => {
            warn!(client_ip = %client_ip, error = %e, "Failed to record upload");
            metrics::record_store_error("commit");
        }
    }
}

/// Size hint from `Content-Length`, or 0 when absent.
fn estimate_size(headers: &HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/html"))
}

/// Set the `X-RateLimit-*` headers from a status snapshot.
pub fn apply_limit_headers(headers: &mut HeaderMap, status: &LimitStatus) {
    let values = [
        (HEADER_LIMIT_UPLOADS, status.uploads_limit),
        (HEADER_REMAINING_UPLOADS, status.remaining_uploads()),
        (HEADER_LIMIT_BYTES, status.bytes_limit),
        (HEADER_REMAINING_BYTES, status.remaining_bytes()),
        (HEADER_RESET, status.reset_time.timestamp()),
    ];

    for (name, value) in values {
        headers.insert(name, HeaderValue::from(value));
    }
}

// =============================================================================
// Rejection Rendering
// =============================================================================

#[derive(Debug, Serialize)]
struct RejectionBody<'a> {
    error: &'static str,
    code: &'static str,
    message: &'a str,
    details: RejectionDetails<'a>,
    current_usage: &'a LimitStatus,
    retry_after: u64,
    reset_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct RejectionDetails<'a> {
    limit_type: LimitType,
    reason: &'a str,
    usage: &'a std::collections::BTreeMap<String, i64>,
}

fn rejection_response(status: &LimitStatus, error: &RateLimitError, html: bool) -> Response {
    let mut response = if html {
        Html(rejection_page(status, error)).into_response()
    } else {
        Json(RejectionBody {
            error: "Rate limit exceeded",
            code: "RATE_LIMIT_EXCEEDED",
            message: &error.message,
            details: RejectionDetails {
                limit_type: error.limit_type,
                reason: &error.message,
                usage: &error.current_usage,
            },
            current_usage: status,
            retry_after: error.retry_after,
            reset_time: status.reset_time,
        })
        .into_response()
    };

    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(error.retry_after));
    apply_limit_headers(headers, status);
    response
}

fn rejection_page(status: &LimitStatus, error: &RateLimitError) -> String {
    const MB: f64 = 1024.0 * 1024.0;

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Rate Limit Exceeded</title>
    <style>
        body {{ font-family: Arial, sans-serif; margin: 40px; }}
        .error {{ color: #d32f2f; }}
        .info {{ color: #1976d2; margin-top: 20px; }}
    </style>
</head>
<body>
    <h1 class="error">Rate Limit Exceeded</h1>
    <p>{message}</p>
    <div class="info">
        <p><strong>Current Usage:</strong></p>
        <ul>
            <li>Uploads: {uploads_used} / {uploads_limit}</li>
            <li>Data: {bytes_used:.2} MB / {bytes_limit:.2} MB</li>
        </ul>
        <p>Please try again in {retry_after} seconds.</p>
    </div>
</body>
</html>
"#,
        message = error.message,
        uploads_used = status.uploads_used,
        uploads_limit = status.uploads_limit,
        bytes_used = status.bytes_used as f64 / MB,
        bytes_limit = status.bytes_limit as f64 / MB,
        retry_after = error.retry_after,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ratelimit::{Limits, UNLIMITED};
    use std::time::Duration;

    fn status(uploads_used: u64, bytes_used: u64) -> LimitStatus {
        let limits = Limits {
            uploads: 5,
            bytes: 100,
            window: Duration::from_secs(3600),
        };
        LimitStatus::measured("203.0.113.1", Utc::now(), &limits, uploads_used, bytes_used)
    }

    #[test]
    fn test_estimate_size() {
        let mut headers = HeaderMap::new();
        assert_eq!(estimate_size(&headers), 0);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("2048"));
        assert_eq!(estimate_size(&headers), 2048);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(estimate_size(&headers), 0);
    }

    #[test]
    fn test_accepts_html() {
        let mut headers = HeaderMap::new();
        assert!(!accepts_html(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!accepts_html(&headers));

        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert!(accepts_html(&headers));
    }

    #[test]
    fn test_limit_headers_clamp_remaining() {
        let mut headers = HeaderMap::new();
        apply_limit_headers(&mut headers, &status(7, 40));

        assert_eq!(headers[HEADER_LIMIT_UPLOADS], "5");
        assert_eq!(headers[HEADER_REMAINING_UPLOADS], "0");
        assert_eq!(headers[HEADER_LIMIT_BYTES], "100");
        assert_eq!(headers[HEADER_REMAINING_BYTES], "60");
        assert!(headers.contains_key(HEADER_RESET));
    }

    #[test]
    fn test_limit_headers_for_unlimited_identity() {
        let mut headers = HeaderMap::new();
        let status = LimitStatus::unlimited("10.0.0.1", Utc::now(), Duration::from_secs(60));
        apply_limit_headers(&mut headers, &status);

        assert_eq!(headers[HEADER_LIMIT_UPLOADS], UNLIMITED.to_string().as_str());
        assert_eq!(headers[HEADER_REMAINING_BYTES], "-1");
    }

    #[test]
    fn test_rejection_response_json_and_html() {
        let status = status(5, 10).limited(LimitType::UploadCount);
        let error = RateLimitError::new(
            "203.0.113.1",
            LimitType::UploadCount,
            "Upload limit: 5 uploads per 60 minutes exceeded",
            Duration::from_secs(3600),
        );

        let json = rejection_response(&status, &error, false);
        assert_eq!(json.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json.headers()[RETRY_AFTER], "3600");
        assert!(
            json.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("application/json")
        );

        let html = rejection_response(&status, &error, true);
        assert_eq!(html.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(
            html.headers()["content-type"]
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );
    }

    #[test]
    fn test_rejection_page_mentions_usage() {
        let status = status(5, 10);
        let error = RateLimitError::new(
            "203.0.113.1",
            LimitType::UploadCount,
            "Upload limit exceeded",
            Duration::from_secs(600),
        );

        let page = rejection_page(&status, &error);
        assert!(page.contains("Uploads: 5 / 5"));
        assert!(page.contains("try again in 600 seconds"));
    }
}

//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Sets and propagates X-Request-Id
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Admission     │ ← upload routes only: 429 / 400 / 503
//! └────────┬─────────┘
//!          ▼
//!      Handler
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready` - Health & monitoring
//! - `POST /`, `POST /api/upload` - Uploads (admission applied)
//! - `GET /api/rate-limit` - Caller's usage
//! - `GET /{filename}` - Downloads

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;
use crate::middleware::upload_admission;
use crate::state::AppState;

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the application router with all routes and middleware configured.
///
/// - **Admission**: mounted on the upload routes when a limiter is present
/// - **Body limit**: `MAX_FILE_SIZE` plus multipart overhead, uploads only
/// - **CORS**: configured from `cors_allowed_origins`
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let body_limit = usize::try_from(config.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD);

    // =========================================================================
    // Upload Routes
    // =========================================================================
    let mut uploads = Router::new()
        .route("/", post(handlers::upload_file))
        .route("/api/upload", post(handlers::upload_file))
        .layer(DefaultBodyLimit::max(body_limit));

    if let Some(limiter) = &state.limiter {
        info!(store = %limiter.store_kind(), "Upload admission enabled");
        uploads = uploads.route_layer(from_fn_with_state(state.clone(), upload_admission));
    } else {
        info!("Upload admission disabled (ENABLE_RATE_LIMIT=false)");
    }

    // =========================================================================
    // Everything Else
    // =========================================================================
    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/api/rate-limit", get(handlers::rate_limit_status))
        .route("/{filename}", get(handlers::download_file))
        .merge(uploads);

    // =========================================================================
    // Apply Middleware Stack (order matters - last added runs first)
    // =========================================================================
    router
        .layer(build_cors_layer(&config.cors_allowed_origins))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Build CORS layer from configuration.
///
/// `*` allows any origin; otherwise only the listed origins that parse as
/// header values are allowed.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::clock::{ManualClock, SharedClock};
    use crate::config::Config;
    use crate::files::FileStore;
    use crate::models::UploadResponse;
    use crate::ratelimit::testing::SerializedAtomicStore;
    use crate::ratelimit::{RateLimitConfig, RateLimiter, StoreHandle};

    const BOUNDARY: &str = "tempdrop-test-boundary";

    async fn test_state(dir: &std::path::Path, rate_limit: RateLimitConfig) -> AppState {
        let clock: SharedClock = Arc::new(ManualClock::default());
        let config = Config {
            upload_dir: dir.to_path_buf(),
            max_file_size: 1024,
            rate_limit,
            ..Config::default()
        };

        let files = FileStore::create(dir, config.max_file_size, config.file_expiry, clock.clone())
            .await
            .unwrap();
        let limiter = if config.rate_limit.enabled {
            Some(
                RateLimiter::from_config(&config.rate_limit, clock.clone())
                    .await
                    .unwrap(),
            )
        } else {
            None
        };

        AppState::new(config, files, limiter, clock)
    }

    /// State whose limiter checks and records in one step.
    async fn atomic_state(dir: &std::path::Path, rate_limit: RateLimitConfig) -> AppState {
        let clock: SharedClock = Arc::new(ManualClock::default());
        let config = Config {
            upload_dir: dir.to_path_buf(),
            max_file_size: 1024,
            rate_limit,
            ..Config::default()
        };

        let files = FileStore::create(dir, config.max_file_size, config.file_expiry, clock.clone())
            .await
            .unwrap();
        let store = StoreHandle::atomic(SerializedAtomicStore::new(clock.clone()));
        let limiter = RateLimiter::new(&config.rate_limit, store, clock.clone()).unwrap();

        AppState::new(config, files, Some(limiter), clock)
    }

    fn multipart_body(field: &str, filename: &str, content: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(path: &str, peer: &str, body: Vec<u8>) -> Request<Body> {
        let mut request = Request::post(path)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .header(header::CONTENT_LENGTH, body.len())
            .body(Body::from(body))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        request
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_build_cors_layer_any() {
        let _layer = build_cors_layer(&["*".to_string()]);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let _layer = build_cors_layer(&[
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RateLimitConfig::default()).await;
        let app = build_router(state.clone());

        let response = app
            .clone()
            .oneshot(upload_request(
                "/api/upload",
                "203.0.113.5:4000",
                multipart_body("file", "hello.txt", b"hello"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-ratelimit-limit-uploads"], "5");
        assert!(response.headers().contains_key("x-request-id"));

        let body: UploadResponse = serde_json::from_value(json(response).await).unwrap();
        assert_eq!(body.size, 5);
        assert_eq!(body.original_name, "hello.txt");
        assert!(body.filename.ends_with(".txt"));

        let download = app
            .oneshot(
                Request::get(format!("/{}", body.filename))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        assert!(
            download.headers()[header::CONTENT_DISPOSITION]
                .to_str()
                .unwrap()
                .starts_with("attachment")
        );
        let bytes = download.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");

        let ip = "203.0.113.5".parse().unwrap();
        let status = state.limiter.as_ref().unwrap().get_status(ip).await.unwrap();
        assert_eq!(status.uploads_used, 1);
        assert_eq!(status.bytes_used, 5);
    }

    #[tokio::test]
    async fn test_upload_limit_returns_429() {
        let dir = tempfile::tempdir().unwrap();
        let rate_limit = RateLimitConfig {
            uploads_per_minute: 2,
            ..RateLimitConfig::default()
        };
        let app = build_router(test_state(dir.path(), rate_limit).await);

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(upload_request(
                    "/",
                    "203.0.113.6:4000",
                    multipart_body("file", "a.txt", b"a"),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app
            .oneshot(upload_request(
                "/",
                "203.0.113.6:4000",
                multipart_body("file", "a.txt", b"a"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3600");
        assert_eq!(response.headers()["x-ratelimit-remaining-uploads"], "0");

        let body = json(response).await;
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["details"]["limit_type"], "upload_count");
        assert_eq!(body["current_usage"]["uploads_used"], 2);
    }

    #[tokio::test]
    async fn test_atomic_store_records_true_size_without_content_length() {
        let dir = tempfile::tempdir().unwrap();
        let rate_limit = RateLimitConfig {
            bytes_per_hour: 1000,
            ..RateLimitConfig::default()
        };
        let state = atomic_state(dir.path(), rate_limit).await;
        let app = build_router(state.clone());

        let chunked_upload = || {
            let mut request = Request::post("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={BOUNDARY}"),
                )
                .body(Body::from(multipart_body("file", "a.bin", &[7u8; 800])))
                .unwrap();
            request
                .extensions_mut()
                .insert(ConnectInfo("203.0.113.12:4000".parse::<SocketAddr>().unwrap()));
            request
        };

        let mut statuses = Vec::new();
        for _ in 0..3 {
            let response = app.clone().oneshot(chunked_upload()).await.unwrap();
            statuses.push(response.status());
        }

        assert_eq!(
            statuses,
            [
                StatusCode::CREATED,
                StatusCode::CREATED,
                StatusCode::TOO_MANY_REQUESTS
            ]
        );

        let ip = "203.0.113.12".parse().unwrap();
        let status = state.limiter.as_ref().unwrap().get_status(ip).await.unwrap();
        assert_eq!(status.uploads_used, 2);
        assert_eq!(status.bytes_used, 1600);
    }

    #[tokio::test]
    async fn test_atomic_store_settles_overestimated_size() {
        let dir = tempfile::tempdir().unwrap();
        let state = atomic_state(dir.path(), RateLimitConfig::default()).await;
        let app = build_router(state.clone());

        let body = multipart_body("file", "hello.txt", b"hello");
        let reserved = body.len() as u64;
        let response = app
            .oneshot(upload_request("/api/upload", "203.0.113.13:4000", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(reserved > 5);

        let ip = "203.0.113.13".parse().unwrap();
        let status = state.limiter.as_ref().unwrap().get_status(ip).await.unwrap();
        assert_eq!(status.uploads_used, 1);
        assert_eq!(status.bytes_used, 5);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_413_and_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path(), RateLimitConfig::default()).await;
        let app = build_router(state.clone());

        let response = app
            .oneshot(upload_request(
                "/api/upload",
                "203.0.113.7:4000",
                multipart_body("file", "big.bin", &[0u8; 2048]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let ip = "203.0.113.7".parse().unwrap();
        let status = state.limiter.as_ref().unwrap().get_status(ip).await.unwrap();
        assert_eq!(status.uploads_used, 0);
    }

    #[tokio::test]
    async fn test_missing_file_field_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), RateLimitConfig::default()).await);

        let response = app
            .oneshot(upload_request(
                "/api/upload",
                "203.0.113.8:4000",
                multipart_body("document", "a.txt", b"a"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upload_without_peer_is_ip_detection_failure() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), RateLimitConfig::default()).await);

        let body = multipart_body("file", "a.txt", b"a");
        let request = Request::post("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["code"], "IP_DETECTION_FAILED");
    }

    #[tokio::test]
    async fn test_admission_disabled_skips_headers() {
        let dir = tempfile::tempdir().unwrap();
        let rate_limit = RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        };
        let app = build_router(test_state(dir.path(), rate_limit).await);

        let response = app
            .clone()
            .oneshot(upload_request(
                "/",
                "203.0.113.9:4000",
                multipart_body("file", "a.txt", b"a"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!response.headers().contains_key("x-ratelimit-limit-uploads"));

        let health = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json(health).await["rate_limit_store"], "disabled");
    }

    #[tokio::test]
    async fn test_download_unknown_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), RateLimitConfig::default()).await);

        let response = app
            .oneshot(Request::get("/nothing.txt").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_rate_limit_status_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(dir.path(), RateLimitConfig::default()).await);

        let mut request = Request::get("/api/rate-limit").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("203.0.113.10:5000".parse::<SocketAddr>().unwrap()));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json(response).await;
        assert_eq!(body["ip"], "203.0.113.10");
        assert_eq!(body["uploads_used"], 0);
        assert_eq!(body["is_limited"], false);
    }
}

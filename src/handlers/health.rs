//! Health, readiness, and admission status endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Always 200, reports the counting store in use
//! - `GET /ready` - 503 when the counting store fails its health check
//! - `GET /api/rate-limit` - Caller's current usage against the global limits
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 if not ready to serve traffic

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{instrument, warn};

use crate::error::{AppError, AppResult};
use crate::middleware::apply_limit_headers;
use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "rate_limit_store": "memory",
///   "version": "0.1.0",
///   "uptime_seconds": 3600,
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        rate_limit_store: state.rate_limit_store().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
        timestamp: state.clock.now(),
    })
}

/// Readiness check endpoint for Kubernetes probes.
///
/// Not ready while the counting store is unreachable, since uploads would
/// be refused with 503 anyway.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let Some(limiter) = &state.limiter else {
        return StatusCode::OK;
    };

    match limiter.health_check().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "Readiness check: rate limit store unhealthy");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Current usage for the calling client, without counting an upload.
///
/// # Errors
///
/// - 404 when admission is disabled
/// - 400 if the client identity cannot be determined
/// - 5xx if the counting store fails
#[instrument(skip_all)]
pub async fn rate_limit_status(
    State(state): State<AppState>,
    request: Request,
) -> AppResult<Response> {
    let limiter = state
        .limiter
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Rate limiting is disabled".to_string()))?;

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_ip = limiter.resolver().resolve(request.headers(), peer)?;
    let status = limiter.get_status(client_ip).await?;

    let mut response = Json(&status).into_response();
    apply_limit_headers(response.headers_mut(), &status);
    Ok(response)
}

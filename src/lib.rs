//! # tempdrop
//!
//! A temporary file drop service with sliding-window upload admission
//! control:
//!
//! - **Uploads**: multipart uploads streamed to disk with a size cap
//! - **Expiry**: files carry their expiry in their name and are purged
//! - **Admission**: per-client upload count and byte limits over sliding
//!   windows, backed by an in-process or Redis counting store
//! - **Identity**: client addresses resolved through trusted proxies only
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Request ID → Trace → CORS → Admission)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (upload, download, health, rate-limit status)     │
//! ├───────────────────────────────┬─────────────────────────────┤
//! │  FileStore (disk)             │  RateLimiter + Resolver     │
//! │                               ├─────────────────────────────┤
//! │                               │  MemoryStore | RedisStore   │
//! └───────────────────────────────┴─────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tempdrop::{AppState, Config, FileStore, RateLimiter, SystemClock, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let clock = Arc::new(SystemClock);
//!
//!     let files = FileStore::create(
//!         &config.upload_dir,
//!         config.max_file_size,
//!         config.file_expiry,
//!         clock.clone(),
//!     )
//!     .await?;
//!     let limiter = RateLimiter::from_config(&config.rate_limit, clock.clone()).await?;
//!
//!     let state = AppState::new(config, files, Some(limiter), clock);
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Admission Configuration
//!
//! ```bash
//! RATE_LIMIT_STORE=redis REDIS_URL=redis://cache:6379 \
//! RATE_LIMIT_UPLOADS_PER_MINUTE=10 RATE_LIMIT_WINDOW_MINUTES=60 cargo run
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod files;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod ratelimit;
pub mod routes;
pub mod state;
pub mod utils;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::Config;
pub use error::{AppError, AppResult};
pub use files::FileStore;
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use routes::build_router;
pub use state::AppState;

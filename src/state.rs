//! Shared application state for Axum handlers.
//!
//! - **Files**: on-disk store for uploads
//! - **Limiter**: upload admission, absent when disabled
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! The expired-file purge runs as a background task managed with
//! `tokio_util::task::TaskTracker` and `CancellationToken`. The counting
//! store owns its own cleanup task. Call `shutdown()` to stop both before
//! exit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::Config;
use crate::files::FileStore;
use crate::metrics;
use crate::ratelimit::{MIN_SWEEP_INTERVAL, RateLimiter};

/// Shared application state for Axum handlers.
///
/// Cloned for each request; all internal data is behind `Arc`.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config, files, Some(limiter), clock);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    pub files: Arc<FileStore>,
    /// `None` when `ENABLE_RATE_LIMIT=false`
    pub limiter: Option<Arc<RateLimiter>>,
    pub clock: SharedClock,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Create application state and start the purge task.
    ///
    /// The task runs every `config.cleanup_interval`.
    pub fn new(
        config: Config,
        files: FileStore,
        limiter: Option<RateLimiter>,
        clock: SharedClock,
    ) -> Self {
        let state = Self {
            config: Arc::new(config),
            files: Arc::new(files),
            limiter: limiter.map(Arc::new),
            clock,
            started_at: Instant::now(),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        state.spawn_purge_task(state.config.cleanup_interval);

        state
    }

    /// Name of the counting store backing admission, or `disabled`.
    pub fn rate_limit_store(&self) -> &'static str {
        self.limiter
            .as_ref()
            .map_or("disabled", |limiter| limiter.store_kind().as_str())
    }

    /// Spawn the expired-file purge task.
    ///
    /// Only the file store handle is moved into the task.
    fn spawn_purge_task(&self, every: Duration) {
        let files = self.files.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(every.max(MIN_SWEEP_INTERVAL));
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Purge task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match files.purge_expired().await {
                            Ok(0) => {}
                            Ok(removed) => {
                                info!(removed, "Purged expired files");
                                metrics::record_files_purged(removed);
                            }
                            Err(e) => warn!(error = %e, "Expired file purge failed"),
                        }
                    }
                }
            }

            debug!("Purge task shutting down");
        });
    }

    /// Gracefully shutdown background tasks and release the counting store.
    ///
    /// 1. Signals the purge task to stop
    /// 2. Closes the task tracker and waits for it
    /// 3. Closes the rate limiter, stopping the store's own cleanup task
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        if let Some(limiter) = &self.limiter
            && let Err(e) = limiter.close().await
        {
            warn!(error = %e, "Failed to close rate limit store");
        }

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_shutdown_stops_tasks_and_closes_limiter() {
        let dir = tempfile::tempdir().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::default());
        let config = Config {
            upload_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        let files = FileStore::create(
            &config.upload_dir,
            config.max_file_size,
            config.file_expiry,
            clock.clone(),
        )
        .await
        .unwrap();
        let limiter = RateLimiter::from_config(&config.rate_limit, clock.clone())
            .await
            .unwrap();

        let state = AppState::new(config, files, Some(limiter), clock);
        assert_eq!(state.rate_limit_store(), "memory");

        state.shutdown().await;
        assert!(state.task_tracker.is_closed());
        assert!(state.limiter.as_ref().unwrap().health_check().await.is_err());
    }
}

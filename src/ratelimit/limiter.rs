//! Rate limiter orchestration.
//!
//! Combines the identity resolver, a counting store and the configured
//! limits into the admission contract used by the HTTP layer:
//!
//! - [`RateLimiter::check_limits_for_endpoint`] decides whether an upload of
//!   an estimated size may start. Rejections come back as
//!   `AdmissionError::RateLimitExceeded`, always carrying a [`LimitStatus`].
//! - [`RateLimiter::update_counters`] commits the true size after the upload
//!   succeeded. When the atomic path already committed the estimate,
//!   [`RateLimiter::settle_upload`] corrects it to the true size instead.
//! - [`RateLimiter::get_status`] is a side-effect-free snapshot.
//!
//! Retry-after is always the full length of the violated window.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::config::{RateLimitConfig, StoreKind};
use super::error::{AdmissionError, AdmissionResult};
use super::identity::{IdentityConfig, IdentityResolver};
use super::memory::{MemoryStore, MemoryStoreConfig};
use super::redis::{RedisStore, RedisStoreConfig};
use super::store::{AtomicStore, StoreHandle};
use super::types::{AtomicReason, LimitStatus, LimitType, Limits, RateLimitError};
use super::BYTES_WINDOW;
use crate::clock::SharedClock;

/// Result of a passed admission check.
#[derive(Debug, Clone)]
pub struct Admission {
    pub status: LimitStatus,
    /// The upload was already recorded by an atomic check.
    pub committed: bool,
}

#[derive(Debug)]
pub struct RateLimiter {
    store: StoreHandle,
    resolver: Arc<IdentityResolver>,
    global: Limits,
    endpoints: HashMap<String, Limits>,
    commit_window: Duration,
    clock: SharedClock,
}

impl RateLimiter {
    /// Build a limiter over an existing store.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidConfiguration` if the limits or any
    /// trusted-proxy, whitelist or header entry is invalid.
    pub fn new(
        config: &RateLimitConfig,
        store: StoreHandle,
        clock: SharedClock,
    ) -> AdmissionResult<Self> {
        config.validate()?;
        let resolver = IdentityResolver::new(&IdentityConfig::from(config))?;

        let endpoints = config
            .endpoints
            .iter()
            .map(|(path, endpoint)| (path.clone(), endpoint.limits()))
            .collect();

        info!(
            store = %store.store().kind(),
            atomic = store.is_atomic(),
            uploads = config.uploads_per_minute,
            bytes = config.bytes_per_hour,
            window_minutes = config.window_minutes,
            endpoint_overrides = config.endpoints.len(),
            "Rate limiter configured"
        );

        Ok(Self {
            store,
            resolver: Arc::new(resolver),
            global: config.global_limits(),
            endpoints,
            commit_window: config.commit_window(),
            clock,
        })
    }

    /// Build the configured store, then the limiter over it.
    ///
    /// # Errors
    ///
    /// Configuration errors as in [`Self::new`], plus
    /// `AdmissionError::BackendConnection` if Redis cannot be reached.
    pub async fn from_config(config: &RateLimitConfig, clock: SharedClock) -> AdmissionResult<Self> {
        config.validate()?;

        let store = match config.store {
            StoreKind::Memory => StoreHandle::plain(MemoryStore::new(
                MemoryStoreConfig {
                    max_entries: config.max_entries,
                    cleanup_interval: config.cleanup_interval,
                },
                clock.clone(),
            )),
            StoreKind::Redis => StoreHandle::atomic(
                RedisStore::connect(
                    RedisStoreConfig {
                        settings: config.redis.clone(),
                        max_window: config.commit_window(),
                        cleanup_interval: config.cleanup_interval,
                    },
                    clock.clone(),
                )
                .await?,
            ),
        };

        Self::new(config, store, clock)
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn store_kind(&self) -> StoreKind {
        self.store.store().kind()
    }

    /// Limits that apply to `endpoint`, falling back to the global ones.
    pub fn limits_for(&self, endpoint: &str) -> Limits {
        self.endpoints.get(endpoint).copied().unwrap_or(self.global)
    }

    /// Check the global limits.
    ///
    /// # Errors
    ///
    /// See [`Self::check_limits_for_endpoint`].
    pub async fn check_limits(&self, ip: IpAddr, size: u64) -> AdmissionResult<Admission> {
        self.check_limits_for_endpoint(ip, size, "").await
    }

    /// Check whether `ip` may upload `size` bytes to `endpoint`.
    ///
    /// # Errors
    ///
    /// - `AdmissionError::RateLimitExceeded` when a limit would be exceeded
    /// - store errors (`BackendConnection`, `BackendOperation`, `StoreClosed`)
    ///   when usage cannot be determined
    pub async fn check_limits_for_endpoint(
        &self,
        ip: IpAddr,
        size: u64,
        endpoint: &str,
    ) -> AdmissionResult<Admission> {
        let now = self.clock.now();
        let limits = self.limits_for(endpoint);

        if self.resolver.is_whitelisted(&ip) {
            debug!(client_ip = %ip, "Whitelisted identity bypasses rate limits");
            return Ok(Admission {
                status: LimitStatus::unlimited(ip.to_string(), now, limits.window),
                committed: false,
            });
        }

        match self.store.as_atomic() {
            Some(atomic) => self.check_atomic(atomic, ip, size, &limits).await,
            None => self.check_sequential(ip, size, &limits).await,
        }
    }

    async fn check_atomic(
        &self,
        store: &dyn AtomicStore,
        ip: IpAddr,
        size: u64,
        limits: &Limits,
    ) -> AdmissionResult<Admission> {
        let identity = ip.to_string();
        let outcome = store
            .atomic_check_and_increment(&identity, size, limits.window, limits.uploads, limits.bytes)
            .await?;

        let now = self.clock.now();
        let status = LimitStatus::measured(
            identity.clone(),
            now,
            limits,
            outcome.upload_count,
            outcome.bytes_used,
        );

        if outcome.allowed {
            return Ok(Admission {
                status,
                committed: true,
            });
        }

        let (limit_type, message, retry_after) = match outcome.reason {
            AtomicReason::UploadLimit => (
                LimitType::UploadLimit,
                upload_message(limits),
                limits.window,
            ),
            AtomicReason::BytesLimit => (LimitType::BytesLimit, bytes_message(limits), BYTES_WINDOW),
            AtomicReason::Ok => {
                return Err(AdmissionError::BackendOperation(
                    "atomic check refused the upload without a reason".to_string(),
                ));
            }
        };

        let error = RateLimitError::new(identity, limit_type, message, retry_after)
            .with_usage("uploads_used", outcome.upload_count)
            .with_usage("bytes_used", outcome.bytes_used)
            .with_usage("uploads_limit", limits.uploads)
            .with_usage("bytes_limit", limits.bytes);

        Err(AdmissionError::rejection(status.limited(limit_type), error))
    }

    async fn check_sequential(
        &self,
        ip: IpAddr,
        size: u64,
        limits: &Limits,
    ) -> AdmissionResult<Admission> {
        let identity = ip.to_string();
        let store = self.store.store();

        let uploads_used = store.get_upload_count(&identity, limits.window).await?;
        let bytes_used = store.get_bytes_used(&identity, BYTES_WINDOW).await?;

        let now = self.clock.now();
        let status = LimitStatus::measured(identity.clone(), now, limits, uploads_used, bytes_used);

        if uploads_used >= limits.uploads {
            let error = RateLimitError::new(
                identity,
                LimitType::UploadCount,
                upload_message(limits),
                limits.window,
            )
            .with_usage("uploads_used", uploads_used)
            .with_usage("uploads_limit", limits.uploads)
            .with_usage("window_minutes", limits.window_minutes());

            return Err(AdmissionError::rejection(
                status.limited(LimitType::UploadCount),
                error,
            ));
        }

        let total = bytes_used.saturating_add(size);
        if total > limits.bytes {
            let error = RateLimitError::new(
                identity,
                LimitType::BytesLimit,
                bytes_message(limits),
                BYTES_WINDOW,
            )
            .with_usage("bytes_used", bytes_used)
            .with_usage("bytes_limit", limits.bytes)
            .with_usage("file_size", size)
            .with_usage("total_would_be", total);

            return Err(AdmissionError::rejection(
                status.limited(LimitType::BytesLimit),
                error,
            ));
        }

        Ok(Admission {
            status,
            committed: false,
        })
    }

    /// Record a completed upload of `size` bytes.
    ///
    /// Records are kept visible for the longest configured window, so a
    /// later check against any endpoint override sees them.
    ///
    /// # Errors
    ///
    /// Store errors, including `StoreCapacityExceeded`.
    pub async fn update_counters(&self, ip: IpAddr, size: u64) -> AdmissionResult<()> {
        if self.resolver.is_whitelisted(&ip) {
            return Ok(());
        }

        self.store
            .store()
            .increment_upload(&ip.to_string(), size, self.commit_window)
            .await
    }

    /// Replace the bytes reserved by an atomic check with the true size.
    ///
    /// The upload itself stays counted once.
    ///
    /// # Errors
    ///
    /// Store errors if the correction cannot be written.
    pub async fn settle_upload(&self, ip: IpAddr, reserved: u64, actual: u64) -> AdmissionResult<()> {
        if reserved == actual || self.resolver.is_whitelisted(&ip) {
            return Ok(());
        }

        let delta = i64::try_from(actual)
            .unwrap_or(i64::MAX)
            .saturating_sub(i64::try_from(reserved).unwrap_or(i64::MAX));

        debug!(client_ip = %ip, reserved, actual, "Settling reserved upload size");
        self.store
            .store()
            .adjust_bytes(&ip.to_string(), delta, self.commit_window)
            .await
    }

    /// Current usage of `ip` against the global limits.
    ///
    /// # Errors
    ///
    /// Store errors when usage cannot be read.
    pub async fn get_status(&self, ip: IpAddr) -> AdmissionResult<LimitStatus> {
        let now = self.clock.now();
        let identity = ip.to_string();

        if self.resolver.is_whitelisted(&ip) {
            return Ok(LimitStatus::unlimited(identity, now, self.global.window));
        }

        let store = self.store.store();
        let uploads_used = store.get_upload_count(&identity, self.global.window).await?;
        let bytes_used = store.get_bytes_used(&identity, BYTES_WINDOW).await?;

        let status = LimitStatus::measured(identity, now, &self.global, uploads_used, bytes_used);
        Ok(if uploads_used >= self.global.uploads {
            status.limited(LimitType::UploadCount)
        } else if bytes_used >= self.global.bytes {
            status.limited(LimitType::BytesLimit)
        } else {
            status
        })
    }

    /// # Errors
    ///
    /// Store errors if the backend is unreachable or closed.
    pub async fn health_check(&self) -> AdmissionResult<()> {
        self.store.store().health_check().await
    }

    /// # Errors
    ///
    /// Store errors raised while releasing resources.
    pub async fn close(&self) -> AdmissionResult<()> {
        self.store.store().close().await
    }
}

fn upload_message(limits: &Limits) -> String {
    format!(
        "Upload limit: {} uploads per {} minutes exceeded",
        limits.uploads,
        limits.window_minutes()
    )
}

fn bytes_message(limits: &Limits) -> String {
    format!("Bytes limit: {} bytes per hour exceeded", limits.bytes)
}

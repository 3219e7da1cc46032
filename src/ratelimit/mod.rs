//! Upload admission control.
//!
//! Throttles uploads per client identity using sliding-window counts of
//! upload events and transferred bytes.
//!
//! # Components
//!
//! ```text
//!   request headers + peer address
//!              │
//!              ▼
//!   ┌──────────────────────┐
//!   │  IdentityResolver    │ ← trusted proxies, header priority, whitelist
//!   └──────────┬───────────┘
//!              │ IpAddr
//!              ▼
//!   ┌──────────────────────┐      ┌────────────────────────────┐
//!   │     RateLimiter      │ ───▶ │ StoreHandle                │
//!   │  global + endpoint   │      │  Plain(MemoryStore)        │
//!   │  limits, retry-after │      │  Atomic(RedisStore + Lua)  │
//!   └──────────────────────┘      └────────────────────────────┘
//! ```
//!
//! # Windows
//!
//! Records are stored with their timestamp and windows are applied when
//! they are read. An upload counts against a window of length `w` if its
//! timestamp lies in `[now - w, now]`. Byte volume is always measured over
//! [`BYTES_WINDOW`] regardless of the upload window.
//!
//! # Check then commit
//!
//! Stores without the atomic capability are checked with separate reads and
//! committed later by [`RateLimiter::update_counters`] once the upload has
//! actually succeeded. Concurrent requests can both pass the check on that
//! path. The Redis store closes that gap with a server-side script that
//! checks and increments in one step.

use std::time::Duration;

pub mod config;
pub mod error;
pub mod identity;
pub mod limiter;
pub mod memory;
pub mod redis;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use config::{RateLimitConfig, RedisSettings, StoreKind};
pub use error::{AdmissionError, AdmissionResult};
pub use identity::{AddressSet, CidrRange, IdentityConfig, IdentityResolver};
pub use limiter::{Admission, RateLimiter};
pub use memory::{MemoryStore, MemoryStoreConfig};
pub use self::redis::{RedisStore, RedisStoreConfig};
pub use store::{AtomicStore, Store, StoreHandle};
pub use types::{
    AtomicOutcome, AtomicReason, EndpointConfig, LimitStatus, LimitType, Limits, RateLimitError,
    UNLIMITED, UploadRecord,
};

/// Window over which the bytes-per-hour limit is measured.
pub const BYTES_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Records older than this are removed by periodic cleanup.
pub const CLEANUP_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of distinct identities the in-memory store tracks.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default interval between store cleanup sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shorter configured sweep intervals are raised to this.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

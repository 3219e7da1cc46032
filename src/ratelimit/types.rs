//! Value types shared by stores, the limiter and the HTTP layer.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{window_end, window_start};

/// Sentinel limit meaning "no limit applies".
pub const UNLIMITED: i64 = -1;

/// One admitted upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadRecord {
    pub timestamp: DateTime<Utc>,
    pub size: u64,
}

impl UploadRecord {
    pub fn new(timestamp: DateTime<Utc>, size: u64) -> Self {
        Self { timestamp, size }
    }

    /// Whether the record lies within `[cutoff, ..]`.
    #[inline]
    pub fn is_within(&self, cutoff: DateTime<Utc>) -> bool {
        self.timestamp >= cutoff
    }
}

/// Which limit rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    /// Upload count exceeded, found by the read-then-check path.
    UploadCount,
    /// Upload count exceeded, reported by the atomic path.
    UploadLimit,
    /// Byte volume exceeded.
    BytesLimit,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::UploadCount => "upload_count",
            LimitType::UploadLimit => "upload_limit",
            LimitType::BytesLimit => "bytes_limit",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective limits for one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub uploads: u64,
    pub bytes: u64,
    pub window: Duration,
}

impl Limits {
    pub fn window_minutes(&self) -> u64 {
        self.window.as_secs() / 60
    }
}

/// Per-endpoint override of the global limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub uploads_per_minute: u64,
    pub bytes_per_hour: u64,
    pub window_minutes: u64,
}

impl EndpointConfig {
    pub fn limits(&self) -> Limits {
        Limits {
            uploads: self.uploads_per_minute,
            bytes: self.bytes_per_hour,
            window: Duration::from_secs(self.window_minutes.saturating_mul(60)),
        }
    }
}

/// Snapshot of one identity's usage, produced fresh for every check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitStatus {
    pub ip: String,
    pub uploads_used: u64,
    pub uploads_limit: i64,
    pub bytes_used: u64,
    pub bytes_limit: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub reset_time: DateTime<Utc>,
    pub is_limited: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub limit_reason: String,
}

impl LimitStatus {
    /// Status for an identity exempt from all limits.
    pub fn unlimited(ip: impl Into<String>, now: DateTime<Utc>, window: Duration) -> Self {
        let end = window_end(now, window);
        Self {
            ip: ip.into(),
            uploads_used: 0,
            uploads_limit: UNLIMITED,
            bytes_used: 0,
            bytes_limit: UNLIMITED,
            window_start: window_start(now, window),
            window_end: end,
            reset_time: end,
            is_limited: false,
            limit_reason: "whitelisted".to_string(),
        }
    }

    /// Status measured against a concrete set of limits.
    pub fn measured(
        ip: impl Into<String>,
        now: DateTime<Utc>,
        limits: &Limits,
        uploads_used: u64,
        bytes_used: u64,
    ) -> Self {
        let end = window_end(now, limits.window);
        Self {
            ip: ip.into(),
            uploads_used,
            uploads_limit: clamp_limit(limits.uploads),
            bytes_used,
            bytes_limit: clamp_limit(limits.bytes),
            window_start: window_start(now, limits.window),
            window_end: end,
            reset_time: end,
            is_limited: false,
            limit_reason: String::new(),
        }
    }

    pub fn limited(mut self, reason: LimitType) -> Self {
        self.is_limited = true;
        self.limit_reason = reason.as_str().to_string();
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.uploads_limit == UNLIMITED
    }

    /// Uploads left in the window, or `-1` when unlimited.
    pub fn remaining_uploads(&self) -> i64 {
        remaining(self.uploads_limit, self.uploads_used)
    }

    /// Bytes left in the window, or `-1` when unlimited.
    pub fn remaining_bytes(&self) -> i64 {
        remaining(self.bytes_limit, self.bytes_used)
    }
}

fn clamp_limit(limit: u64) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn remaining(limit: i64, used: u64) -> i64 {
    if limit == UNLIMITED {
        return UNLIMITED;
    }
    let used = i64::try_from(used).unwrap_or(i64::MAX);
    limit.saturating_sub(used).max(0)
}

/// Typed rejection describing why an upload was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitError {
    pub ip: String,
    pub limit_type: LimitType,
    pub message: String,
    pub retry_after: u64,
    pub current_usage: BTreeMap<String, i64>,
}

impl RateLimitError {
    pub fn new(
        ip: impl Into<String>,
        limit_type: LimitType,
        message: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        Self {
            ip: ip.into(),
            limit_type,
            message: message.into(),
            retry_after: retry_after.as_secs(),
            current_usage: BTreeMap::new(),
        }
    }

    /// Attach a usage figure for diagnostics.
    pub fn with_usage(mut self, key: &str, value: u64) -> Self {
        self.current_usage
            .insert(key.to_string(), i64::try_from(value).unwrap_or(i64::MAX));
        self
    }
}

impl fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate limit exceeded for {}: {}", self.ip, self.message)
    }
}

/// Outcome of an atomic check-and-increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomicOutcome {
    pub allowed: bool,
    pub upload_count: u64,
    pub bytes_used: u64,
    pub reason: AtomicReason,
}

/// Reason reported by the atomic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicReason {
    Ok,
    UploadLimit,
    BytesLimit,
}

impl AtomicReason {
    pub fn parse(reason: &str) -> Option<Self> {
        match reason {
            "ok" => Some(Self::Ok),
            "upload_limit" => Some(Self::UploadLimit),
            "bytes_limit" => Some(Self::BytesLimit),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_unlimited_status() {
        let status = LimitStatus::unlimited("10.0.0.1", now(), Duration::from_secs(60));

        assert!(!status.is_limited);
        assert!(status.is_unlimited());
        assert_eq!(status.remaining_uploads(), UNLIMITED);
        assert_eq!(status.remaining_bytes(), UNLIMITED);
        assert_eq!(status.limit_reason, "whitelisted");
    }

    #[test]
    fn test_remaining_clamps_at_zero() {
        let limits = Limits {
            uploads: 5,
            bytes: 100,
            window: Duration::from_secs(3600),
        };
        let status = LimitStatus::measured("1.2.3.4", now(), &limits, 7, 150);

        assert_eq!(status.remaining_uploads(), 0);
        assert_eq!(status.remaining_bytes(), 0);
    }

    #[test]
    fn test_measured_window_bounds() {
        let limits = Limits {
            uploads: 5,
            bytes: 100,
            window: Duration::from_secs(600),
        };
        let status = LimitStatus::measured("1.2.3.4", now(), &limits, 1, 10);

        assert_eq!((now() - status.window_start).num_seconds(), 600);
        assert_eq!(status.window_end, status.reset_time);
        assert_eq!(status.remaining_uploads(), 4);
    }

    #[test]
    fn test_limit_type_serializes_snake_case() {
        let json = serde_json::to_string(&LimitType::UploadCount).unwrap();
        assert_eq!(json, "\"upload_count\"");
        assert_eq!(LimitType::BytesLimit.to_string(), "bytes_limit");
    }

    #[test]
    fn test_status_omits_empty_reason() {
        let limits = Limits {
            uploads: 5,
            bytes: 100,
            window: Duration::from_secs(60),
        };
        let value =
            serde_json::to_value(LimitStatus::measured("1.2.3.4", now(), &limits, 0, 0)).unwrap();
        assert!(value.get("limit_reason").is_none());
        assert_eq!(value["uploads_limit"], 5);
    }

    #[test]
    fn test_atomic_reason_parse() {
        assert_eq!(AtomicReason::parse("ok"), Some(AtomicReason::Ok));
        assert_eq!(
            AtomicReason::parse("upload_limit"),
            Some(AtomicReason::UploadLimit)
        );
        assert_eq!(AtomicReason::parse("nope"), None);
    }
}

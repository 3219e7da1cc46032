//! Admission-control configuration.
//!
//! Built by [`crate::config::Config::from_env`] and passed explicitly into
//! the resolver, store and limiter constructors.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use super::error::{AdmissionError, AdmissionResult};
use super::types::{EndpointConfig, Limits};
use super::{BYTES_WINDOW, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_ENTRIES};

/// Forwarding headers consulted when no list is configured.
pub const DEFAULT_IP_HEADERS: [&str; 3] = ["CF-Connecting-IP", "X-Real-IP", "X-Forwarded-For"];

/// Proxies trusted when no list is configured: loopback and private ranges.
pub const DEFAULT_TRUSTED_PROXIES: [&str; 5] = [
    "127.0.0.1",
    "::1",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
];

/// Which counting store backs the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Memory,
    Redis,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Redis => "redis",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = AdmissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(StoreKind::Memory),
            "redis" => Ok(StoreKind::Redis),
            other => Err(AdmissionError::InvalidConfiguration(format!(
                "unknown rate limit store '{other}' (expected 'memory' or 'redis')"
            ))),
        }
    }
}

/// Connection parameters for the Redis store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
    pub password: Option<String>,
    pub db: i64,
    pub timeout: Duration,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            password: None,
            db: 0,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Mount the admission middleware on upload routes.
    pub enabled: bool,
    pub store: StoreKind,

    // =========================================================================
    // Global limits
    // =========================================================================
    /// Uploads allowed per window (the historical name is kept for the env var).
    pub uploads_per_minute: u64,
    pub bytes_per_hour: u64,
    pub window_minutes: u64,

    // =========================================================================
    // Identity resolution
    // =========================================================================
    /// IPs or CIDR ranges whose forwarding headers are honoured.
    pub trusted_proxies: Vec<String>,
    /// Forwarding headers in priority order.
    pub ip_headers: Vec<String>,
    /// IPs or CIDR ranges exempt from all limits.
    pub whitelist: Vec<String>,

    /// Overrides keyed by exact request path.
    pub endpoints: HashMap<String, EndpointConfig>,

    // =========================================================================
    // Store tuning
    // =========================================================================
    pub max_entries: usize,
    pub cleanup_interval: Duration,
    pub redis: RedisSettings,
}

impl RateLimitConfig {
    /// Check limits and store selection.
    ///
    /// Address lists are validated when the resolver is built, so a bad
    /// entry surfaces as `InvalidConfiguration` from [`super::RateLimiter::new`].
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidConfiguration` for non-positive limits.
    pub fn validate(&self) -> AdmissionResult<()> {
        if self.uploads_per_minute == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "RATE_LIMIT_UPLOADS_PER_MINUTE must be greater than 0".to_string(),
            ));
        }
        if self.bytes_per_hour == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "RATE_LIMIT_BYTES_PER_HOUR must be greater than 0".to_string(),
            ));
        }
        if self.window_minutes == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "RATE_LIMIT_WINDOW_MINUTES must be greater than 0".to_string(),
            ));
        }
        if self.store == StoreKind::Memory && self.max_entries == 0 {
            return Err(AdmissionError::InvalidConfiguration(
                "RATE_LIMIT_MAX_ENTRIES must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(AdmissionError::InvalidConfiguration(
                "cleanup interval must be greater than 0".to_string(),
            ));
        }

        for (path, endpoint) in &self.endpoints {
            if endpoint.uploads_per_minute == 0
                || endpoint.bytes_per_hour == 0
                || endpoint.window_minutes == 0
            {
                return Err(AdmissionError::InvalidConfiguration(format!(
                    "endpoint '{path}' limits must all be greater than 0"
                )));
            }
        }

        Ok(())
    }

    pub fn global_limits(&self) -> Limits {
        Limits {
            uploads: self.uploads_per_minute,
            bytes: self.bytes_per_hour,
            window: Duration::from_secs(self.window_minutes.saturating_mul(60)),
        }
    }

    /// The longest window any check can query.
    ///
    /// Commits keep records visible for at least this long so endpoint
    /// overrides with a longer window than the global one still see them.
    pub fn commit_window(&self) -> Duration {
        self.endpoints
            .values()
            .map(|e| e.limits().window)
            .chain([self.global_limits().window, BYTES_WINDOW])
            .max()
            .unwrap_or(BYTES_WINDOW)
    }

    /// Parse `/path:uploads:bytes:window_minutes,...` into endpoint overrides.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidConfiguration` for malformed entries.
    pub fn parse_endpoints(value: &str) -> AdmissionResult<HashMap<String, EndpointConfig>> {
        let mut endpoints = HashMap::new();

        for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [path, uploads, bytes, window] = parts.as_slice() else {
                return Err(AdmissionError::InvalidConfiguration(format!(
                    "custom endpoint '{entry}' must be /path:uploads:bytes:window_minutes"
                )));
            };

            if !path.starts_with('/') {
                return Err(AdmissionError::InvalidConfiguration(format!(
                    "custom endpoint path '{path}' must start with '/'"
                )));
            }

            let parse = |name: &str, value: &str| -> AdmissionResult<u64> {
                value.parse().map_err(|e| {
                    AdmissionError::InvalidConfiguration(format!(
                        "custom endpoint '{path}' has invalid {name} '{value}': {e}"
                    ))
                })
            };

            endpoints.insert(
                (*path).to_string(),
                EndpointConfig {
                    uploads_per_minute: parse("uploads", *uploads)?,
                    bytes_per_hour: parse("bytes", *bytes)?,
                    window_minutes: parse("window", *window)?,
                },
            );
        }

        Ok(endpoints)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreKind::Memory,
            uploads_per_minute: 5,
            bytes_per_hour: 100 * 1024 * 1024,
            window_minutes: 60,
            trusted_proxies: DEFAULT_TRUSTED_PROXIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ip_headers: DEFAULT_IP_HEADERS.iter().map(|s| s.to_string()).collect(),
            whitelist: vec![],
            endpoints: HashMap::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            redis: RedisSettings::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RateLimitConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.global_limits().window, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = RateLimitConfig {
            uploads_per_minute: 0,
            ..RateLimitConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("RATE_LIMIT_UPLOADS_PER_MINUTE"));

        let config = RateLimitConfig {
            bytes_per_hour: 0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_kind_parse() {
        assert_eq!("memory".parse::<StoreKind>().unwrap(), StoreKind::Memory);
        assert_eq!(" Redis ".parse::<StoreKind>().unwrap(), StoreKind::Redis);
        assert!(matches!(
            "postgres".parse::<StoreKind>(),
            Err(AdmissionError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_parse_endpoints() {
        let endpoints =
            RateLimitConfig::parse_endpoints("/api/upload:10:1048576:30, /:2:2048:5").unwrap();

        assert_eq!(endpoints.len(), 2);
        let api = endpoints.get("/api/upload").unwrap();
        assert_eq!(api.uploads_per_minute, 10);
        assert_eq!(api.bytes_per_hour, 1_048_576);
        assert_eq!(api.window_minutes, 30);
        assert_eq!(endpoints.get("/").unwrap().window_minutes, 5);
    }

    #[test]
    fn test_parse_endpoints_empty() {
        assert!(RateLimitConfig::parse_endpoints("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_endpoints_malformed() {
        assert!(RateLimitConfig::parse_endpoints("/api:10:20").is_err());
        assert!(RateLimitConfig::parse_endpoints("api:1:2:3").is_err());
        assert!(RateLimitConfig::parse_endpoints("/api:ten:2:3").is_err());
    }

    #[test]
    fn test_zero_endpoint_limit_rejected() {
        let config = RateLimitConfig {
            endpoints: RateLimitConfig::parse_endpoints("/api/upload:0:100:5").unwrap(),
            ..RateLimitConfig::default()
        };
        assert!(config.validate().unwrap_err().to_string().contains("/api/upload"));
    }

    #[test]
    fn test_commit_window_covers_longest_window() {
        let config = RateLimitConfig {
            window_minutes: 10,
            endpoints: RateLimitConfig::parse_endpoints("/api/upload:1:100:180").unwrap(),
            ..RateLimitConfig::default()
        };
        assert_eq!(config.commit_window(), Duration::from_secs(180 * 60));

        let config = RateLimitConfig {
            window_minutes: 10,
            ..RateLimitConfig::default()
        };
        assert_eq!(config.commit_window(), BYTES_WINDOW);
    }
}

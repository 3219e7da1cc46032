//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with defaults
//! suitable for development. In production, configure via environment
//! variables or a `.env` file.
//!
//! # File Storage
//!
//! - `UPLOAD_DIR`: Directory holding uploaded files (default: `./uploads`)
//! - `MAX_FILE_SIZE`: Largest accepted upload in bytes (default: 100 MiB)
//! - `FILE_EXPIRY_HOURS`: Lifetime of an uploaded file (default: 1)
//!
//! # Upload Admission
//!
//! - `ENABLE_RATE_LIMIT`: Mount the admission middleware (default: true)
//! - `RATE_LIMIT_STORE`: `memory` or `redis` (default: memory)
//! - `RATE_LIMIT_UPLOADS_PER_MINUTE` / `RATE_LIMIT_BYTES_PER_HOUR` /
//!   `RATE_LIMIT_WINDOW_MINUTES`: global limits
//! - `RATE_LIMIT_CUSTOM_ENDPOINTS`: `/path:uploads:bytes:window,...`

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::ratelimit::{
    IdentityConfig, IdentityResolver, RateLimitConfig, RedisSettings, StoreKind,
    config::{DEFAULT_IP_HEADERS, DEFAULT_TRUSTED_PROXIES},
};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Base URL used to build download links
    /// Default: `http://localhost:{PORT}`
    pub public_url: String,

    // =========================================================================
    // File Storage Configuration
    // =========================================================================
    pub upload_dir: PathBuf,

    /// Maximum upload size in bytes, enforced while streaming
    pub max_file_size: u64,

    pub file_expiry: Duration,

    /// Interval between expired-file purges (default: 300 seconds)
    pub cleanup_interval: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// Comma-separated list of allowed CORS origins
    /// Use "*" to allow all origins
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Upload Admission
    // =========================================================================
    pub rate_limit: RateLimitConfig,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// resulting configuration is invalid (non-positive limits, malformed
    /// proxy or whitelist entries, unknown store kind).
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let port = Self::parse_env("PORT", 3000)?;
        let public_url = env::var("PUBLIC_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("http://localhost:{port}"));

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            public_url: public_url.trim_end_matches('/').to_string(),

            // Files
            upload_dir: PathBuf::from(
                env::var("UPLOAD_DIR").unwrap_or_else(|_| "./uploads".to_string()),
            ),
            max_file_size: Self::parse_env("MAX_FILE_SIZE", 100 * 1024 * 1024)?,
            file_expiry: Duration::from_secs(
                Self::parse_env::<u64>("FILE_EXPIRY_HOURS", 1)?.saturating_mul(3600),
            ),
            cleanup_interval: Duration::from_secs(Self::parse_env(
                "CLEANUP_INTERVAL_SECONDS",
                300,
            )?),

            // Security
            cors_allowed_origins: Self::parse_list("CORS_ALLOWED_ORIGINS", &["*"]),

            // Admission
            rate_limit: Self::rate_limit_from_env()?,

            // Observability
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    fn rate_limit_from_env() -> AppResult<RateLimitConfig> {
        let store: StoreKind = env::var("RATE_LIMIT_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .parse()
            .map_err(|e| AppError::ConfigError(format!("Invalid RATE_LIMIT_STORE: {e}")))?;

        let endpoints = RateLimitConfig::parse_endpoints(
            &env::var("RATE_LIMIT_CUSTOM_ENDPOINTS").unwrap_or_default(),
        )
        .map_err(|e| AppError::ConfigError(e.to_string()))?;

        Ok(RateLimitConfig {
            enabled: Self::parse_env("ENABLE_RATE_LIMIT", true)?,
            store,
            uploads_per_minute: Self::parse_env("RATE_LIMIT_UPLOADS_PER_MINUTE", 5)?,
            bytes_per_hour: Self::parse_env("RATE_LIMIT_BYTES_PER_HOUR", 100 * 1024 * 1024)?,
            window_minutes: Self::parse_env("RATE_LIMIT_WINDOW_MINUTES", 60)?,
            trusted_proxies: Self::parse_list(
                "RATE_LIMIT_TRUSTED_PROXIES",
                &DEFAULT_TRUSTED_PROXIES,
            ),
            ip_headers: Self::parse_list("RATE_LIMIT_IP_HEADERS", &DEFAULT_IP_HEADERS),
            whitelist: Self::parse_list("RATE_LIMIT_WHITELIST_IPS", &[]),
            endpoints,
            max_entries: Self::parse_env("RATE_LIMIT_MAX_ENTRIES", 10_000)?,
            cleanup_interval: Duration::from_secs(
                Self::parse_env::<u64>("RATE_LIMIT_CLEANUP_MINUTES", 5)?.saturating_mul(60),
            ),
            redis: RedisSettings {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                password: env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
                db: Self::parse_env("REDIS_DB", 0)?,
                timeout: Duration::from_secs(Self::parse_env("REDIS_TIMEOUT_SECONDS", 5)?),
            },
        })
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.max_file_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_FILE_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.file_expiry.is_zero() {
            return Err(AppError::ConfigError(
                "FILE_EXPIRY_HOURS must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(AppError::ConfigError(
                "CLEANUP_INTERVAL_SECONDS must be greater than 0".to_string(),
            ));
        }

        if self.upload_dir.as_os_str().is_empty() {
            return Err(AppError::ConfigError(
                "UPLOAD_DIR must not be empty".to_string(),
            ));
        }

        if self.rate_limit.enabled {
            self.rate_limit
                .validate()
                .map_err(|e| AppError::ConfigError(e.to_string()))?;
            // Surfaces bad proxy, whitelist and header entries at startup.
            IdentityResolver::new(&IdentityConfig::from(&self.rate_limit))
                .map_err(|e| AppError::ConfigError(e.to_string()))?;
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        if self.metrics_enabled() {
            Some(SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
        } else {
            None
        }
    }

    /// Download link for a stored file.
    pub fn download_url(&self, filename: &str) -> String {
        format!("{}/{filename}", self.public_url)
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse a comma-separated list.
    ///
    /// An unset variable yields `default`; a set but empty one yields an
    /// empty list, so defaults such as the trusted proxies can be cleared.
    fn parse_list(name: &str, default: &[&str]) -> Vec<String> {
        match env::var(name) {
            Ok(val) => split_list(&val),
            Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            public_url: "http://localhost:3000".to_string(),
            upload_dir: PathBuf::from("./uploads"),
            max_file_size: 100 * 1024 * 1024,
            file_expiry: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
            cors_allowed_origins: vec!["*".to_string()],
            rate_limit: RateLimitConfig::default(),
            metrics_port: 9090,
        }
    }
}

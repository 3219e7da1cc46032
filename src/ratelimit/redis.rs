//! Redis-backed counting store shared by every server process.
//!
//! # Key layout
//!
//! ```text
//! ratelimit:uploads:{identity}   ZSET  score = unix ms, member = "{ms}-{uuid}"
//! ratelimit:bytes:{identity}     ZSET  score = unix ms, member = "{uuid}:{size}"
//! ```
//!
//! A bytes member may carry a negative size: [`Store::adjust_bytes`] appends
//! a correction entry instead of rewriting the reserved one. Byte sums are
//! clamped at zero.
//!
//! Every member carries a fresh UUID so two uploads of the same size in the
//! same millisecond stay distinct. Both keys expire `window + 1h` after the
//! last write, so abandoned identities disappear even if cleanup never runs.
//!
//! # Atomic admission
//!
//! [`AtomicStore::atomic_check_and_increment`] runs a Lua script: the server
//! prunes, counts, checks both limits and appends in a single step, so
//! concurrent callers sharing the store can never overshoot a limit.
//!
//! # Failure handling
//!
//! Every round trip is bounded by the configured timeout. Timeouts and
//! protocol errors surface as `BackendOperation`, refused or dropped
//! connections as `BackendConnection`; nothing here panics or silently
//! allows a request.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{IntoConnectionInfo, RedisResult, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{RedisSettings, StoreKind};
use super::error::{AdmissionError, AdmissionResult};
use super::store::{AtomicStore, Store};
use super::types::{AtomicOutcome, AtomicReason};
use super::{BYTES_WINDOW, CLEANUP_RETENTION, DEFAULT_CLEANUP_INTERVAL, MIN_SWEEP_INTERVAL};
use crate::clock::{SharedClock, window_start};

const UPLOADS_PREFIX: &str = "ratelimit:uploads:";
const BYTES_PREFIX: &str = "ratelimit:bytes:";
const KEY_GRACE: Duration = Duration::from_secs(60 * 60);
const SCAN_BATCH: usize = 200;

/// Prune, count, check, append. Returns `{allowed, count, bytes, reason}`.
///
/// KEYS: uploads key, bytes key.
/// ARGV: now, window cutoff, bytes cutoff, retention cutoff, upload limit,
/// bytes limit, size, upload member, bytes member, key ttl seconds.
const CHECK_AND_INCREMENT_LUA: &str = r#"
local uploads_key = KEYS[1]
local bytes_key = KEYS[2]
local now = tonumber(ARGV[1])
local window_cutoff = tonumber(ARGV[2])
local bytes_cutoff = tonumber(ARGV[3])
local upload_limit = tonumber(ARGV[5])
local bytes_limit = tonumber(ARGV[6])
local size = tonumber(ARGV[7])
local ttl = tonumber(ARGV[10])

redis.call('ZREMRANGEBYSCORE', uploads_key, '-inf', '(' .. ARGV[4])
redis.call('ZREMRANGEBYSCORE', bytes_key, '-inf', '(' .. ARGV[4])

local count = redis.call('ZCOUNT', uploads_key, window_cutoff, '+inf')
local bytes = 0
local members = redis.call('ZRANGEBYSCORE', bytes_key, bytes_cutoff, '+inf')
for _, member in ipairs(members) do
  local n = tonumber(string.match(member, ':(%-?%d+)$'))
  if n then
    bytes = bytes + n
  end
end
if bytes < 0 then
  bytes = 0
end

if count >= upload_limit then
  return {0, count, bytes, 'upload_limit'}
end
if bytes + size > bytes_limit then
  return {0, count, bytes, 'bytes_limit'}
end

redis.call('ZADD', uploads_key, now, ARGV[8])
redis.call('ZADD', bytes_key, now, ARGV[9])
redis.call('EXPIRE', uploads_key, ttl)
redis.call('EXPIRE', bytes_key, ttl)

return {1, count + 1, bytes + size, 'ok'}
"#;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub settings: RedisSettings,
    /// Longest window the limiter queries; records stay at least this long.
    pub max_window: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            settings: RedisSettings::default(),
            max_window: BYTES_WINDOW,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

struct RedisInner {
    conn: MultiplexedConnection,
    script: Script,
    op_timeout: Duration,
    max_window: Duration,
    clock: SharedClock,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisInner")
            .field("op_timeout", &self.op_timeout)
            .field("max_window", &self.max_window)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RedisInner {
    fn ensure_open(&self) -> AdmissionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::StoreClosed);
        }
        Ok(())
    }

    /// Run one Redis round trip under the operation timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> AdmissionResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        self.ensure_open()?;

        match timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(operation = op, error = %e, "Redis operation failed");
                Err(e.into())
            }
            Err(_) => Err(AdmissionError::BackendOperation(format!(
                "{op} timed out after {:?}",
                self.op_timeout
            ))),
        }
    }

    async fn ping(&self) -> AdmissionResult<()> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .run("PING", async move {
                ::redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;

        if reply != "PONG" {
            return Err(AdmissionError::BackendOperation(format!(
                "unexpected PING reply '{reply}'"
            )));
        }
        Ok(())
    }

    /// Trim every rate-limit key matching `pattern` to the retention horizon.
    async fn trim_matching(&self, pattern: &str, cutoff_ms: i64) -> AdmissionResult<u64> {
        let mut cursor: u64 = 0;
        let mut removed = 0u64;

        loop {
            let mut conn = self.conn.clone();
            let (next, keys): (u64, Vec<String>) = self
                .run("SCAN", async move {
                    ::redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            for key in keys {
                let mut conn = self.conn.clone();
                let n: u64 = self
                    .run("ZREMRANGEBYSCORE", async move {
                        ::redis::cmd("ZREMRANGEBYSCORE")
                            .arg(&key)
                            .arg("-inf")
                            .arg(format!("({cutoff_ms}"))
                            .query_async(&mut conn)
                            .await
                    })
                    .await?;
                removed += n;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }

    /// Window used for pruning and key expiry.
    fn retention_for(&self, window: Duration) -> Duration {
        window.max(self.max_window)
    }

    fn key_ttl_secs(&self, window: Duration) -> u64 {
        self.retention_for(window).saturating_add(KEY_GRACE).as_secs()
    }
}

/// Counting store backed by Redis sorted sets.
#[derive(Debug)]
pub struct RedisStore {
    inner: Arc<RedisInner>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl RedisStore {
    /// Connect, verify the server answers `PING`, and start the cleanup task.
    ///
    /// # Errors
    ///
    /// Returns `AdmissionError::InvalidConfiguration` for a malformed URL and
    /// `AdmissionError::BackendConnection` if the server cannot be reached.
    pub async fn connect(config: RedisStoreConfig, clock: SharedClock) -> AdmissionResult<Self> {
        let settings = &config.settings;

        let mut info = settings
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| AdmissionError::InvalidConfiguration(format!("REDIS_URL: {e}")))?;
        info.redis.db = settings.db;
        if let Some(password) = settings.password.as_ref().filter(|p| !p.is_empty()) {
            info.redis.password = Some(password.clone());
        }

        let client = ::redis::Client::open(info)
            .map_err(|e| AdmissionError::BackendConnection(e.to_string()))?;

        let conn = timeout(settings.timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                AdmissionError::BackendConnection(format!(
                    "timed out after {:?} connecting to Redis",
                    settings.timeout
                ))
            })?
            .map_err(|e| AdmissionError::BackendConnection(e.to_string()))?;

        let inner = Arc::new(RedisInner {
            conn,
            script: Script::new(CHECK_AND_INCREMENT_LUA),
            op_timeout: settings.timeout,
            max_window: config.max_window,
            clock,
            closed: AtomicBool::new(false),
        });

        inner.ping().await.map_err(|e| match e {
            AdmissionError::BackendOperation(msg) => AdmissionError::BackendConnection(msg),
            other => other,
        })?;

        let store = Self {
            inner,
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };
        store.spawn_cleanup_task(config.cleanup_interval);

        info!(db = settings.db, "Redis rate limit store connected");
        Ok(store)
    }

    fn spawn_cleanup_task(&self, every: Duration) {
        let inner = self.inner.clone();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(every.max(MIN_SWEEP_INTERVAL));
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Redis cleanup task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        match cleanup_impl(&inner).await {
                            Ok(removed) => debug!(removed, "Redis cleanup sweep finished"),
                            Err(e) => warn!(error = %e, "Redis cleanup sweep failed"),
                        }
                    }
                }
            }

            debug!("Redis cleanup task shutting down");
        });
    }
}

pub(crate) fn uploads_key(identity: &str) -> String {
    format!("{UPLOADS_PREFIX}{identity}")
}

pub(crate) fn bytes_key(identity: &str) -> String {
    format!("{BYTES_PREFIX}{identity}")
}

fn upload_member(now_ms: i64, id: &Uuid) -> String {
    format!("{now_ms}-{id}")
}

fn bytes_member(id: &Uuid, size: impl std::fmt::Display) -> String {
    format!("{id}:{size}")
}

/// Size encoded in a bytes-set member; corrections are negative.
fn member_size(member: &str) -> Option<i64> {
    member.rsplit_once(':').and_then(|(_, size)| size.parse().ok())
}

fn cutoff_ms(now: DateTime<Utc>, window: Duration) -> i64 {
    window_start(now, window).timestamp_millis()
}

async fn cleanup_impl(inner: &RedisInner) -> AdmissionResult<u64> {
    let cutoff = cutoff_ms(inner.clock.now(), CLEANUP_RETENTION);
    let uploads = inner
        .trim_matching(&format!("{UPLOADS_PREFIX}*"), cutoff)
        .await?;
    let bytes = inner
        .trim_matching(&format!("{BYTES_PREFIX}*"), cutoff)
        .await?;
    Ok(uploads + bytes)
}

#[async_trait]
impl Store for RedisStore {
    async fn get_upload_count(&self, identity: &str, window: Duration) -> AdmissionResult<u64> {
        let key = uploads_key(identity);
        let min = cutoff_ms(self.inner.clock.now(), window);
        let mut conn = self.inner.conn.clone();

        self.inner
            .run("ZCOUNT", async move {
                ::redis::cmd("ZCOUNT")
                    .arg(&key)
                    .arg(min)
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await
            })
            .await
    }

    async fn get_bytes_used(&self, identity: &str, window: Duration) -> AdmissionResult<u64> {
        let key = bytes_key(identity);
        let min = cutoff_ms(self.inner.clock.now(), window);
        let mut conn = self.inner.conn.clone();

        let members: Vec<String> = self
            .inner
            .run("ZRANGEBYSCORE", async move {
                ::redis::cmd("ZRANGEBYSCORE")
                    .arg(&key)
                    .arg(min)
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let total = members
            .iter()
            .filter_map(|m| member_size(m))
            .fold(0i64, i64::saturating_add);

        Ok(u64::try_from(total).unwrap_or(0))
    }

    async fn increment_upload(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
    ) -> AdmissionResult<()> {
        let now = self.inner.clock.now();
        let now_ms = now.timestamp_millis();
        let prune_before = format!("({}", cutoff_ms(now, self.inner.retention_for(window)));
        let ttl = self.inner.key_ttl_secs(window);
        let id = Uuid::new_v4();
        let ukey = uploads_key(identity);
        let bkey = bytes_key(identity);
        let mut conn = self.inner.conn.clone();

        self.inner
            .run("ZADD", async move {
                ::redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(&ukey)
                    .arg("-inf")
                    .arg(&prune_before)
                    .ignore()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(&bkey)
                    .arg("-inf")
                    .arg(&prune_before)
                    .ignore()
                    .cmd("ZADD")
                    .arg(&ukey)
                    .arg(now_ms)
                    .arg(upload_member(now_ms, &id))
                    .ignore()
                    .cmd("ZADD")
                    .arg(&bkey)
                    .arg(now_ms)
                    .arg(bytes_member(&id, size))
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&ukey)
                    .arg(ttl)
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&bkey)
                    .arg(ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await
    }

    async fn adjust_bytes(
        &self,
        identity: &str,
        delta: i64,
        window: Duration,
    ) -> AdmissionResult<()> {
        let now_ms = self.inner.clock.now().timestamp_millis();
        let ttl = self.inner.key_ttl_secs(window);
        let member = bytes_member(&Uuid::new_v4(), delta);
        let key = bytes_key(identity);
        let mut conn = self.inner.conn.clone();

        self.inner
            .run("ZADD", async move {
                ::redis::pipe()
                    .atomic()
                    .cmd("ZADD")
                    .arg(&key)
                    .arg(now_ms)
                    .arg(member)
                    .ignore()
                    .cmd("EXPIRE")
                    .arg(&key)
                    .arg(ttl)
                    .ignore()
                    .query_async(&mut conn)
                    .await
            })
            .await
    }

    async fn cleanup(&self) -> AdmissionResult<u64> {
        cleanup_impl(&self.inner).await
    }

    async fn health_check(&self) -> AdmissionResult<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> AdmissionResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("Redis rate limit store closed");
        Ok(())
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Redis
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn atomic_check_and_increment(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
        upload_limit: u64,
        bytes_limit: u64,
    ) -> AdmissionResult<AtomicOutcome> {
        let now = self.inner.clock.now();
        let now_ms = now.timestamp_millis();
        let id = Uuid::new_v4();

        let mut invocation = self.inner.script.prepare_invoke();
        invocation
            .key(uploads_key(identity))
            .key(bytes_key(identity))
            .arg(now_ms)
            .arg(cutoff_ms(now, window))
            .arg(cutoff_ms(now, BYTES_WINDOW))
            .arg(cutoff_ms(now, self.inner.retention_for(window)))
            .arg(upload_limit)
            .arg(bytes_limit)
            .arg(size)
            .arg(upload_member(now_ms, &id))
            .arg(bytes_member(&id, size))
            .arg(self.inner.key_ttl_secs(window));

        let mut conn = self.inner.conn.clone();
        let (allowed, upload_count, bytes_used, reason): (i64, u64, u64, String) = self
            .inner
            .run("EVALSHA", async move { invocation.invoke_async(&mut conn).await })
            .await?;

        let reason = AtomicReason::parse(&reason).ok_or_else(|| {
            AdmissionError::BackendOperation(format!("unexpected script reason '{reason}'"))
        })?;

        Ok(AtomicOutcome {
            allowed: allowed == 1,
            upload_count,
            bytes_used,
            reason,
        })
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(uploads_key("203.0.113.1"), "ratelimit:uploads:203.0.113.1");
        assert_eq!(bytes_key("2001:db8::1"), "ratelimit:bytes:2001:db8::1");
    }

    #[test]
    fn test_bytes_member_roundtrip() {
        let id = Uuid::new_v4();
        assert_eq!(member_size(&bytes_member(&id, 1_048_576u64)), Some(1_048_576));
        assert_eq!(member_size(&bytes_member(&id, -512i64)), Some(-512));
        assert_eq!(member_size("garbage"), None);
    }

    #[test]
    fn test_members_unique_for_equal_sizes() {
        let a = bytes_member(&Uuid::new_v4(), 10u64);
        let b = bytes_member(&Uuid::new_v4(), 10u64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_cutoff_ms() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(
            cutoff_ms(now, Duration::from_secs(60)),
            1_700_000_000_000 - 60_000
        );
    }

    #[test]
    fn test_script_checks_uploads_before_bytes() {
        let upload_check = CHECK_AND_INCREMENT_LUA.find("'upload_limit'").unwrap();
        let bytes_check = CHECK_AND_INCREMENT_LUA.find("'bytes_limit'").unwrap();
        let first_write = CHECK_AND_INCREMENT_LUA.find("'ZADD'").unwrap();
        assert!(upload_check < bytes_check);
        assert!(bytes_check < first_write);
    }
}

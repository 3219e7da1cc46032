//! In-process counting store.
//!
//! A single table maps identity to its upload records behind one
//! reader/writer lock, so windowed reads see a consistent snapshot relative
//! to concurrent increments. A background task owned by the store sweeps
//! records older than [`CLEANUP_RETENTION`]; it is cancelled and awaited by
//! [`Store::close`] and cancelled when the store is dropped.
//!
//! # Capacity
//!
//! At most `max_entries` distinct identities are tracked. When a new
//! identity arrives at capacity, identities with no record inside the
//! commit window are evicted first; if that frees nothing the increment
//! fails with `StoreCapacityExceeded`. Identities already tracked can
//! always record more uploads.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::config::StoreKind;
use super::error::{AdmissionError, AdmissionResult};
use super::store::Store;
use super::types::UploadRecord;
use super::{CLEANUP_RETENTION, DEFAULT_CLEANUP_INTERVAL, DEFAULT_MAX_ENTRIES, MIN_SWEEP_INTERVAL};
use crate::clock::{SharedClock, window_start};

#[derive(Debug, Clone, Copy)]
pub struct MemoryStoreConfig {
    pub max_entries: usize,
    pub cleanup_interval: Duration,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

type RecordTable = HashMap<String, Vec<UploadRecord>>;

#[derive(Debug)]
struct MemoryInner {
    records: RwLock<RecordTable>,
    max_entries: usize,
    clock: SharedClock,
    closed: AtomicBool,
}

impl MemoryInner {
    fn ensure_open(&self) -> AdmissionResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AdmissionError::StoreClosed);
        }
        Ok(())
    }

    async fn sweep(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut records = self.records.write().await;
        prune_table(&mut records, cutoff)
    }
}

/// Counting store held in process memory.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl MemoryStore {
    /// Create the store and start its cleanup task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: MemoryStoreConfig, clock: SharedClock) -> Self {
        let store = Self {
            inner: Arc::new(MemoryInner {
                records: RwLock::new(HashMap::new()),
                max_entries: config.max_entries.max(1),
                clock,
                closed: AtomicBool::new(false),
            }),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        store.spawn_cleanup_task(config.cleanup_interval);
        info!(
            max_entries = store.inner.max_entries,
            cleanup_interval_secs = config.cleanup_interval.as_secs(),
            "In-memory rate limit store started"
        );

        store
    }

    /// Number of identities currently tracked.
    pub async fn tracked_identities(&self) -> usize {
        self.inner.records.read().await.len()
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
                        debug!("Memory store cleanup task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let cutoff = window_start(inner.clock.now(), CLEANUP_RETENTION);
                        let removed = inner.sweep(cutoff).await;
                        debug!(removed, "Memory store cleanup sweep finished");
                    }
                }
            }

            debug!("Memory store cleanup task shutting down");
        });
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_upload_count(&self, identity: &str, window: Duration) -> AdmissionResult<u64> {
        self.inner.ensure_open()?;
        let cutoff = window_start(self.inner.clock.now(), window);

        let records = self.inner.records.read().await;
        let count = records
            .get(identity)
            .map(|list| list.iter().filter(|r| r.is_within(cutoff)).count())
            .unwrap_or(0);

        Ok(count as u64)
    }

    async fn get_bytes_used(&self, identity: &str, window: Duration) -> AdmissionResult<u64> {
        self.inner.ensure_open()?;
        let cutoff = window_start(self.inner.clock.now(), window);

        let records = self.inner.records.read().await;
        let total = records
            .get(identity)
            .map(|list| {
                list.iter()
                    .filter(|r| r.is_within(cutoff))
                    .fold(0u64, |acc, r| acc.saturating_add(r.size))
            })
            .unwrap_or(0);

        Ok(total)
    }

    async fn increment_upload(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
    ) -> AdmissionResult<()> {
        self.inner.ensure_open()?;
        let now = self.inner.clock.now();
        let cutoff = window_start(now, window);

        let mut records = self.inner.records.write().await;

        if !records.contains_key(identity) && records.len() >= self.inner.max_entries {
            let removed = prune_table(&mut records, cutoff);
            debug!(removed, "Memory store pruned expired records under capacity pressure");

            if records.len() >= self.inner.max_entries {
                warn!(
                    max_entries = self.inner.max_entries,
                    "Memory store at capacity, rejecting new identity"
                );
                return Err(AdmissionError::StoreCapacityExceeded);
            }
        }

        let list = records.entry(identity.to_string()).or_default();
        list.retain(|r| r.is_within(cutoff));
        list.push(UploadRecord::new(now, size));

        Ok(())
    }

    async fn adjust_bytes(
        &self,
        identity: &str,
        delta: i64,
        window: Duration,
    ) -> AdmissionResult<()> {
        self.inner.ensure_open()?;
        let cutoff = window_start(self.inner.clock.now(), window);

        let mut records = self.inner.records.write().await;
        // Only byte sums are queried, so the newest record absorbs the delta.
        let latest = records
            .get_mut(identity)
            .and_then(|list| list.iter_mut().rev().find(|r| r.is_within(cutoff)));

        match latest {
            Some(record) => record.size = record.size.saturating_add_signed(delta),
            None => debug!(identity, delta, "No record left to adjust"),
        }

        Ok(())
    }

    async fn cleanup(&self) -> AdmissionResult<u64> {
        self.inner.ensure_open()?;
        let cutoff = window_start(self.inner.clock.now(), CLEANUP_RETENTION);
        Ok(self.inner.sweep(cutoff).await)
    }

    async fn health_check(&self) -> AdmissionResult<()> {
        self.inner.ensure_open()
    }

    async fn close(&self) -> AdmissionResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        self.inner.records.write().await.clear();
        info!("In-memory rate limit store closed");
        Ok(())
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Drop records older than `cutoff` and forget identities left empty.
fn prune_table(records: &mut RecordTable, cutoff: DateTime<Utc>) -> u64 {
    let mut removed = 0u64;

    records.retain(|_, list| {
        let before = list.len();
        list.retain(|r| r.is_within(cutoff));
        removed += (before - list.len()) as u64;
        !list.is_empty()
    });

    removed
}

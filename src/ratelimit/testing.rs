//! Test doubles for the counting store.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::BYTES_WINDOW;
use super::config::StoreKind;
use super::error::AdmissionResult;
use super::memory::{MemoryStore, MemoryStoreConfig};
use super::store::{AtomicStore, Store};
use super::types::{AtomicOutcome, AtomicReason};
use crate::clock::SharedClock;

/// Check-and-increment serialized by a mutex, standing in for a server
/// that runs the whole operation as one step.
#[derive(Debug)]
pub(crate) struct SerializedAtomicStore {
    inner: MemoryStore,
    gate: Mutex<()>,
}

impl SerializedAtomicStore {
    pub(crate) fn new(clock: SharedClock) -> Self {
        Self {
            inner: MemoryStore::new(MemoryStoreConfig::default(), clock),
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Store for SerializedAtomicStore {
    async fn get_upload_count(&self, identity: &str, window: Duration) -> AdmissionResult<u64> {
        self.inner.get_upload_count(identity, window).await
    }
    async fn get_bytes_used(&self, identity: &str, window: Duration) -> AdmissionResult<u64> {
        self.inner.get_bytes_used(identity, window).await
    }
    async fn increment_upload(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
    ) -> AdmissionResult<()> {
        self.inner.increment_upload(identity, size, window).await
    }
    async fn adjust_bytes(
        &self,
        identity: &str,
        delta: i64,
        window: Duration,
    ) -> AdmissionResult<()> {
        let _guard = self.gate.lock().await;
        self.inner.adjust_bytes(identity, delta, window).await
    }
    async fn cleanup(&self) -> AdmissionResult<u64> {
        self.inner.cleanup().await
    }
    async fn health_check(&self) -> AdmissionResult<()> {
        self.inner.health_check().await
    }
    async fn close(&self) -> AdmissionResult<()> {
        self.inner.close().await
    }
    fn kind(&self) -> StoreKind {
        StoreKind::Redis
    }
}

#[async_trait]
impl AtomicStore for SerializedAtomicStore {
    async fn atomic_check_and_increment(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
        upload_limit: u64,
        bytes_limit: u64,
    ) -> AdmissionResult<AtomicOutcome> {
        let _guard = self.gate.lock().await;
        let count = self.inner.get_upload_count(identity, window).await?;
        let bytes = self.inner.get_bytes_used(identity, BYTES_WINDOW).await?;

        let refused = |reason| AtomicOutcome {
            allowed: false,
            upload_count: count,
            bytes_used: bytes,
            reason,
        };
        if count >= upload_limit {
            return Ok(refused(AtomicReason::UploadLimit));
        }
        if bytes + size > bytes_limit {
            return Ok(refused(AtomicReason::BytesLimit));
        }

        self.inner.increment_upload(identity, size, window).await?;
        Ok(AtomicOutcome {
            allowed: true,
            upload_count: count + 1,
            bytes_used: bytes + size,
            reason: AtomicReason::Ok,
        })
    }
}

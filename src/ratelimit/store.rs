//! Counting store abstraction.
//!
//! A store keeps timestamped upload records per identity and answers
//! windowed queries over them. Stores that can check and increment in one
//! indivisible step additionally implement [`AtomicStore`]; which kind a
//! limiter holds is decided once, when the [`StoreHandle`] is built.

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::config::StoreKind;
use super::error::AdmissionResult;
use super::types::AtomicOutcome;

#[async_trait]
pub trait Store: Send + Sync + Debug {
    /// Number of uploads by `identity` in the trailing `window`.
    async fn get_upload_count(&self, identity: &str, window: Duration) -> AdmissionResult<u64>;

    /// Total bytes uploaded by `identity` in the trailing `window`.
    async fn get_bytes_used(&self, identity: &str, window: Duration) -> AdmissionResult<u64>;

    /// Record one upload of `size` bytes.
    ///
    /// `window` is the longest window records must stay visible for; the
    /// store may drop this identity's records older than that.
    async fn increment_upload(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
    ) -> AdmissionResult<()>;

    /// Correct the bytes recorded for `identity` by `delta`.
    ///
    /// Settles an upload whose size was reserved from an estimate. Adds no
    /// upload to the count. `window` has the same meaning as for
    /// [`Store::increment_upload`].
    async fn adjust_bytes(&self, identity: &str, delta: i64, window: Duration)
    -> AdmissionResult<()>;

    /// Remove records older than the retention horizon. Returns how many
    /// records were removed.
    async fn cleanup(&self) -> AdmissionResult<u64>;

    async fn health_check(&self) -> AdmissionResult<()>;

    /// Release resources and stop background work. Later calls fail with
    /// `StoreClosed`.
    async fn close(&self) -> AdmissionResult<()>;

    fn kind(&self) -> StoreKind;
}

/// A store that can check limits and record an upload as one step.
#[async_trait]
pub trait AtomicStore: Store {
    /// Prune, count, and record the upload only if both limits hold.
    ///
    /// Upload count is checked before bytes, so `UploadLimit` wins when
    /// both would fail. A refused call writes nothing.
    async fn atomic_check_and_increment(
        &self,
        identity: &str,
        size: u64,
        window: Duration,
        upload_limit: u64,
        bytes_limit: u64,
    ) -> AdmissionResult<AtomicOutcome>;
}

/// A store together with the capability it was registered with.
#[derive(Clone)]
pub enum StoreHandle {
    Plain(Arc<dyn Store>),
    Atomic(Arc<dyn AtomicStore>),
}

impl StoreHandle {
    pub fn plain(store: impl Store + 'static) -> Self {
        StoreHandle::Plain(Arc::new(store))
    }

    pub fn atomic(store: impl AtomicStore + 'static) -> Self {
        StoreHandle::Atomic(Arc::new(store))
    }

    pub fn store(&self) -> &dyn Store {
        match self {
            StoreHandle::Plain(store) => store.as_ref(),
            StoreHandle::Atomic(store) => store.as_ref(),
        }
    }

    pub fn as_atomic(&self) -> Option<&dyn AtomicStore> {
        match self {
            StoreHandle::Plain(_) => None,
            StoreHandle::Atomic(store) => Some(store.as_ref()),
        }
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self, StoreHandle::Atomic(_))
    }
}

impl Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreHandle::Plain(store) => f.debug_tuple("Plain").field(store).finish(),
            StoreHandle::Atomic(store) => f.debug_tuple("Atomic").field(store).finish(),
        }
    }
}

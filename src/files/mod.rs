//! Temporary file storage: naming, streaming writes, expiry and purge.

pub mod naming;
pub mod storage;

pub use naming::StoredName;
pub use storage::{FileStore, OpenedFile, PendingFile, StoredFile};

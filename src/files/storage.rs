//! On-disk file storage.
//!
//! Uploads are streamed into `{name}.part` and renamed into place once
//! complete, so a download never observes a partial file. Stray `.part`
//! files left by aborted requests carry the same expiry and are removed by
//! [`FileStore::purge_expired`].

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::naming::StoredName;
use crate::clock::{SharedClock, window_end};
use crate::error::{AppError, AppResult};

const PART_SUFFIX: &str = ".part";

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    max_file_size: u64,
    expiry: Duration,
    clock: SharedClock,
}

/// A completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub filename: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
}

/// An upload in progress.
#[derive(Debug)]
pub struct PendingFile {
    file: File,
    name: StoredName,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
    max_file_size: u64,
}

/// An opened, unexpired file ready to stream.
#[derive(Debug)]
pub struct OpenedFile {
    pub file: File,
    pub size: u64,
    pub name: StoredName,
}

impl FileStore {
    /// Create the storage directory if needed.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be created.
    pub async fn create(
        root: impl Into<PathBuf>,
        max_file_size: u64,
        expiry: Duration,
        clock: SharedClock,
    ) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            max_file_size,
            expiry,
            clock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Start writing a new upload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the part file cannot be created.
    pub async fn begin(&self, original_name: &str) -> AppResult<PendingFile> {
        let expires_at = window_end(self.clock.now(), self.expiry);
        let name = StoredName::generate(original_name, expires_at);
        let filename = name.to_string();

        let final_path = self.root.join(&filename);
        let part_path = self.root.join(format!("{filename}{PART_SUFFIX}"));
        let file = File::create(&part_path).await?;

        Ok(PendingFile {
            file,
            name,
            part_path,
            final_path,
            written: 0,
            max_file_size: self.max_file_size,
        })
    }

    /// Open `filename` for download.
    ///
    /// Expired files are deleted on access.
    ///
    /// # Errors
    ///
    /// - `AppError::NotFound` for malformed, missing or expired names
    /// - `AppError::Storage` for other I/O failures
    pub async fn open(&self, filename: &str) -> AppResult<OpenedFile> {
        let not_found = || AppError::NotFound(format!("File '{filename}' not found"));
        let name = StoredName::parse(filename).ok_or_else(not_found)?;
        let path = self.root.join(filename);

        if name.is_expired(self.clock.now()) {
            if let Err(e) = fs::remove_file(&path).await
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!(filename, error = %e, "Failed to delete expired file");
            }
            return Err(not_found());
        }

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        Ok(OpenedFile { file, size, name })
    }

    /// Delete every expired file, including abandoned part files.
    ///
    /// Unrecognised files are left alone.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the directory cannot be listed.
    pub async fn purge_expired(&self) -> io::Result<u64> {
        let now = self.clock.now();
        let mut entries = fs::read_dir(&self.root).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };

            let stored = file_name.strip_suffix(PART_SUFFIX).unwrap_or(file_name);
            let Some(name) = StoredName::parse(stored) else {
                continue;
            };
            if !name.is_expired(now) {
                continue;
            }

            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(file = file_name, "Purged expired file");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = file_name, error = %e, "Failed to purge expired file"),
            }
        }

        Ok(removed)
    }
}

impl PendingFile {
    pub fn filename(&self) -> String {
        self.name.to_string()
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append a chunk.
    ///
    /// # Errors
    ///
    /// - `AppError::PayloadTooLarge` if the chunk would exceed the size limit;
    ///   nothing from that chunk is written
    /// - `AppError::Storage` on write failure
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> AppResult<()> {
        let len = u64::try_from(chunk.len()).unwrap_or(u64::MAX);
        let total = self.written.saturating_add(len);
        if total > self.max_file_size {
            return Err(AppError::PayloadTooLarge {
                max: self.max_file_size,
            });
        }

        self.file.write_all(chunk).await?;
        self.written = total;
        Ok(())
    }

    /// Flush and move the file into place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if flushing or renaming fails; the part
    /// file is removed in that case.
    pub async fn finish(mut self) -> AppResult<StoredFile> {
        let result = async {
            self.file.flush().await?;
            self.file.sync_all().await?;
            fs::rename(&self.part_path, &self.final_path).await
        }
        .await;

        if let Err(e) = result {
            remove_quietly(&self.part_path).await;
            return Err(e.into());
        }

        Ok(StoredFile {
            filename: self.name.to_string(),
            size: self.written,
            expires_at: self.name.expires_at,
        })
    }

    /// Abandon the upload and delete what was written.
    pub async fn discard(self) {
        drop(self.file);
        remove_quietly(&self.part_path).await;
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Failed to remove partial upload");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    async fn store(dir: &Path, max: u64) -> (FileStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = FileStore::create(dir, max, Duration::from_secs(3600), clock.clone())
            .await
            .unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn test_write_finish_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = store(dir.path(), 1024).await;

        let mut pending = store.begin("hello.TXT").await.unwrap();
        pending.write_chunk(b"hello ").await.unwrap();
        pending.write_chunk(b"world").await.unwrap();
        let stored = pending.finish().await.unwrap();

        assert_eq!(stored.size, 11);
        assert!(stored.filename.ends_with(".txt"));

        let mut opened = store.open(&stored.filename).await.unwrap();
        let mut content = String::new();
        opened.file.read_to_string(&mut content).await.unwrap();
        assert_eq!(content, "hello world");
        assert_eq!(opened.size, 11);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_rejected_and_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = store(dir.path(), 8).await;

        let mut pending = store.begin("big.bin").await.unwrap();
        pending.write_chunk(b"12345").await.unwrap();
        let err = pending.write_chunk(b"6789").await.unwrap_err();
        assert!(matches!(err, AppError::PayloadTooLarge { max: 8 }));
        assert_eq!(pending.written(), 5);

        pending.discard().await;
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_part_file_is_not_downloadable() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = store(dir.path(), 1024).await;

        let pending = store.begin("a.txt").await.unwrap();
        let filename = pending.filename();

        assert!(matches!(
            store.open(&filename).await,
            Err(AppError::NotFound(_))
        ));
        pending.discard().await;
    }

    #[tokio::test]
    async fn test_open_rejects_unknown_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _clock) = store(dir.path(), 1024).await;

        for name in ["missing.txt", "../etc/passwd", "..\\boot.ini"] {
            assert!(matches!(store.open(name).await, Err(AppError::NotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_expired_file_is_deleted_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store(dir.path(), 1024).await;

        let mut pending = store.begin("a.txt").await.unwrap();
        pending.write_chunk(b"x").await.unwrap();
        let stored = pending.finish().await.unwrap();

        clock.advance(Duration::from_secs(3601));
        assert!(matches!(
            store.open(&stored.filename).await,
            Err(AppError::NotFound(_))
        ));
        assert!(!dir.path().join(&stored.filename).exists());
    }

    #[tokio::test]
    async fn test_purge_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let (store, clock) = store(dir.path(), 1024).await;

        let old = store.begin("old.txt").await.unwrap().finish().await.unwrap();
        let abandoned = store.begin("abandoned.txt").await.unwrap();
        let abandoned_name = abandoned.filename();
        drop(abandoned);
        std::fs::write(dir.path().join("notes.md"), "keep").unwrap();

        clock.advance(Duration::from_secs(1800));
        let fresh = store.begin("fresh.txt").await.unwrap().finish().await.unwrap();

        clock.advance(Duration::from_secs(1801));
        assert_eq!(store.purge_expired().await.unwrap(), 2);

        assert!(!dir.path().join(&old.filename).exists());
        assert!(!dir.path().join(format!("{abandoned_name}.part")).exists());
        assert!(dir.path().join(&fresh.filename).exists());
        assert!(dir.path().join("notes.md").exists());
    }
}

//! Per-batch append-only NDJSON file on local disk (spec §4.3).
//!
//! Files live at `<base_dir>/batch_<id>.ndjson`, are owned by exactly one
//! batch, and are touched only by the worker holding that batch's row lock
//! (spec §5 "shared-resource policy"). Async, non-blocking I/O via
//! `tokio::fs`, matching the async-first file-handling convention used
//! throughout the corpus's storage/writer modules.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("free disk space {available} bytes is below the required minimum {required} bytes")]
    DiskFull { available: u64, required: u64 },

    #[error("upload file for batch {0} is empty")]
    Empty(i64),

    #[error("io error on batch {batch_id} file: {source}")]
    Io {
        batch_id: i64,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FileStoreError>;

fn io_err(batch_id: i64) -> impl FnOnce(std::io::Error) -> FileStoreError {
    move |source| FileStoreError::Io { batch_id, source }
}

#[derive(Debug, Clone)]
pub struct BatchFileStore {
    base_dir: PathBuf,
    min_free_space_bytes: u64,
}

impl BatchFileStore {
    pub fn new(base_dir: impl Into<PathBuf>, min_free_space_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            min_free_space_bytes,
        }
    }

    pub fn path_for(&self, batch_id: i64) -> PathBuf {
        self.base_dir.join(format!("batch_{batch_id}.ndjson"))
    }

    /// Idempotent and truncating, so retrying a crashed upload always
    /// starts from a deterministic, empty state (spec §4.3).
    #[tracing::instrument(skip(self))]
    pub async fn create(&self, batch_id: i64) -> Result<()> {
        self.ensure_free_space(batch_id).await?;
        fs::create_dir_all(&self.base_dir).await.map_err(io_err(batch_id))?;
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path_for(batch_id))
            .await
            .map_err(io_err(batch_id))?;
        Ok(())
    }

    /// Append one canonical, newline-terminated NDJSON line.
    #[tracing::instrument(skip(self, line))]
    pub async fn append_line(&self, batch_id: i64, line: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(batch_id))
            .await
            .map_err(io_err(batch_id))?;
        file.write_all(line).await.map_err(io_err(batch_id))?;
        if !line.ends_with(b"\n") {
            file.write_all(b"\n").await.map_err(io_err(batch_id))?;
        }
        file.flush().await.map_err(io_err(batch_id))?;
        Ok(())
    }

    /// Stream every line, verifying the file is non-empty first (spec
    /// §4.3: "Empty file => upload refused").
    #[tracing::instrument(skip(self))]
    pub async fn stream_lines(&self, batch_id: i64) -> Result<Vec<Vec<u8>>> {
        let path = self.path_for(batch_id);
        let file = File::open(&path).await.map_err(io_err(batch_id))?;
        let mut reader = BufReader::new(file).lines();
        let mut lines = Vec::new();
        while let Some(line) = reader.next_line().await.map_err(io_err(batch_id))? {
            if !line.is_empty() {
                lines.push(line.into_bytes());
            }
        }
        if lines.is_empty() {
            return Err(FileStoreError::Empty(batch_id));
        }
        Ok(lines)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, batch_id: i64) -> Result<()> {
        let path = self.path_for(batch_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(batch_id)(e)),
        }
    }

    /// Bytes of free space on the filesystem backing `base_dir`.
    pub fn check_free_space(&self) -> u64 {
        free_space_bytes(&self.base_dir)
    }

    async fn ensure_free_space(&self, batch_id: i64) -> Result<()> {
        let available = self.check_free_space();
        if available < self.min_free_space_bytes {
            tracing::warn!(batch_id, available, required = self.min_free_space_bytes, "refusing upload file, disk nearly full");
            return Err(FileStoreError::DiskFull {
                available,
                required: self.min_free_space_bytes,
            });
        }
        Ok(())
    }
}

fn free_space_bytes(dir: &Path) -> u64 {
    use sysinfo::Disks;

    let disks = Disks::new_with_refreshed_list();
    let mut best: Option<(&Path, u64)> = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if dir.starts_with(mount) {
            let is_better = match best {
                Some((current, _)) => mount.as_os_str().len() > current.as_os_str().len(),
                None => true,
            };
            if is_better {
                best = Some((mount, disk.available_space()));
            }
        }
    }
    best.map(|(_, space)| space).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_idempotent_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchFileStore::new(dir.path(), 0);
        store.create(1).await.unwrap();
        store.append_line(1, b"{\"a\":1}\n").await.unwrap();
        store.create(1).await.unwrap(); // truncates
        let err = store.stream_lines(1).await.unwrap_err();
        assert!(matches!(err, FileStoreError::Empty(1)));
    }

    #[tokio::test]
    async fn append_and_stream_round_trips_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchFileStore::new(dir.path(), 0);
        store.create(7).await.unwrap();
        store.append_line(7, b"{\"custom_id\":\"r1\"}").await.unwrap();
        store.append_line(7, b"{\"custom_id\":\"r2\"}").await.unwrap();
        let lines = store.stream_lines(7).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], b"{\"custom_id\":\"r1\"}".to_vec());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchFileStore::new(dir.path(), 0);
        store.create(3).await.unwrap();
        store.delete(3).await.unwrap();
        store.delete(3).await.unwrap();
    }

    #[tokio::test]
    async fn refuses_create_below_min_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let store = BatchFileStore::new(dir.path(), u64::MAX);
        let err = store.create(1).await.unwrap_err();
        assert!(matches!(err, FileStoreError::DiskFull { .. }));
    }
}

//! Atomic JSON persistence.
//!
//! Writes go to `<path>.tmp` and are renamed over the target, so readers see
//! either the previous or the new content, never a torn file. Writes to the
//! same path are serialized FIFO through a per-path async mutex; writes to
//! different paths proceed independently. Transient I/O errors are retried up
//! to [`WRITE_ATTEMPTS`] times.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::StoreError;

const WRITE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Default)]
pub struct FileStoreOptions {
    /// Pretty-print with 2-space indent (development); compact otherwise.
    pub pretty: bool,
    /// Copy an existing target to `<path>.backup.<epoch_ms>` before overwrite.
    pub backup_on_write: bool,
}

/// Cheaply cloneable handle; clones share the per-path lock table.
#[derive(Debug, Clone, Default)]
pub struct FileStore {
    options: FileStoreOptions,
    locks: Arc<StdMutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl FileStore {
    pub fn new(options: FileStoreOptions) -> Self {
        Self {
            options,
            locks: Arc::default(),
        }
    }

    pub fn pretty(&self) -> bool {
        self.options.pretty
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().expect("path lock table");
        // Drop lock slots nothing is waiting on once the table grows.
        if locks.len() > 256 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        let bytes = if self.options.pretty {
            serde_json::to_vec_pretty(value)?
        } else {
            serde_json::to_vec(value)?
        };
        Ok(bytes)
    }

    /// Atomically replace `path` with the JSON serialization of `value`.
    pub async fn write_json<T: Serialize>(
        &self,
        path: impl AsRef<Path>,
        value: &T,
    ) -> Result<(), StoreError> {
        let bytes = self.serialize(value)?;
        self.write_bytes(path.as_ref(), &bytes).await
    }

    /// Atomically replace `path` with raw text (used for Markdown exports).
    pub async fn write_string(
        &self,
        path: impl AsRef<Path>,
        content: &str,
    ) -> Result<(), StoreError> {
        self.write_bytes(path.as_ref(), content.as_bytes()).await
    }

    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        let mut last_error: Option<std::io::Error> = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            match self.write_bytes_once(path, bytes).await {
                Ok(()) => {
                    debug!(path = %path.display(), bytes = bytes.len(), "wrote file");
                    return Ok(());
                }
                Err(e) if is_transient(&e) && attempt < WRITE_ATTEMPTS => {
                    warn!(
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "transient write failure, retrying"
                    );
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    last_error = Some(e);
                }
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Err(StoreError::io(
            path,
            last_error.unwrap_or_else(|| ErrorKind::Other.into()),
        ))
    }

    async fn write_bytes_once(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if self.options.backup_on_write
            && tokio::fs::try_exists(path).await.unwrap_or(false)
        {
            let backup = backup_path(path);
            tokio::fs::copy(path, &backup).await?;
        }

        // Crashed writes leave only this tmp file; the next attempt reuses
        // the same name so residue never accumulates under a path.
        let tmp = tmp_path(path);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Read and deserialize `path`. `Ok(None)` when the file does not exist.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<T>, StoreError> {
        let path = path.as_ref();
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Read `path` as an untyped JSON value (integrity checks).
    pub async fn read_value(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        self.read_json(path).await
    }

    pub async fn read_string(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<Option<String>, StoreError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Delete a file, succeeding when it is already gone.
    pub async fn remove_if_exists(&self, path: impl AsRef<Path>) -> Result<bool, StoreError> {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Remove `.tmp` residue under `dir` left behind by interrupted writes.
    pub async fn sweep_tmp_files(&self, dir: impl AsRef<Path>) -> Result<usize, StoreError> {
        let dir = dir.as_ref();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        let mut swept = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp")
                && self.remove_if_exists(&path).await?
            {
                swept += 1;
            }
        }
        Ok(swept)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".backup.{}", Utc::now().timestamp_millis()));
    path.with_file_name(name)
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use serde::{Deserialize, Serialize};

    use super::{FileStore, FileStoreOptions};
    use crate::error::StoreError;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    fn store() -> FileStore {
        FileStore::new(FileStoreOptions::default())
    }

    #[tokio::test]
    async fn write_then_read_round_trips() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("nested/dir/doc.json");
        let doc = Doc {
            name: "messages".into(),
            count: 3,
        };

        store().write_json(&path, &doc).await?;
        let loaded: Option<Doc> = store().read_json(&path).await?;
        assert_eq!(loaded, Some(doc));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let loaded: Option<Doc> = store().read_json(tmp.path().join("absent.json")).await?;
        assert!(loaded.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn corrupted_json_is_a_parse_error() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("broken.json");
        tokio::fs::write(&path, b"{ not json").await?;

        let result: Result<Option<Doc>, _> = store().read_json(&path).await;
        match result {
            Err(StoreError::Parse { .. }) => Ok(()),
            other => anyhow::bail!("expected parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_tmp_file_survives_a_successful_write() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("doc.json");
        store()
            .write_json(&path, &Doc {
                name: "x".into(),
                count: 1,
            })
            .await?;
        assert!(!tmp.path().join("doc.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn backup_is_taken_before_overwrite_when_enabled() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("doc.json");
        let backing = FileStore::new(FileStoreOptions {
            pretty: false,
            backup_on_write: true,
        });

        backing
            .write_json(&path, &Doc {
                name: "v1".into(),
                count: 1,
            })
            .await?;
        backing
            .write_json(&path, &Doc {
                name: "v2".into(),
                count: 2,
            })
            .await?;

        let mut backups = 0;
        let mut dir = tokio::fs::read_dir(tmp.path()).await?;
        while let Some(entry) = dir.next_entry().await? {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with("doc.json.backup.")
            {
                backups += 1;
            }
        }
        assert_eq!(backups, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_path_leave_a_complete_document() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("contended.json");
        let shared = store();

        let mut handles = Vec::new();
        for count in 0..16u32 {
            let shared = shared.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                shared
                    .write_json(&path, &Doc {
                        name: format!("writer-{count}"),
                        count,
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let loaded: Option<Doc> = shared.read_json(&path).await?;
        let loaded = loaded.expect("document present");
        assert!(loaded.name.starts_with("writer-"));
        assert!(!path.with_extension("json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_tmp_residue_only() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        tokio::fs::write(tmp.path().join("doc.json"), b"{}").await?;
        tokio::fs::write(tmp.path().join("doc.json.tmp"), b"partial").await?;

        let swept = store().sweep_tmp_files(tmp.path()).await?;
        assert_eq!(swept, 1);
        assert!(tmp.path().join("doc.json").exists());
        assert!(!tmp.path().join("doc.json.tmp").exists());
        Ok(())
    }
}

//! Local fallback store for batches awaiting remote delivery.
//!
//! One file per batch, named `{createdAt}_{suffix}`. Files are written to a
//! dot-prefixed temp name and renamed into place, so a listed entry is always
//! complete. Replay claims an entry by renaming it to `{name}.replaying`; a
//! claimed entry is invisible to [`LocalBuffer::list`] until restored.

use fs_err as fs;
use fs_err::tokio as async_fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::batch::{BatchKind, PendingBatch};

pub const CLAIM_SUFFIX: &str = ".replaying";
const TEMP_PREFIX: &str = ".";
const TEMP_SUFFIX: &str = ".part";

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer I/O failed: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Buffered record is malformed: {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BufferError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BufferError::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferEntry {
    pub path: PathBuf,
    pub kind: BatchKind,
    pub created_at: i64,
}

impl BufferEntry {
    pub fn claimed_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(CLAIM_SUFFIX);
        self.path.with_file_name(name)
    }
}

#[derive(Debug, Clone)]
pub struct LocalBuffer {
    dir: PathBuf,
}

impl LocalBuffer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the buffer directory. Called once at startup, before the event loop.
    pub fn provision(&self) -> Result<(), String> {
        fs::create_dir_all(&self.dir)
            .map_err(|err| format!("Failed to create buffer directory: {}", err))
    }

    pub fn entry_name(kind: BatchKind, created_at: i64) -> String {
        format!("{}_{}", created_at, kind.suffix())
    }

    pub fn parse_entry_name(name: &str) -> Option<(i64, BatchKind)> {
        let (millis, suffix) = name.split_once('_')?;
        if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let created_at = millis.parse().ok()?;
        let kind = BatchKind::from_suffix(suffix)?;
        Some((created_at, kind))
    }

    /// Durably writes a batch, returning the entry path.
    ///
    /// Two batches of the same kind created in the same millisecond get
    /// distinct names by bumping the timestamp in the file name.
    pub async fn write(&self, batch: &PendingBatch) -> Result<PathBuf, BufferError> {
        let payload = batch.encode().map_err(|err| {
            BufferError::io(
                "serialize batch",
                std::io::Error::new(ErrorKind::InvalidData, err),
            )
        })?;

        let mut stamp = batch.created_at;
        let path = loop {
            let candidate = self.dir.join(Self::entry_name(batch.kind, stamp));
            match async_fs::metadata(&candidate).await {
                Ok(_) => stamp += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => break candidate,
                Err(err) => return Err(BufferError::io("check buffer entry", err)),
            }
        };

        let name = Self::entry_name(batch.kind, stamp);
        let tmp_path = self
            .dir
            .join(format!("{}{}{}", TEMP_PREFIX, name, TEMP_SUFFIX));
        async_fs::write(&tmp_path, payload)
            .await
            .map_err(|err| BufferError::io("write buffer entry", err))?;
        async_fs::rename(&tmp_path, &path)
            .await
            .map_err(|err| BufferError::io("commit buffer entry", err))?;

        debug!(path = %path.display(), records = batch.len(), "Batch buffered locally");
        Ok(path)
    }

    /// Lists unclaimed entries in creation order.
    pub async fn list(&self) -> Result<Vec<BufferEntry>, BufferError> {
        let mut reader = async_fs::read_dir(&self.dir)
            .await
            .map_err(|err| BufferError::io("open buffer directory", err))?;

        let mut entries = Vec::new();
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(BufferError::io("read buffer directory", err)),
            };
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some((created_at, kind)) = Self::parse_entry_name(name) {
                entries.push(BufferEntry {
                    path: entry.path(),
                    kind,
                    created_at,
                });
            }
        }

        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        Ok(entries)
    }

    /// Takes exclusive ownership of an entry for replay.
    pub async fn claim(&self, entry: &BufferEntry) -> Result<PathBuf, BufferError> {
        let claimed = entry.claimed_path();
        async_fs::rename(&entry.path, &claimed)
            .await
            .map_err(|err| BufferError::io("claim buffer entry", err))?;
        Ok(claimed)
    }

    pub async fn read(&self, entry: &BufferEntry, claimed: &Path) -> Result<PendingBatch, BufferError> {
        let content = async_fs::read_to_string(claimed)
            .await
            .map_err(|err| BufferError::io("read buffer entry", err))?;
        PendingBatch::decode(entry.kind, entry.created_at, &content).map_err(|source| {
            BufferError::Malformed {
                path: entry.path.clone(),
                source,
            }
        })
    }

    /// Returns a claimed entry to its listed name.
    pub async fn restore(&self, entry: &BufferEntry) -> Result<(), BufferError> {
        async_fs::rename(entry.claimed_path(), &entry.path)
            .await
            .map_err(|err| BufferError::io("restore buffer entry", err))
    }

    pub async fn delete(&self, claimed: &Path) -> Result<(), BufferError> {
        async_fs::remove_file(claimed)
            .await
            .map_err(|err| BufferError::io("delete buffer entry", err))
    }

    /// Restores entries left claimed by a previous process.
    pub async fn recover_claims(&self) -> Result<usize, BufferError> {
        let mut reader = async_fs::read_dir(&self.dir)
            .await
            .map_err(|err| BufferError::io("open buffer directory", err))?;

        let mut recovered = 0;
        loop {
            let entry = match reader.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => return Err(BufferError::io("read buffer directory", err)),
            };
            let name = entry.file_name();
            let Some(original) = name.to_str().and_then(|name| name.strip_suffix(CLAIM_SUFFIX))
            else {
                continue;
            };
            if Self::parse_entry_name(original).is_none() {
                continue;
            }

            let target = self.dir.join(original);
            match async_fs::rename(entry.path(), &target).await {
                Ok(()) => {
                    info!(path = %target.display(), "Recovered claimed buffer entry");
                    recovered += 1;
                }
                Err(err) => {
                    warn!(error = %err, path = %target.display(), "Failed to recover claimed buffer entry");
                }
            }
        }

        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use digitme_protocol::SessionRecord;

    fn record(filename: &str) -> SessionRecord {
        SessionRecord {
            filename: filename.to_string(),
            filetype: "python".to_string(),
            project: "na".to_string(),
            start: 0,
            end: 30,
            last_tick: 20,
            ticks: 2,
        }
    }

    fn buffer() -> (tempfile::TempDir, LocalBuffer) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let buffer = LocalBuffer::new(temp_dir.path());
        (temp_dir, buffer)
    }

    #[test]
    fn parses_entry_names() {
        assert_eq!(
            LocalBuffer::parse_entry_name("1700000000000_tmp_sessions"),
            Some((1_700_000_000_000, BatchKind::Sessions))
        );
        assert_eq!(
            LocalBuffer::parse_entry_name("12_tomato"),
            Some((12, BatchKind::Timers))
        );
        assert_eq!(
            LocalBuffer::parse_entry_name("12_tmp"),
            Some((12, BatchKind::Combined))
        );
        assert_eq!(LocalBuffer::parse_entry_name("12_tmp.replaying"), None);
        assert_eq!(LocalBuffer::parse_entry_name(".12_tmp.part"), None);
        assert_eq!(LocalBuffer::parse_entry_name("config.toml"), None);
    }

    #[tokio::test]
    async fn write_then_list_in_timestamp_order() {
        let (_temp_dir, buffer) = buffer();
        let later = PendingBatch::sessions(200, vec![record("b.py")]);
        let earlier = PendingBatch::sessions(100, vec![record("a.py")]);
        buffer.write(&later).await.expect("write later");
        buffer.write(&earlier).await.expect("write earlier");

        let entries = buffer.list().await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].created_at, 100);
        assert_eq!(entries[1].created_at, 200);
    }

    #[tokio::test]
    async fn same_millisecond_writes_do_not_collide() {
        let (_temp_dir, buffer) = buffer();
        let batch = PendingBatch::sessions(100, vec![record("a.py")]);
        let first = buffer.write(&batch).await.expect("first");
        let second = buffer.write(&batch).await.expect("second");
        assert_ne!(first, second);
        assert_eq!(buffer.list().await.expect("list").len(), 2);
    }

    #[tokio::test]
    async fn claimed_entries_are_hidden_until_restored() {
        let (_temp_dir, buffer) = buffer();
        let batch = PendingBatch::sessions(100, vec![record("a.py")]);
        buffer.write(&batch).await.expect("write");

        let entry = buffer.list().await.expect("list").remove(0);
        let claimed = buffer.claim(&entry).await.expect("claim");
        assert!(buffer.list().await.expect("list").is_empty());

        let read = buffer.read(&entry, &claimed).await.expect("read");
        assert_eq!(read, batch);

        buffer.restore(&entry).await.expect("restore");
        assert_eq!(buffer.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_claimed_entry() {
        let (_temp_dir, buffer) = buffer();
        buffer
            .write(&PendingBatch::sessions(100, vec![record("a.py")]))
            .await
            .expect("write");
        let entry = buffer.list().await.expect("list").remove(0);
        let claimed = buffer.claim(&entry).await.expect("claim");
        buffer.delete(&claimed).await.expect("delete");

        assert!(buffer.list().await.expect("list").is_empty());
        assert!(buffer.delete(&claimed).await.is_err());
    }

    #[tokio::test]
    async fn malformed_entries_report_original_path() {
        let (temp_dir, buffer) = buffer();
        let path = temp_dir.path().join("100_tmp_sessions");
        fs::write(&path, "{not json").expect("write garbage");

        let entry = buffer.list().await.expect("list").remove(0);
        let claimed = buffer.claim(&entry).await.expect("claim");
        match buffer.read(&entry, &claimed).await {
            Err(BufferError::Malformed { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("expected malformed entry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn recovers_claims_left_by_previous_process() {
        let (temp_dir, buffer) = buffer();
        fs::write(temp_dir.path().join("100_tmp.replaying"), "{}").expect("write claim");
        fs::write(temp_dir.path().join("notes.replaying"), "x").expect("write stray");

        let recovered = buffer.recover_claims().await.expect("recover");
        assert_eq!(recovered, 1);
        assert!(temp_dir.path().join("100_tmp").exists());
        assert!(temp_dir.path().join("notes.replaying").exists());
    }

    #[tokio::test]
    async fn write_fails_when_directory_is_missing() {
        let (temp_dir, _) = buffer();
        let buffer = LocalBuffer::new(temp_dir.path().join("missing"));
        let result = buffer
            .write(&PendingBatch::sessions(1, vec![record("a.py")]))
            .await;
        assert!(matches!(result, Err(BufferError::Io { .. })));
    }
}

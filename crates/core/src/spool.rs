use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone)]
struct SpoolEntry {
    owner: String,
    filename: String,
    uploaded_chunks: usize,
    cumulative_size: u64,
    last_touched: Instant,
}

/// Filesystem-backed buffer for an in-progress chunked upload. One instance
/// is shared by the daemon and handed to every `AppendChunk`/`CompleteUpload`
/// call for a given caller session.
pub struct SpoolManager {
    spool_dir: PathBuf,
    ttl: Duration,
    max_upload_size_bytes: u64,
    entries: Mutex<HashMap<String, SpoolEntry>>,
}

impl SpoolManager {
    pub fn new(spool_dir: PathBuf, ttl: Duration, max_upload_size_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            spool_dir,
            ttl,
            max_upload_size_bytes,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn spool_path(&self, upload_id: &str) -> PathBuf {
        let hashed = blake3::hash(upload_id.as_bytes()).to_hex();
        self.spool_dir.join(hashed.to_string())
    }

    pub async fn append_chunk(
        &self,
        owner: &str,
        upload_id: &str,
        chunk_index: usize,
        filename: &str,
        bytes: &[u8],
    ) -> Result<usize> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;

        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(upload_id)
            && entry.last_touched.elapsed() > self.ttl
        {
            entries.remove(upload_id);
            let _ = tokio::fs::remove_file(self.spool_path(upload_id)).await;
        }

        if let Some(entry) = entries.get(upload_id) {
            if entry.owner != owner {
                return Err(Error::Authorization);
            }
        }

        let expected_index = entries.get(upload_id).map(|e| e.uploaded_chunks).unwrap_or(0);
        if chunk_index != expected_index {
            return Err(Error::validation(format!(
                "expected chunk {expected_index}, got {chunk_index}"
            )));
        }

        let cumulative_before = entries.get(upload_id).map(|e| e.cumulative_size).unwrap_or(0);
        let cumulative_after = cumulative_before + bytes.len() as u64;
        if cumulative_after > self.max_upload_size_bytes {
            return Err(Error::validation("upload exceeds max_upload_size_bytes"));
        }

        let path = self.spool_path(upload_id);
        let mut file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        let entry = entries.entry(upload_id.to_string()).or_insert_with(|| SpoolEntry {
            owner: owner.to_string(),
            filename: filename.to_string(),
            uploaded_chunks: 0,
            cumulative_size: 0,
            last_touched: Instant::now(),
        });
        entry.uploaded_chunks = chunk_index + 1;
        entry.cumulative_size = cumulative_after;
        entry.last_touched = Instant::now();

        debug!(
            event = "spool.append",
            upload_id,
            chunk_index,
            cumulative_size = cumulative_after,
            "spool.append"
        );

        Ok(entry.uploaded_chunks)
    }

    /// Returns the local spool path and filename and removes the in-memory
    /// tracking entry, handing ownership of the on-disk bytes to the caller.
    pub async fn complete_upload(
        &self,
        owner: &str,
        upload_id: &str,
        total_chunks: usize,
    ) -> Result<(PathBuf, String)> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get(upload_id)
            .ok_or_else(|| Error::not_found(format!("upload {upload_id}")))?;

        if entry.owner != owner {
            return Err(Error::Authorization);
        }
        if entry.uploaded_chunks != total_chunks {
            return Err(Error::validation(format!(
                "expected {total_chunks} chunks, got {}",
                entry.uploaded_chunks
            )));
        }

        let filename = entry.filename.clone();
        let path = self.spool_path(upload_id);
        entries.remove(upload_id);

        debug!(event = "spool.complete", upload_id, total_chunks, "spool.complete");

        Ok((path, filename))
    }

    pub async fn abort_upload(&self, owner: &str, upload_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(upload_id)
            && entry.owner != owner
        {
            return Err(Error::Authorization);
        }
        entries.remove(upload_id);
        let path = self.spool_path(upload_id);
        let _ = tokio::fs::remove_file(&path).await;

        debug!(event = "spool.abort", upload_id, "spool.abort");
        Ok(())
    }

    /// Best-effort startup sweep: removes spool files whose tracking entry
    /// has aged past the TTL floor. Not a periodic job — see design notes.
    pub async fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.last_touched.elapsed() > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            entries.remove(id);
            let _ = tokio::fs::remove_file(self.spool_path(id)).await;
        }
        expired.len()
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> Arc<SpoolManager> {
        SpoolManager::new(dir.to_path_buf(), Duration::from_secs(86_400), 10 * 1024 * 1024)
    }

    #[tokio::test]
    async fn sequential_chunks_concatenate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        mgr.append_chunk("user-1", "up-1", 0, "video.mp4", b"hello ")
            .await
            .unwrap();
        mgr.append_chunk("user-1", "up-1", 1, "video.mp4", b"world")
            .await
            .unwrap();

        let (path, filename) = mgr.complete_upload("user-1", "up-1", 2).await.unwrap();
        assert_eq!(filename, "video.mp4");
        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected_without_mutating_state() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        mgr.append_chunk("user-1", "up-1", 0, "video.mp4", b"abc")
            .await
            .unwrap();
        let err = mgr
            .append_chunk("user-1", "up-1", 2, "video.mp4", b"xyz")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let path = mgr.spool_path("up-1");
        let data = tokio::fs::read(&path).await.unwrap();
        assert_eq!(data, b"abc");
    }

    #[tokio::test]
    async fn owner_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        mgr.append_chunk("user-1", "up-1", 0, "video.mp4", b"abc")
            .await
            .unwrap();
        let err = mgr
            .append_chunk("user-2", "up-1", 1, "video.mp4", b"xyz")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization));
    }

    #[tokio::test]
    async fn abort_removes_spool_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());

        mgr.append_chunk("user-1", "up-1", 0, "video.mp4", b"abc")
            .await
            .unwrap();
        mgr.abort_upload("user-1", "up-1").await.unwrap();

        let path = mgr.spool_path("up-1");
        assert!(!path.exists());
    }
}

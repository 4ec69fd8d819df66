use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;

use crate::catalog::{self, Artifact, ArtifactKind, ArtifactStatus};
use crate::chat::ChatDownloader;
use crate::db_writer::DbWriterPool;
use crate::object_store::ObjectStore;
use crate::pipeline::PipelineController;
use crate::reconcile::{self, ReconcileReport};
use crate::spool::SpoolManager;
use crate::transcode::{MediaToolConfig, TranscodeEngine, TranscodeJob};
use crate::{Error, Result};

/// Bundles every collaborator a daemon or CLI call needs and exposes one
/// async method per operation in the external interface table. This is the
/// single seam the control-protocol dispatcher calls into; it holds no state
/// of its own beyond `Arc`/`SqlitePool` handles owned by the daemon process.
pub struct Pipeline {
    pub store: Arc<dyn ObjectStore>,
    pub pool: SqlitePool,
    pub spool: Arc<SpoolManager>,
    pub transcode: Arc<TranscodeEngine>,
    pub chat: Arc<ChatDownloader>,
    pub controller: Arc<PipelineController>,
    pub media_tool: MediaToolConfig,
}

impl Pipeline {
    pub async fn append_chunk(
        &self,
        owner: &str,
        upload_id: &str,
        chunk_index: usize,
        filename: &str,
        bytes: &[u8],
    ) -> Result<usize> {
        self.spool.append_chunk(owner, upload_id, chunk_index, filename, bytes).await
    }

    pub async fn abort_upload(&self, owner: &str, upload_id: &str) -> Result<()> {
        self.spool.abort_upload(owner, upload_id).await
    }

    /// Finalizes a spooled upload: validates the chunk count client-side
    /// (the spool already enforces it), creates the `PENDING` artifact, and
    /// routes the spool file onward — video kinds hand off to C2, everything
    /// else uploads directly through C4.
    pub async fn complete_upload(
        &self,
        owner: &str,
        upload_id: &str,
        filename: &str,
        total_chunks: usize,
        hierarchy_path: &str,
    ) -> Result<String> {
        let (spool_path, stored_filename) =
            self.spool.complete_upload(owner, upload_id, total_chunks).await?;
        let filename = if filename.is_empty() { stored_filename.as_str() } else { filename };

        let mime_type = guess_mime_type(filename);
        let kind = ArtifactKind::from_mime(mime_type);
        let artifact =
            catalog::create_pending_artifact(&self.pool, owner, kind, filename, hierarchy_path, Some(mime_type))
                .await?;

        match kind {
            ArtifactKind::Video => {
                self.transcode
                    .submit(TranscodeJob {
                        artifact_id: artifact.id.clone(),
                        input_path: spool_path,
                        original_filename: filename.to_string(),
                        hierarchy_path: hierarchy_path.to_string(),
                    })
                    .await?;
            }
            _ => {
                let folder_id = self.store.ensure_path(hierarchy_path).await?;
                let file_id = self
                    .store
                    .upload_resumable(&spool_path, filename, &folder_id, mime_type, Box::new(|_| {}))
                    .await?;
                let size_bytes = tokio::fs::metadata(&spool_path).await.ok().map(|m| m.len() as i64);
                catalog::complete_artifact(
                    &self.pool,
                    &artifact.id,
                    &file_id,
                    Some(&folder_id),
                    None,
                    None,
                    size_bytes,
                    None,
                )
                .await?;
                let _ = tokio::fs::remove_file(&spool_path).await;
            }
        }

        Ok(artifact.id)
    }

    pub async fn list_artifacts(
        &self,
        owner: &str,
        hierarchy_path_prefix: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Artifact>, i64)> {
        catalog::list_artifacts(&self.pool, owner, hierarchy_path_prefix, page, page_size).await
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Result<Artifact> {
        catalog::get_artifact(&self.pool, artifact_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("artifact {artifact_id}")))
    }

    /// Cancels the job if active, removes the remote folder (preferred) or
    /// bare file, then deletes the catalog row.
    pub async fn delete_artifact(&self, artifact_id: &str) -> Result<()> {
        let artifact = self.get_artifact(artifact_id).await?;
        self.controller.cancel(artifact_id);

        if let Some(folder_id) = &artifact.remote_folder_id {
            self.store.delete_folder(folder_id).await?;
        } else if let Some(file_id) = &artifact.remote_file_id {
            self.store.delete_file(file_id).await?;
        }

        catalog::delete_artifact(&self.pool, artifact_id).await?;
        Ok(())
    }

    /// Cancels the job only if it is still pending or in flight; leaves a
    /// completed artifact's remote objects untouched.
    pub async fn abort_artifact(&self, artifact_id: &str) -> Result<bool> {
        let artifact = self.get_artifact(artifact_id).await?;
        if !matches!(artifact.status, ArtifactStatus::Pending | ArtifactStatus::Processing) {
            return Ok(false);
        }
        Ok(self.controller.cancel(artifact_id))
    }

    pub async fn rename_artifact(&self, artifact_id: &str, new_title: &str) -> Result<()> {
        if new_title.is_empty() || new_title.chars().count() > 255 {
            return Err(Error::validation("new_title must be 1..=255 characters"));
        }
        let artifact = self.get_artifact(artifact_id).await?;
        if let Some(file_id) = &artifact.remote_file_id {
            self.store.rename(file_id, new_title).await?;
        }
        catalog::rename_artifact(&self.pool, artifact_id, new_title).await
    }

    pub async fn reconcile_scope(
        &self,
        owner: &str,
        hierarchy_paths: Vec<String>,
        concurrency: usize,
    ) -> Vec<(String, Result<ReconcileReport>)> {
        reconcile::reconcile_scope(
            Arc::clone(&self.store),
            self.pool.clone(),
            self.transcode_media_tool(),
            Arc::clone(&self.controller),
            owner.to_string(),
            hierarchy_paths,
            concurrency,
        )
        .await
    }

    pub async fn chat_batch(
        &self,
        owner: &str,
        channel_id: &str,
        message_ids: Vec<String>,
        hierarchy_path: &str,
    ) -> Result<Vec<String>> {
        self.chat
            .start_batch(owner, channel_id, message_ids, hierarchy_path, self.spool.spool_dir())
            .await
    }

    pub fn cancel_batch(&self, artifact_ids: &[String]) -> u64 {
        artifact_ids.iter().filter(|id| self.controller.cancel(id)).count() as u64
    }

    pub fn batch_speed(&self, artifact_ids: &[String]) -> Vec<(String, f64)> {
        artifact_ids
            .iter()
            .map(|id| (id.clone(), self.controller.speed_mbps(id)))
            .collect()
    }

    /// Cheap clone, not stored on `Pipeline`: the engine already owns its own
    /// `MediaToolConfig` copy per worker, but reconciliation's sync-metadata
    /// job needs one passed in independently of the worker pool.
    fn transcode_media_tool(&self) -> MediaToolConfig {
        self.media_tool.clone()
    }
}

fn guess_mime_type(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".mp4") || lower.ends_with(".mov") || lower.ends_with(".mkv") {
        "video/mp4"
    } else if lower.ends_with(".pdf") {
        "application/pdf"
    } else {
        "application/octet-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::InMemoryObjectStore;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn test_pipeline(dir: &Path) -> Pipeline {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryObjectStore::new());
        let controller = Arc::new(PipelineController::new());
        let media_tool = MediaToolConfig {
            media_tool_path: "ffmpeg".into(),
            media_probe_path: "ffprobe".into(),
        };
        let (db_writer, _db_writer_handles) = DbWriterPool::spawn(pool.clone(), 1);
        let (transcode, _handles) = TranscodeEngine::spawn(
            1,
            8,
            Arc::clone(&store),
            pool.clone(),
            media_tool.clone(),
            Arc::clone(&controller),
            Arc::clone(&db_writer),
        );
        let spool = SpoolManager::new(dir.to_path_buf(), Duration::from_secs(86_400), 10 * 1024 * 1024);
        let chat_client: Arc<dyn crate::chat::ChatClient> = Arc::new(NullChatClient);
        let chat = Arc::new(ChatDownloader::new(
            chat_client,
            Arc::clone(&store),
            pool.clone(),
            Arc::clone(&transcode),
            Arc::clone(&controller),
            db_writer,
            3,
        ));

        Pipeline { store, pool, spool, transcode, chat, controller, media_tool }
    }

    struct NullChatClient;
    impl crate::chat::ChatClient for NullChatClient {
        fn provider(&self) -> &'static str {
            "null"
        }
        fn list_message_attachments<'a>(
            &'a self,
            _channel_id: &'a str,
            _message_ids: &'a [String],
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<crate::chat::ChatAttachment>>> + Send + 'a>>
        {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn download_attachment<'a>(
            &'a self,
            _channel_id: &'a str,
            _message_id: &'a str,
            _dest_path: &'a Path,
            _cancel: &'a tokio_util::sync::CancellationToken,
            _progress_cb: Box<dyn FnMut(u64, Option<u64>) + Send + 'a>,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn complete_upload_uploads_pdf_directly_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;

        pipeline
            .append_chunk("user-1", "up-1", 0, "notes.pdf", b"%PDF-1.4 fake")
            .await
            .unwrap();
        let artifact_id = pipeline
            .complete_upload("user-1", "up-1", "notes.pdf", 1, "course/chapter")
            .await
            .unwrap();

        let artifact = pipeline.get_artifact(&artifact_id).await.unwrap();
        assert_eq!(artifact.status, ArtifactStatus::Completed);
        assert_eq!(artifact.kind, ArtifactKind::Pdf);
    }

    #[tokio::test]
    async fn delete_artifact_removes_catalog_row() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;

        pipeline
            .append_chunk("user-1", "up-1", 0, "notes.pdf", b"%PDF-1.4 fake")
            .await
            .unwrap();
        let artifact_id = pipeline
            .complete_upload("user-1", "up-1", "notes.pdf", 1, "course/chapter")
            .await
            .unwrap();

        pipeline.delete_artifact(&artifact_id).await.unwrap();
        let err = pipeline.get_artifact(&artifact_id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn rename_artifact_rejects_overlong_title() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(dir.path()).await;

        pipeline
            .append_chunk("user-1", "up-1", 0, "notes.pdf", b"%PDF-1.4 fake")
            .await
            .unwrap();
        let artifact_id = pipeline
            .complete_upload("user-1", "up-1", "notes.pdf", 1, "course/chapter")
            .await
            .unwrap();

        let too_long = "x".repeat(256);
        let err = pipeline.rename_artifact(&artifact_id, &too_long).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }
}

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use mediavault_core::{
    list_artifacts, open_catalog_db, Artifact, ArtifactStatus, ChatAttachment, ChatClient,
    ChatDownloader, InMemoryObjectStore, MediaToolConfig, ObjectStore, PipelineController, Result,
    TranscodeEngine,
};

/// A chat backend double returning two attachments upfront: a normal PDF and
/// a second PDF whose download is held open until the test releases it,
/// leaving a window to cancel it mid-batch.
struct FakeChatClient {
    release_slow: tokio::sync::Notify,
}

impl ChatClient for FakeChatClient {
    fn provider(&self) -> &'static str {
        "fake"
    }

    fn list_message_attachments<'a>(
        &'a self,
        _channel_id: &'a str,
        message_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ChatAttachment>>> + Send + 'a>> {
        let ids = message_ids.to_vec();
        Box::pin(async move {
            Ok(ids
                .into_iter()
                .map(|message_id| {
                    let name = format!("{message_id}.pdf");
                    ChatAttachment {
                        message_id,
                        name,
                        mime_type: "application/pdf".to_string(),
                        size_bytes: Some(8),
                    }
                })
                .collect())
        })
    }

    fn download_attachment<'a>(
        &'a self,
        _channel_id: &'a str,
        message_id: &'a str,
        dest_path: &'a Path,
        cancel: &'a tokio_util::sync::CancellationToken,
        mut progress_cb: Box<dyn FnMut(u64, Option<u64>) + Send + 'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if message_id == "slow" {
                self.release_slow.notified().await;
            }
            if cancel.is_cancelled() {
                return Err(mediavault_core::Error::Cancelled);
            }
            tokio::fs::write(dest_path, b"%PDF-1.4").await?;
            progress_cb(8, Some(8));
            Ok(())
        })
    }
}

async fn find_artifact(pool: &sqlx::SqlitePool, id: &str) -> Artifact {
    let (rows, _) = list_artifacts(pool, "user-1", None, 1, 10).await.unwrap();
    rows.into_iter().find(|a| a.id == id).expect("artifact row present")
}

#[tokio::test]
async fn chat_batch_downloads_concurrently_and_honors_mid_batch_cancel() {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("catalog.sqlite3");
    let spool_dir = tmp.path().join("spool");

    let pool = open_catalog_db(&db_path).await.unwrap();
    let store: Arc<dyn ObjectStore> = InMemoryObjectStore::new();
    let controller = Arc::new(PipelineController::new());
    let media_tool = MediaToolConfig {
        media_tool_path: PathBuf::from("ffmpeg"),
        media_probe_path: PathBuf::from("ffprobe"),
    };
    let (db_writer, _db_writer_handles) = mediavault_core::DbWriterPool::spawn(pool.clone(), 1);
    let (transcode, _handles) = TranscodeEngine::spawn(
        1,
        4,
        Arc::clone(&store),
        pool.clone(),
        media_tool,
        Arc::clone(&controller),
        Arc::clone(&db_writer),
    );

    let fake_client = Arc::new(FakeChatClient {
        release_slow: tokio::sync::Notify::new(),
    });
    let chat_client: Arc<dyn ChatClient> = fake_client.clone();
    let downloader = Arc::new(ChatDownloader::new(
        chat_client,
        Arc::clone(&store),
        pool.clone(),
        transcode,
        Arc::clone(&controller),
        db_writer,
        4,
    ));

    let message_ids = vec!["fast".to_string(), "slow".to_string()];
    let batch = {
        let downloader = Arc::clone(&downloader);
        let spool_dir = spool_dir.clone();
        tokio::spawn(async move {
            downloader
                .start_batch("user-1", "chan-1", message_ids, "course/ch1", &spool_dir)
                .await
                .unwrap()
        })
    };

    // PENDING rows are created synchronously before any download starts, so
    // poll until both exist, then identify each by its (unique) title rather
    // than row order, since `list_artifacts` sorts by `created_at` and the
    // two rows can tie at second resolution.
    let (fast_artifact_id, slow_artifact_id) = loop {
        let (rows, _) = list_artifacts(&pool, "user-1", Some("course/ch1"), 1, 10)
            .await
            .unwrap();
        if rows.len() == 2 {
            let fast = rows.iter().find(|a| a.title == "fast.pdf").map(|a| a.id.clone());
            let slow = rows.iter().find(|a| a.title == "slow.pdf").map(|a| a.id.clone());
            if let (Some(fast), Some(slow)) = (fast, slow) {
                break (fast, slow);
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };

    downloader.cancel_artifact(&slow_artifact_id);
    fake_client.release_slow.notify_one();

    let ids = batch.await.unwrap();
    assert_eq!(ids, vec![fast_artifact_id.clone(), slow_artifact_id.clone()]);

    let fast_row = find_artifact(&pool, &fast_artifact_id).await;
    assert_eq!(fast_row.status, ArtifactStatus::Completed);

    let slow_row = find_artifact(&pool, &slow_artifact_id).await;
    assert_eq!(slow_row.status, ArtifactStatus::Canceled);
    assert_eq!(slow_row.progress, 0);

    assert_eq!(downloader.batch_speed_mbps(&slow_artifact_id), 0.0);
}

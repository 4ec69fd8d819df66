use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::{debug, error};

use crate::catalog::{self, ArtifactKind, ArtifactStatus};
use crate::db_writer::{DbWriterPool, TerminalWrite};
use crate::object_store::ObjectStore;
use crate::pipeline::PipelineController;
use crate::transcode::{TranscodeEngine, TranscodeJob};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct ChatAttachment {
    pub message_id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: Option<u64>,
}

/// Object-safe adapter over a remote chat channel. Mirrors `ObjectStore`'s
/// boxed-future shape so a concrete bot-API client and an in-memory fake can
/// both implement it.
pub trait ChatClient: Send + Sync {
    fn provider(&self) -> &'static str;

    fn list_message_attachments<'a>(
        &'a self,
        channel_id: &'a str,
        message_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ChatAttachment>>> + Send + 'a>>;

    /// Streams the attachment to `dest_path`, checking `cancel` between
    /// chunks so a mid-download cancel takes effect within one chunk
    /// boundary rather than after the whole body has been read, the same
    /// guarantee `streaming::collect_cancellable` gives C5's range reads.
    fn download_attachment<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
        dest_path: &'a Path,
        cancel: &'a tokio_util::sync::CancellationToken,
        progress_cb: Box<dyn FnMut(u64, Option<u64>) + Send + 'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct HttpChatClientConfig {
    pub base_url: String,
    pub api_token: String,
}

/// Bot-API-style HTTP backend, shaped after the teacher's
/// `TelegramBotApiStorage`: a `getMessages`-equivalent listing call plus a
/// two-step getFile/download sequence per attachment.
pub struct HttpChatClient {
    config: HttpChatClientConfig,
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(config: HttpChatClientConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(serde::Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(serde::Deserialize)]
struct AttachmentResult {
    message_id: String,
    name: String,
    mime_type: String,
    size_bytes: Option<u64>,
}

impl ChatClient for HttpChatClient {
    fn provider(&self) -> &'static str {
        "http.chatclient"
    }

    fn list_message_attachments<'a>(
        &'a self,
        channel_id: &'a str,
        message_ids: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<ChatAttachment>>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/messages", self.config.base_url);
            let res = self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .query(&[("channel_id", channel_id)])
                .query(&message_ids.iter().map(|m| ("message_id", m)).collect::<Vec<_>>())
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("list_message_attachments failed: {e}")))?;

            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|e| Error::remote_store(format!("list_message_attachments read failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::remote_store(format!(
                    "list_message_attachments http {status}: {body}"
                )));
            }
            let parsed: ApiResponse<Vec<AttachmentResult>> = serde_json::from_str(&body)
                .map_err(|e| Error::remote_store(format!("list_message_attachments invalid json: {e}")))?;
            if !parsed.ok {
                return Err(Error::remote_store(
                    parsed.description.unwrap_or_else(|| "chat client returned ok=false".to_string()),
                ));
            }
            Ok(parsed
                .result
                .unwrap_or_default()
                .into_iter()
                .map(|a| ChatAttachment {
                    message_id: a.message_id,
                    name: a.name,
                    mime_type: a.mime_type,
                    size_bytes: a.size_bytes,
                })
                .collect())
        })
    }

    fn download_attachment<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
        dest_path: &'a Path,
        cancel: &'a tokio_util::sync::CancellationToken,
        mut progress_cb: Box<dyn FnMut(u64, Option<u64>) + Send + 'a>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            use futures::StreamExt;
            use tokio::io::AsyncWriteExt;

            let url = format!("{}/download", self.config.base_url);
            let res = self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .query(&[("channel_id", channel_id), ("message_id", message_id)])
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("download_attachment request failed: {e}")))?;

            let status = res.status();
            if !status.is_success() {
                return Err(Error::remote_store(format!("download_attachment http {status}")));
            }
            let total = res.content_length();

            let mut file = tokio::fs::File::create(dest_path).await?;
            let mut done = 0u64;
            let mut stream = res.bytes_stream();
            loop {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                match stream.next().await {
                    Some(chunk) => {
                        let chunk = chunk
                            .map_err(|e| Error::remote_store(format!("download_attachment chunk failed: {e}")))?;
                        file.write_all(&chunk).await?;
                        done += chunk.len() as u64;
                        progress_cb(done, total);
                    }
                    None => break,
                }
            }
            file.flush().await?;
            Ok(())
        })
    }
}

/// Strips a leading numeric ordering prefix such as `"123) "`, `"03."`, or
/// `"1189-"` from a display name, leaving the original as an upload fallback.
pub fn strip_ordering_prefix(name: &str) -> &str {
    let digits_end = name.find(|c: char| !c.is_ascii_digit()).unwrap_or(0);
    if digits_end == 0 {
        return name;
    }
    let rest = &name[digits_end..];
    let sep_len = match rest.chars().next() {
        Some(')') | Some('.') | Some('-') => 1,
        _ => return name,
    };
    let after_sep = &rest[sep_len..];
    after_sep.strip_prefix(' ').unwrap_or(after_sep)
}

/// Strips filesystem-disallowed characters and control bytes from a name
/// before it is used as the on-disk spool filename.
pub fn sanitize_filesystem_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect()
}

pub struct ChatDownloader {
    chat_client: Arc<dyn ChatClient>,
    store: Arc<dyn ObjectStore>,
    pool: SqlitePool,
    transcode: Arc<TranscodeEngine>,
    controller: Arc<PipelineController>,
    db_writer: Arc<DbWriterPool>,
    download_concurrency: usize,
}

impl ChatDownloader {
    pub fn new(
        chat_client: Arc<dyn ChatClient>,
        store: Arc<dyn ObjectStore>,
        pool: SqlitePool,
        transcode: Arc<TranscodeEngine>,
        controller: Arc<PipelineController>,
        db_writer: Arc<DbWriterPool>,
        download_concurrency: usize,
    ) -> Self {
        Self {
            chat_client,
            store,
            pool,
            transcode,
            controller,
            db_writer,
            download_concurrency: download_concurrency.max(1),
        }
    }

    /// Creates one `PENDING` artifact per message upfront, then fans out
    /// downloads across a semaphore-bounded batch. Returns the created
    /// artifact ids in message order.
    pub async fn start_batch(
        &self,
        owner: &str,
        channel_id: &str,
        message_ids: Vec<String>,
        hierarchy_path: &str,
        spool_dir: &Path,
    ) -> Result<Vec<String>> {
        let attachments = self
            .chat_client
            .list_message_attachments(channel_id, &message_ids)
            .await?;

        let mut artifact_ids = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            let kind = ArtifactKind::from_mime(&attachment.mime_type);
            let display_name = strip_ordering_prefix(&attachment.name).to_string();
            let artifact = catalog::create_pending_artifact(
                &self.pool,
                owner,
                kind,
                &display_name,
                hierarchy_path,
                Some(&attachment.mime_type),
            )
            .await?;
            artifact_ids.push(artifact.id);
        }

        let semaphore = Arc::new(Semaphore::new(self.download_concurrency));
        let mut handles = Vec::with_capacity(attachments.len());
        for (artifact_id, attachment) in artifact_ids.iter().cloned().zip(attachments.into_iter()) {
            let semaphore = Arc::clone(&semaphore);
            let channel_id = channel_id.to_string();
            let hierarchy_path = hierarchy_path.to_string();
            let spool_dir = spool_dir.to_path_buf();
            let chat_client = Arc::clone(&self.chat_client);
            let store = Arc::clone(&self.store);
            let pool = self.pool.clone();
            let transcode = Arc::clone(&self.transcode);
            let controller = Arc::clone(&self.controller);
            let db_writer = Arc::clone(&self.db_writer);

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_one_download(
                    chat_client.as_ref(),
                    store.as_ref(),
                    &pool,
                    &transcode,
                    &controller,
                    db_writer.as_ref(),
                    &channel_id,
                    &hierarchy_path,
                    &spool_dir,
                    &artifact_id,
                    &attachment,
                )
                .await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(artifact_ids)
    }

    pub fn cancel_artifact(&self, artifact_id: &str) -> bool {
        self.controller.cancel(artifact_id)
    }

    pub fn batch_speed_mbps(&self, artifact_id: &str) -> f64 {
        self.controller.speed_mbps(artifact_id)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_download(
    chat_client: &dyn ChatClient,
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    transcode: &TranscodeEngine,
    controller: &PipelineController,
    db_writer: &DbWriterPool,
    channel_id: &str,
    hierarchy_path: &str,
    spool_dir: &Path,
    artifact_id: &str,
    attachment: &ChatAttachment,
) {
    let cancel = controller.register_job(artifact_id);
    debug!(event = "job.start", artifact_id, channel = "chat", "job.start");

    let result = run_one_download_inner(
        chat_client,
        store,
        pool,
        transcode,
        controller,
        channel_id,
        hierarchy_path,
        spool_dir,
        artifact_id,
        attachment,
        &cancel,
    )
    .await;

    match result {
        Ok(()) => {
            debug!(event = "job.finish", artifact_id, status = "completed", "job.finish");
        }
        Err(Error::Cancelled) => {
            db_writer
                .submit(TerminalWrite::Canceled { artifact_id: artifact_id.to_string() })
                .await;
        }
        Err(e) => {
            db_writer
                .submit(TerminalWrite::Failed { artifact_id: artifact_id.to_string(), error: e.to_string() })
                .await;
            error!(event = "job.finish", artifact_id, status = "failed", error = %e, "job.finish");
        }
    }

    controller.clear_speed(artifact_id);
    // `TranscodeEngine::run_job` re-registers the same artifact_id with a
    // fresh token before it starts, so unregistering here is always safe
    // even when a video job is about to be picked up by C2.
    controller.unregister_job(artifact_id);
}

#[allow(clippy::too_many_arguments)]
async fn run_one_download_inner(
    chat_client: &dyn ChatClient,
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    transcode: &TranscodeEngine,
    controller: &PipelineController,
    channel_id: &str,
    hierarchy_path: &str,
    spool_dir: &Path,
    artifact_id: &str,
    attachment: &ChatAttachment,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<()> {
    catalog::set_status(pool, artifact_id, ArtifactStatus::Processing, None).await?;
    catalog::set_progress(pool, artifact_id, 5).await?;

    let kind = ArtifactKind::from_mime(&attachment.mime_type);
    let sanitized_name = sanitize_filesystem_name(strip_ordering_prefix(&attachment.name));
    let spool_path: PathBuf = spool_dir.join(format!("{artifact_id}-{sanitized_name}"));
    tokio::fs::create_dir_all(spool_dir).await?;

    let mut last_sample_at = Instant::now();
    let mut last_sample_bytes = 0u64;
    let progress_artifact_id = artifact_id.to_string();

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    chat_client
        .download_attachment(
            channel_id,
            &attachment.message_id,
            &spool_path,
            cancel,
            Box::new(move |done, total| {
                let percent = total
                    .filter(|t| *t > 0)
                    .map(|t| 5 + ((done as f64 / t as f64) * 35.0) as i64)
                    .unwrap_or(5)
                    .clamp(5, 40);
                controller.report_progress(&progress_artifact_id, percent as u8);

                let elapsed = last_sample_at.elapsed();
                if elapsed >= Duration::from_millis(500) {
                    let delta_bytes = done.saturating_sub(last_sample_bytes);
                    let bps = delta_bytes as f64 / elapsed.as_secs_f64();
                    controller.record_speed_sample(&progress_artifact_id, bps);
                    last_sample_at = Instant::now();
                    last_sample_bytes = done;
                }
            }),
        )
        .await?;

    catalog::set_progress(pool, artifact_id, 40).await?;

    if cancel.is_cancelled() {
        let _ = tokio::fs::remove_file(&spool_path).await;
        return Err(Error::Cancelled);
    }

    match kind {
        ArtifactKind::Video => {
            transcode
                .submit(TranscodeJob {
                    artifact_id: artifact_id.to_string(),
                    input_path: spool_path,
                    original_filename: attachment.name.clone(),
                    hierarchy_path: hierarchy_path.to_string(),
                })
                .await?;
            // Ownership of status/progress reporting now belongs to C2.
            Ok(())
        }
        _ => {
            let folder_id = store.ensure_path(hierarchy_path).await?;
            catalog::set_progress(pool, artifact_id, 45).await?;

            let file_id = store
                .upload_resumable(
                    &spool_path,
                    &sanitized_name,
                    &folder_id,
                    &attachment.mime_type,
                    Box::new(|_| {}),
                )
                .await?;
            catalog::set_progress(pool, artifact_id, 95).await?;

            let size_bytes = tokio::fs::metadata(&spool_path).await.ok().map(|m| m.len() as i64);
            catalog::complete_artifact(
                pool,
                artifact_id,
                &file_id,
                Some(&folder_id),
                None,
                None,
                size_bytes,
                None,
            )
            .await?;

            let _ = tokio::fs::remove_file(&spool_path).await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ordering_prefix_handles_all_forms() {
        assert_eq!(strip_ordering_prefix("123) lecture one"), "lecture one");
        assert_eq!(strip_ordering_prefix("03.intro"), "intro");
        assert_eq!(strip_ordering_prefix("1189-final exam"), "final exam");
        assert_eq!(strip_ordering_prefix("no prefix here"), "no prefix here");
    }

    #[test]
    fn sanitize_filesystem_name_strips_disallowed_characters() {
        let sanitized = sanitize_filesystem_name("weird:name/with*bad?chars\"<>|.mp4");
        assert_eq!(sanitized, "weirdnamewithbadchars.mp4");
    }
}

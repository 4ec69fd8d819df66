use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sqlx::SqlitePool;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::catalog::{self, ArtifactStatus};
use crate::db_writer::{DbWriterPool, TerminalWrite};
use crate::object_store::ObjectStore;
use crate::pipeline::PipelineController;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct MediaToolConfig {
    pub media_tool_path: PathBuf,
    pub media_probe_path: PathBuf,
}

/// A submitted unit of work for the transcode pool: a spool file ready to be
/// probed, transcoded, and uploaded under `hierarchy_path`.
pub struct TranscodeJob {
    pub artifact_id: String,
    pub input_path: PathBuf,
    pub original_filename: String,
    pub hierarchy_path: String,
}

pub struct TranscodeEngine {
    sender: mpsc::Sender<TranscodeJob>,
}

impl TranscodeEngine {
    /// Spawns `worker_count` tokio tasks draining the job queue; returns a
    /// handle to submit work plus the background task set (kept alive by the
    /// caller, typically the daemon's top-level `tokio::join!`).
    pub fn spawn(
        worker_count: usize,
        queue_capacity: usize,
        store: Arc<dyn ObjectStore>,
        pool: SqlitePool,
        media_tool: MediaToolConfig,
        controller: Arc<PipelineController>,
        db_writer: Arc<DbWriterPool>,
    ) -> (Arc<Self>, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<TranscodeJob>(queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&store);
            let pool = pool.clone();
            let media_tool = media_tool.clone();
            let controller = Arc::clone(&controller);
            let db_writer = Arc::clone(&db_writer);
            handles.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = job else { break };
                    run_job(job, store.as_ref(), &pool, &media_tool, controller.as_ref(), db_writer.as_ref()).await;
                }
            }));
        }

        (Arc::new(Self { sender: tx }), handles)
    }

    pub async fn submit(&self, job: TranscodeJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| Error::remote_store("transcode queue closed"))
    }
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

pub(crate) struct Probe {
    pub(crate) duration_seconds: Option<f64>,
    pub(crate) has_audio: bool,
}

pub(crate) async fn probe_media(media_probe_path: &Path, input: &Path) -> Result<Probe> {
    let output = timeout(
        Duration::from_secs(30),
        Command::new(media_probe_path)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-show_entries",
                "stream=codec_type",
                "-of",
                "json",
            ])
            .arg(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| Error::transcode("probe timed out after 30s"))??;

    if !output.status.success() {
        return Err(Error::transcode(format!(
            "probe exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .map_err(|e| Error::transcode(format!("probe produced invalid json: {e}")))?;

    let duration_seconds = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok());
    let has_audio = parsed.streams.iter().any(|s| s.codec_type == "audio");

    Ok(Probe {
        duration_seconds,
        has_audio,
    })
}

async fn run_ffmpeg(
    media_tool_path: &Path,
    args: &[std::ffi::OsString],
    timeout_secs: u64,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut child = Command::new(media_tool_path)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stderr = child.stderr.take();
    let wait = async {
        let status = child.wait().await?;
        let mut tail = String::new();
        if let Some(mut stderr) = stderr.take() {
            let _ = stderr.read_to_string(&mut tail).await;
        }
        Ok::<_, std::io::Error>((status, tail))
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(Error::Cancelled);
        }
        res = timeout(Duration::from_secs(timeout_secs), wait) => res,
    };

    let (status, tail) = outcome
        .map_err(|_| Error::transcode(format!("media tool timed out after {timeout_secs}s")))??;

    if !status.success() {
        let capped: String = tail.chars().rev().take(2000).collect::<Vec<_>>().into_iter().rev().collect();
        return Err(Error::transcode(format!("media tool exited with {status}: {capped}")));
    }
    Ok(())
}

fn osstr(s: impl Into<String>) -> std::ffi::OsString {
    std::ffi::OsString::from(s.into())
}

pub(crate) async fn generate_thumbnail(
    media_tool_path: &Path,
    input: &Path,
    output: &Path,
    at_seconds: f64,
    cancel: &CancellationToken,
) -> Result<()> {
    let args = vec![
        osstr("-y"),
        osstr("-ss"),
        osstr(format!("{at_seconds}")),
        osstr("-i"),
        input.as_os_str().to_owned(),
        osstr("-frames:v"),
        osstr("1"),
        osstr("-vf"),
        osstr("scale=640:-1"),
        osstr("-q:v"),
        osstr("2"),
        output.as_os_str().to_owned(),
    ];
    run_ffmpeg(media_tool_path, &args, 30, cancel).await
}

pub(crate) async fn generate_preview(
    media_tool_path: &Path,
    input: &Path,
    output: &Path,
    start_seconds: f64,
    length_seconds: f64,
    cancel: &CancellationToken,
) -> Result<()> {
    let args = vec![
        osstr("-y"),
        osstr("-ss"),
        osstr(format!("{start_seconds}")),
        osstr("-i"),
        input.as_os_str().to_owned(),
        osstr("-t"),
        osstr(format!("{length_seconds}")),
        osstr("-an"),
        osstr("-vf"),
        osstr("scale=480:-1"),
        osstr("-preset"),
        osstr("ultrafast"),
        osstr("-movflags"),
        osstr("+faststart"),
        output.as_os_str().to_owned(),
    ];
    run_ffmpeg(media_tool_path, &args, 60, cancel).await
}

/// The fixed 2x speed transform: video timebase halved, audio retimed and
/// re-encoded when present. Unbounded duration, but the subprocess is killed
/// promptly if the job's cancel token fires mid-run.
async fn transcode_2x(
    media_tool_path: &Path,
    input: &Path,
    output: &Path,
    has_audio: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut args = vec![
        osstr("-y"),
        osstr("-i"),
        input.as_os_str().to_owned(),
        osstr("-threads"),
        osstr("0"),
        osstr("-preset"),
        osstr("superfast"),
        osstr("-crf"),
        osstr("28"),
    ];

    if has_audio {
        args.push(osstr("-filter_complex"));
        args.push(osstr("[0:v]setpts=0.5*PTS[v];[0:a]atempo=2.0[a]"));
        args.push(osstr("-map"));
        args.push(osstr("[v]"));
        args.push(osstr("-map"));
        args.push(osstr("[a]"));
        args.push(osstr("-c:a"));
        args.push(osstr("aac"));
        args.push(osstr("-b:a"));
        args.push(osstr("128k"));
    } else {
        args.push(osstr("-filter_complex"));
        args.push(osstr("[0:v]setpts=0.5*PTS[v]"));
        args.push(osstr("-map"));
        args.push(osstr("[v]"));
    }

    args.push(osstr("-movflags"));
    args.push(osstr("+faststart"));
    args.push(output.as_os_str().to_owned());

    run_ffmpeg(media_tool_path, &args, 3600, cancel).await
}

async fn run_job(
    job: TranscodeJob,
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    media_tool: &MediaToolConfig,
    controller: &PipelineController,
    db_writer: &DbWriterPool,
) {
    let artifact_id = job.artifact_id.clone();
    let cancel = controller.register_job(&artifact_id);

    debug!(event = "job.start", artifact_id = %artifact_id, "job.start");
    let result = run_job_inner(&job, store, pool, media_tool, &cancel, controller).await;

    match result {
        Ok(()) => {
            debug!(event = "job.finish", artifact_id = %artifact_id, status = "completed", "job.finish");
        }
        Err(Error::Cancelled) => {
            db_writer
                .submit(TerminalWrite::Canceled { artifact_id: artifact_id.clone() })
                .await;
            debug!(event = "job.finish", artifact_id = %artifact_id, status = "canceled", "job.finish");
        }
        Err(e) => {
            db_writer
                .submit(TerminalWrite::Failed { artifact_id: artifact_id.clone(), error: e.to_string() })
                .await;
            error!(event = "job.finish", artifact_id = %artifact_id, status = "failed", error = %e, "job.finish");
        }
    }

    let _ = tokio::fs::remove_file(&job.input_path).await;
    controller.unregister_job(&artifact_id);
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

async fn run_job_inner(
    job: &TranscodeJob,
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    media_tool: &MediaToolConfig,
    cancel: &CancellationToken,
    controller: &PipelineController,
) -> Result<()> {
    let report = |percent: i64| {
        controller.report_progress(&job.artifact_id, percent as u8);
    };

    catalog::set_status(pool, &job.artifact_id, ArtifactStatus::Processing, None).await?;
    catalog::set_progress(pool, &job.artifact_id, 5).await?;
    report(5);

    check_cancel(cancel)?;
    let probe = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        probe = probe_media(&media_tool.media_probe_path, &job.input_path) => probe?,
    };

    let work_dir = job
        .input_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let stem = Path::new(&job.original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact")
        .to_string();

    let thumbnail_path = work_dir.join(format!("{}.thumb.jpg", job.artifact_id));
    let preview_path = work_dir.join(format!("{}.preview.mp4", job.artifact_id));
    let transcoded_path = work_dir.join(format!("{}.out.mp4", job.artifact_id));

    let thumb_at = if probe.duration_seconds.unwrap_or(2.0) > 1.0 { 1.0 } else { 0.0 };
    check_cancel(cancel)?;
    generate_thumbnail(&media_tool.media_tool_path, &job.input_path, &thumbnail_path, thumb_at, cancel).await?;
    catalog::set_progress(pool, &job.artifact_id, 10).await?;
    report(10);

    let preview_len = probe
        .duration_seconds
        .map(|d| (5.0_f64).min((d - thumb_at).max(0.5)))
        .unwrap_or(5.0);
    check_cancel(cancel)?;
    generate_preview(&media_tool.media_tool_path, &job.input_path, &preview_path, thumb_at, preview_len, cancel).await?;

    check_cancel(cancel)?;
    transcode_2x(&media_tool.media_tool_path, &job.input_path, &transcoded_path, probe.has_audio, cancel).await?;
    catalog::set_progress(pool, &job.artifact_id, 40).await?;
    report(40);

    check_cancel(cancel)?;
    let folder_name = format!("{}/{}", job.hierarchy_path, stem);
    let folder_id = store.ensure_path(&folder_name).await?;
    catalog::set_progress(pool, &job.artifact_id, 42).await?;
    report(42);

    check_cancel(cancel)?;
    let primary_name = format!("Processed_{}", job.original_filename);
    let primary_id = store
        .upload_resumable(&transcoded_path, &primary_name, &folder_id, "video/mp4", Box::new(|_| {}))
        .await?;
    catalog::set_progress(pool, &job.artifact_id, 90).await?;
    report(90);

    check_cancel(cancel)?;
    let thumbnail_id = store
        .upload_resumable(&thumbnail_path, "thumbnail.jpg", &folder_id, "image/jpeg", Box::new(|_| {}))
        .await?;
    catalog::set_progress(pool, &job.artifact_id, 95).await?;
    report(95);

    check_cancel(cancel)?;
    let preview_id = store
        .upload_resumable(&preview_path, "preview.mp4", &folder_id, "video/mp4", Box::new(|_| {}))
        .await?;
    catalog::set_progress(pool, &job.artifact_id, 98).await?;
    report(98);

    let final_duration = probe.duration_seconds.map(|d| d / 2.0);
    let size_bytes = tokio::fs::metadata(&transcoded_path).await.ok().map(|m| m.len() as i64);

    catalog::complete_artifact(
        pool,
        &job.artifact_id,
        &primary_id,
        Some(&folder_id),
        Some(&thumbnail_id),
        Some(&preview_id),
        size_bytes,
        final_duration,
    )
    .await?;
    report(100);

    let _ = tokio::fs::remove_file(&thumbnail_path).await;
    let _ = tokio::fs::remove_file(&preview_path).await;
    let _ = tokio::fs::remove_file(&transcoded_path).await;

    Ok(())
}


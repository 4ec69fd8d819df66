use std::path::PathBuf;
use std::sync::Arc;

use mediavault_core::{ControlError, ControlRequest, ControlResponse, Pipeline};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, oneshot};

pub struct ControlIpcServerHandle {
    socket_path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for ControlIpcServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

pub fn spawn_control_ipc_server(
    socket_path: PathBuf,
    pipeline: Arc<Pipeline>,
) -> std::io::Result<ControlIpcServerHandle> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let listener = UnixListener::bind(&socket_path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600)) {
            drop(listener);
            let _ = std::fs::remove_file(&socket_path);
            return Err(e);
        }
    }

    let handle_socket_path = socket_path.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let (shutdown_broadcast, _) = broadcast::channel::<()>(8);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    let _ = shutdown_broadcast.send(());
                    break;
                }
                accept = listener.accept() => {
                    let (stream, _) = match accept {
                        Ok(x) => x,
                        Err(e) => {
                            tracing::warn!(event = "control.ipc_accept_failed", error = %e, "control.ipc_accept_failed");
                            continue;
                        }
                    };

                    let mut shutdown = shutdown_broadcast.subscribe();
                    let pipeline = Arc::clone(&pipeline);
                    tokio::spawn(async move {
                        let _ = handle_control_ipc_client(stream, pipeline, &mut shutdown).await;
                    });
                }
            }
        }
    });

    Ok(ControlIpcServerHandle {
        socket_path: handle_socket_path,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

const MAX_REQUEST_LINE_BYTES: usize = 64 * 1024;

async fn handle_control_ipc_client(
    stream: UnixStream,
    pipeline: Arc<Pipeline>,
    shutdown: &mut broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let (r, w) = stream.into_split();
    let mut r = BufReader::new(r);
    let mut w = BufWriter::new(w);

    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if buf.len() > MAX_REQUEST_LINE_BYTES {
            break;
        }
        tokio::select! {
            res = r.read(&mut chunk) => {
                let n = res?;
                if n == 0 {
                    break;
                }
                if let Some(pos) = chunk[..n].iter().position(|b| *b == b'\n') {
                    buf.extend_from_slice(&chunk[..pos]);
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }

    if buf.is_empty() {
        return Ok(());
    }
    if buf.len() > MAX_REQUEST_LINE_BYTES {
        write_json_line(
            &mut w,
            &ControlResponse::err("unknown", ControlError::invalid_request("request too large", serde_json::json!({}))),
        )
        .await?;
        return Ok(());
    }

    let line = match String::from_utf8(buf) {
        Ok(s) => s,
        Err(_) => {
            write_json_line(
                &mut w,
                &ControlResponse::err("unknown", ControlError::invalid_request("invalid utf-8", serde_json::json!({}))),
            )
            .await?;
            return Ok(());
        }
    };

    let req: ControlRequest = match serde_json::from_str(line.trim_end()) {
        Ok(x) => x,
        Err(e) => {
            write_json_line(
                &mut w,
                &ControlResponse::err(
                    "unknown",
                    ControlError::invalid_request("invalid json", serde_json::json!({ "error": e.to_string() })),
                ),
            )
            .await?;
            return Ok(());
        }
    };

    let resp = handle_request(&req, &pipeline).await;
    write_json_line(&mut w, &resp).await?;
    Ok(())
}

async fn handle_request(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    if req.type_ != "control.request" || req.id.trim().is_empty() || req.method.trim().is_empty() {
        return ControlResponse::err(
            req.id.clone(),
            ControlError::invalid_request(
                "invalid request envelope",
                serde_json::json!({ "type": req.type_, "method": req.method }),
            ),
        );
    }

    match req.method.as_str() {
        "UploadChunk" => dispatch_upload_chunk(req, pipeline).await,
        "CompleteUpload" => dispatch_complete_upload(req, pipeline).await,
        "AbortUpload" => dispatch_abort_upload(req, pipeline).await,
        "ListArtifacts" => dispatch_list_artifacts(req, pipeline).await,
        "GetArtifact" => dispatch_get_artifact(req, pipeline).await,
        "DeleteArtifact" => dispatch_delete_artifact(req, pipeline).await,
        "AbortArtifact" => dispatch_abort_artifact(req, pipeline).await,
        "RenameArtifact" => dispatch_rename_artifact(req, pipeline).await,
        "ReconcileScope" => dispatch_reconcile_scope(req, pipeline).await,
        "ChatBatch" => dispatch_chat_batch(req, pipeline).await,
        "CancelBatch" => dispatch_cancel_batch(req, pipeline),
        "BatchSpeed" => dispatch_batch_speed(req, pipeline),
        other => ControlResponse::err(
            req.id.clone(),
            ControlError::method_not_found(format!("unknown method {other}"), serde_json::json!({})),
        ),
    }
}

#[derive(serde::Deserialize)]
struct UploadChunkParams {
    owner: String,
    upload_id: String,
    chunk_index: usize,
    filename: String,
    #[serde(with = "base64_bytes")]
    bytes: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer};

    // The control protocol carries chunk bytes inline as base64 JSON strings
    // rather than multipart, so only the decode direction is needed here.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

async fn dispatch_upload_chunk(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: UploadChunkParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline
        .append_chunk(&params.owner, &params.upload_id, params.chunk_index, &params.filename, &params.bytes)
        .await
    {
        Ok(uploaded_index) => ControlResponse::ok(req.id.clone(), serde_json::json!({ "uploaded_index": uploaded_index })),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct CompleteUploadParams {
    owner: String,
    upload_id: String,
    filename: String,
    total_chunks: usize,
    hierarchy_path: String,
}

async fn dispatch_complete_upload(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: CompleteUploadParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline
        .complete_upload(&params.owner, &params.upload_id, &params.filename, params.total_chunks, &params.hierarchy_path)
        .await
    {
        Ok(artifact_id) => {
            ControlResponse::ok(req.id.clone(), serde_json::json!({ "artifact_id": artifact_id, "status": "PENDING" }))
        }
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct AbortUploadParams {
    owner: String,
    upload_id: String,
}

async fn dispatch_abort_upload(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: AbortUploadParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline.abort_upload(&params.owner, &params.upload_id).await {
        Ok(()) => ControlResponse::ok(req.id.clone(), serde_json::json!({})),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct ListArtifactsParams {
    owner: String,
    hierarchy_path_prefix: Option<String>,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

async fn dispatch_list_artifacts(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ListArtifactsParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline
        .list_artifacts(&params.owner, params.hierarchy_path_prefix.as_deref(), params.page, params.page_size)
        .await
    {
        Ok((results, total)) => ControlResponse::ok(
            req.id.clone(),
            serde_json::json!({
                "results": results,
                "total": total,
                "page": params.page.max(1),
                "page_size": params.page_size.clamp(1, 100),
            }),
        ),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct ArtifactIdParams {
    artifact_id: String,
}

async fn dispatch_get_artifact(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ArtifactIdParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline.get_artifact(&params.artifact_id).await {
        Ok(artifact) => ControlResponse::ok(req.id.clone(), serde_json::to_value(artifact).unwrap_or(serde_json::json!({}))),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

async fn dispatch_delete_artifact(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ArtifactIdParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline.delete_artifact(&params.artifact_id).await {
        Ok(()) => ControlResponse::ok(req.id.clone(), serde_json::json!({})),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

async fn dispatch_abort_artifact(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ArtifactIdParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline.abort_artifact(&params.artifact_id).await {
        Ok(cancelled) => ControlResponse::ok(req.id.clone(), serde_json::json!({ "cancelled": cancelled })),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct RenameArtifactParams {
    artifact_id: String,
    new_title: String,
}

async fn dispatch_rename_artifact(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: RenameArtifactParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline.rename_artifact(&params.artifact_id, &params.new_title).await {
        Ok(()) => ControlResponse::ok(req.id.clone(), serde_json::json!({})),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct ReconcileScopeParams {
    owner: String,
    hierarchy_paths: Vec<String>,
    #[serde(default = "default_reconcile_concurrency")]
    concurrency: usize,
}

fn default_reconcile_concurrency() -> usize {
    4
}

async fn dispatch_reconcile_scope(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ReconcileScopeParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    let reports = pipeline.reconcile_scope(&params.owner, params.hierarchy_paths, params.concurrency).await;

    // ReconcileReport tracks removed/purged counts per path, not split by
    // video/pdf kind, so both removal counters below report the same total.
    let mut videos_added = 0u64;
    let mut removed = 0u64;
    let mut pdfs_added = 0u64;
    let mut errors = Vec::new();
    for (path, result) in reports {
        match result {
            Ok(report) => {
                videos_added += report.imported_videos;
                pdfs_added += report.imported_pdfs;
                removed += report.removed_missing + report.purged;
            }
            Err(e) => errors.push(format!("{path}: {e}")),
        }
    }

    ControlResponse::ok(
        req.id.clone(),
        serde_json::json!({
            "videos_added": videos_added,
            "videos_removed": removed,
            "pdfs_added": pdfs_added,
            "pdfs_removed": removed,
            "errors": errors,
        }),
    )
}

#[derive(serde::Deserialize)]
struct ChatBatchParams {
    owner: String,
    channel_id: String,
    message_ids: Vec<String>,
    hierarchy_path: String,
}

async fn dispatch_chat_batch(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ChatBatchParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    match pipeline
        .chat_batch(&params.owner, &params.channel_id, params.message_ids, &params.hierarchy_path)
        .await
    {
        Ok(artifact_ids) => ControlResponse::ok(req.id.clone(), serde_json::json!(artifact_ids)),
        Err(e) => ControlResponse::err(req.id.clone(), ControlError::from_error(&e)),
    }
}

#[derive(serde::Deserialize)]
struct ArtifactIdsParams {
    artifact_ids: Vec<String>,
}

fn dispatch_cancel_batch(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ArtifactIdsParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    let cancelled_count = pipeline.cancel_batch(&params.artifact_ids);
    ControlResponse::ok(req.id.clone(), serde_json::json!({ "cancelled_count": cancelled_count }))
}

fn dispatch_batch_speed(req: &ControlRequest, pipeline: &Pipeline) -> ControlResponse {
    let params: ArtifactIdsParams = match serde_json::from_value(req.params.clone()) {
        Ok(p) => p,
        Err(e) => return invalid_params(req, e),
    };
    let speeds = pipeline.batch_speed(&params.artifact_ids);
    let map: serde_json::Map<String, serde_json::Value> =
        speeds.into_iter().map(|(id, mbps)| (id, serde_json::json!(mbps))).collect();
    ControlResponse::ok(req.id.clone(), serde_json::Value::Object(map))
}

fn invalid_params(req: &ControlRequest, e: serde_json::Error) -> ControlResponse {
    ControlResponse::err(
        req.id.clone(),
        ControlError::invalid_request("invalid params", serde_json::json!({ "error": e.to_string() })),
    )
}

async fn write_json_line<W: AsyncWriteExt + Unpin>(w: &mut W, resp: &ControlResponse) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(resp).unwrap_or_default();
    line.push(b'\n');
    w.write_all(&line).await?;
    w.flush().await
}

use std::path::PathBuf;

use base64::Engine;
use clap::{Parser, Subcommand};
use mediavault_core::{control_socket_path, ControlRequest, ControlResponse};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "mediavault")]
#[command(about = "MediaVault CLI", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    UploadChunk {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        upload_id: String,
        #[arg(long)]
        chunk_index: usize,
        #[arg(long)]
        filename: String,
        #[arg(long)]
        file: PathBuf,
    },
    CompleteUpload {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        upload_id: String,
        #[arg(long)]
        filename: String,
        #[arg(long)]
        total_chunks: usize,
        #[arg(long)]
        hierarchy_path: String,
    },
    AbortUpload {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        upload_id: String,
    },
    ListArtifacts {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        hierarchy_path_prefix: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 50)]
        page_size: i64,
    },
    GetArtifact {
        artifact_id: String,
    },
    DeleteArtifact {
        artifact_id: String,
    },
    AbortArtifact {
        artifact_id: String,
    },
    RenameArtifact {
        artifact_id: String,
        #[arg(long)]
        new_title: String,
    },
    ReconcileScope {
        #[arg(long)]
        owner: String,
        #[arg(long, value_delimiter = ',')]
        hierarchy_paths: Vec<String>,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
    ChatBatch {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        channel_id: String,
        #[arg(long, value_delimiter = ',')]
        message_ids: Vec<String>,
        #[arg(long)]
        hierarchy_path: String,
    },
    CancelBatch {
        #[arg(long, value_delimiter = ',')]
        artifact_ids: Vec<String>,
    },
    BatchSpeed {
        #[arg(long, value_delimiter = ',')]
        artifact_ids: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let socket_path = cli.socket.clone().unwrap_or_else(|| {
        let data_dir = cli.data_dir.clone().unwrap_or_else(|| PathBuf::from("."));
        control_socket_path(&data_dir)
    });

    let (method, params) = match cli.cmd {
        Command::UploadChunk {
            owner,
            upload_id,
            chunk_index,
            filename,
            file,
        } => {
            let bytes = std::fs::read(&file).map_err(|e| {
                CliError::new("io.read_failed", format!("failed to read {file:?}: {e}"))
            })?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            (
                "UploadChunk",
                serde_json::json!({
                    "owner": owner,
                    "uploadId": upload_id,
                    "chunkIndex": chunk_index,
                    "filename": filename,
                    "bytes": encoded,
                }),
            )
        }
        Command::CompleteUpload {
            owner,
            upload_id,
            filename,
            total_chunks,
            hierarchy_path,
        } => (
            "CompleteUpload",
            serde_json::json!({
                "owner": owner,
                "uploadId": upload_id,
                "filename": filename,
                "totalChunks": total_chunks,
                "hierarchyPath": hierarchy_path,
            }),
        ),
        Command::AbortUpload { owner, upload_id } => (
            "AbortUpload",
            serde_json::json!({ "owner": owner, "uploadId": upload_id }),
        ),
        Command::ListArtifacts {
            owner,
            hierarchy_path_prefix,
            page,
            page_size,
        } => (
            "ListArtifacts",
            serde_json::json!({
                "owner": owner,
                "hierarchyPathPrefix": hierarchy_path_prefix,
                "page": page,
                "pageSize": page_size,
            }),
        ),
        Command::GetArtifact { artifact_id } => {
            ("GetArtifact", serde_json::json!({ "artifactId": artifact_id }))
        }
        Command::DeleteArtifact { artifact_id } => (
            "DeleteArtifact",
            serde_json::json!({ "artifactId": artifact_id }),
        ),
        Command::AbortArtifact { artifact_id } => (
            "AbortArtifact",
            serde_json::json!({ "artifactId": artifact_id }),
        ),
        Command::RenameArtifact {
            artifact_id,
            new_title,
        } => (
            "RenameArtifact",
            serde_json::json!({ "artifactId": artifact_id, "newTitle": new_title }),
        ),
        Command::ReconcileScope {
            owner,
            hierarchy_paths,
            concurrency,
        } => (
            "ReconcileScope",
            serde_json::json!({
                "owner": owner,
                "hierarchyPaths": hierarchy_paths,
                "concurrency": concurrency,
            }),
        ),
        Command::ChatBatch {
            owner,
            channel_id,
            message_ids,
            hierarchy_path,
        } => (
            "ChatBatch",
            serde_json::json!({
                "owner": owner,
                "channelId": channel_id,
                "messageIds": message_ids,
                "hierarchyPath": hierarchy_path,
            }),
        ),
        Command::CancelBatch { artifact_ids } => (
            "CancelBatch",
            serde_json::json!({ "artifactIds": artifact_ids }),
        ),
        Command::BatchSpeed { artifact_ids } => (
            "BatchSpeed",
            serde_json::json!({ "artifactIds": artifact_ids }),
        ),
    };

    let resp = control_call(&socket_path, method, params).await?;
    let out = serde_json::to_string(&resp)
        .map_err(|e| CliError::new("cli.encode_failed", e.to_string()))?;
    println!("{out}");

    if resp.ok {
        Ok(())
    } else {
        let err = resp.error.unwrap_or(mediavault_core::ControlError {
            code: "unknown".to_string(),
            message: "request failed".to_string(),
            retryable: false,
            details: serde_json::json!({}),
        });
        Err(CliError {
            code: "daemon.error",
            message: err.message,
            details: serde_json::json!({ "code": err.code }),
            retryable: err.retryable,
        })
    }
}

async fn control_call(
    socket_path: &std::path::Path,
    method: &str,
    params: serde_json::Value,
) -> Result<ControlResponse, CliError> {
    let stream = UnixStream::connect(socket_path).await.map_err(|e| {
        CliError::retryable("daemon.unavailable", "control socket unavailable").with_details(
            serde_json::json!({
                "socketPath": socket_path.display().to_string(),
                "error": e.to_string(),
            }),
        )
    })?;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request_id = uuid::Uuid::new_v4().to_string();
    let request = ControlRequest::new(request_id, method, params);
    let line = serde_json::to_string(&request)
        .map_err(|e| CliError::new("cli.encode_failed", e.to_string()))?;

    write_half.write_all(line.as_bytes()).await.map_err(|e| {
        CliError::retryable("daemon.unavailable", "control socket write failed")
            .with_details(serde_json::json!({ "error": e.to_string() }))
    })?;
    write_half.write_all(b"\n").await.map_err(|e| {
        CliError::retryable("daemon.unavailable", "control socket write failed")
            .with_details(serde_json::json!({ "error": e.to_string() }))
    })?;
    write_half.flush().await.map_err(|e| {
        CliError::retryable("daemon.unavailable", "control socket flush failed")
            .with_details(serde_json::json!({ "error": e.to_string() }))
    })?;

    let mut resp_line = String::new();
    reader.read_line(&mut resp_line).await.map_err(|e| {
        CliError::retryable("daemon.unavailable", "control socket read failed")
            .with_details(serde_json::json!({ "error": e.to_string() }))
    })?;

    serde_json::from_str(resp_line.trim_end())
        .map_err(|e| CliError::new("daemon.unavailable", format!("invalid control response: {e}")))
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| {
        "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}"
            .to_string()
    });
    eprintln!("{json}");
}

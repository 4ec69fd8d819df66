use std::path::PathBuf;
use std::sync::Arc;

use mediavault_core::{
    catalog, control_socket_path, init_logging, ChatDownloader, DbWriterPool, HttpChatClient,
    HttpChatClientConfig, HttpObjectStore, HttpObjectStoreConfig, MediaToolConfig, ObjectStore, Pipeline,
    PipelineController, Settings, SpoolManager, TranscodeEngine,
};

mod control_ipc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::var("MEDIAVAULT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./mediavault.toml"));

    let settings = Settings::load(&config_path)?;
    init_logging(settings.logging.log_format == "json");

    tracing::info!(event = "daemon.start", config_path = %config_path.display(), "daemon.start");

    let pool = catalog::open_catalog_db(&settings.catalog.db_path).await?;

    let interrupted = catalog::sweep_interrupted_jobs(&pool).await?;
    if interrupted > 0 {
        tracing::warn!(event = "catalog.sweep_interrupted", count = interrupted, "catalog.sweep_interrupted");
    }

    let spool = SpoolManager::new(
        settings.spool.spool_dir.clone(),
        std::time::Duration::from_secs(settings.spool.spool_ttl_seconds),
        settings.limits.max_upload_size_bytes,
    );
    let swept = spool.sweep_expired().await;
    if swept > 0 {
        tracing::info!(event = "spool.startup_sweep", count = swept, "spool.startup_sweep");
    }

    let object_store_api_token = std::fs::read_to_string(&settings.object_store.credentials_path)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(HttpObjectStoreConfig {
        base_url: settings.object_store.base_url.clone(),
        api_token: object_store_api_token,
    }));

    let controller = Arc::new(PipelineController::new());
    let media_tool = MediaToolConfig {
        media_tool_path: settings.media_tool.media_tool_path.clone(),
        media_probe_path: settings.media_tool.media_probe_path.clone(),
    };

    let (db_writer, db_writer_handles) = DbWriterPool::spawn(pool.clone(), settings.workers.db_writer_workers);

    let (transcode, transcode_handles) = TranscodeEngine::spawn(
        settings.workers.transcode_workers,
        settings.workers.transcode_workers * 4,
        Arc::clone(&store),
        pool.clone(),
        media_tool.clone(),
        Arc::clone(&controller),
        Arc::clone(&db_writer),
    );

    let chat_api_token = std::env::var(&settings.chat.api_token_env).unwrap_or_default();
    let chat_client = Arc::new(HttpChatClient::new(HttpChatClientConfig {
        base_url: settings.chat.base_url.clone(),
        api_token: chat_api_token,
    }));
    let chat = Arc::new(ChatDownloader::new(
        chat_client,
        Arc::clone(&store),
        pool.clone(),
        Arc::clone(&transcode),
        Arc::clone(&controller),
        Arc::clone(&db_writer),
        settings.workers.download_concurrency,
    ));

    let pipeline = Arc::new(Pipeline {
        store,
        pool,
        spool,
        transcode,
        chat,
        controller,
        media_tool,
    });

    let socket_path = control_socket_path_from_settings(&settings);
    let _control_server = control_ipc::spawn_control_ipc_server(socket_path.clone(), Arc::clone(&pipeline))?;
    tracing::info!(event = "control.listening", path = %socket_path.display(), "control.listening");

    for handle in transcode_handles.into_iter().chain(db_writer_handles) {
        let _ = handle.await;
    }

    Ok(())
}

fn control_socket_path_from_settings(settings: &Settings) -> PathBuf {
    if settings.control.control_socket_path.as_os_str().is_empty() {
        control_socket_path(&settings.catalog.db_path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf())
    } else {
        settings.control.control_socket_path.clone()
    }
}

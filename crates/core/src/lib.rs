mod catalog;
mod chat;
mod config;
mod control;
mod db_writer;
mod error;
mod facade;
mod logging;
mod object_store;
mod pipeline;
mod reconcile;
mod spool;
mod streaming;
mod transcode;

pub const APP_NAME: &str = "MediaVault";

pub use catalog::{
    complete_artifact, create_pending_artifact, delete_all_for_path, delete_artifact,
    find_by_remote_file_id, get_artifact, list_artifacts, list_by_hierarchy_path_and_kind,
    new_artifact_id, open_catalog_db, rename_artifact, set_progress, set_size_and_mime,
    set_status, sweep_interrupted_jobs, Artifact, ArtifactKind, ArtifactStatus,
};
pub use chat::{
    sanitize_filesystem_name, strip_ordering_prefix, ChatAttachment, ChatClient, ChatDownloader,
    HttpChatClient, HttpChatClientConfig,
};
pub use config::{Settings, SETTINGS_SCHEMA_VERSION};
pub use control::{control_socket_path, ControlError, ControlRequest, ControlResponse};
pub use db_writer::{DbWriterPool, TerminalWrite};
pub use error::{Error, Result};
pub use facade::Pipeline;
pub use logging::init_logging;
pub use object_store::{
    BareChild, ByteStream, Child, ChildKind, HttpObjectStore, HttpObjectStoreConfig,
    InMemoryObjectStore, Metadata, ObjectStore, ProgressCb, WrappedChild,
};
pub use pipeline::PipelineController;
pub use reconcile::{reconcile_path, reconcile_scope, ReconcileReport};
pub use spool::SpoolManager;
pub use streaming::{
    serve_asset, serve_range, AssetKind, AssetResponse, ContentRange, RangeResponse, RequestedRange,
};
pub use transcode::{MediaToolConfig, TranscodeEngine, TranscodeJob};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Video,
    Pdf,
    Any,
}

#[derive(Debug, Clone)]
pub struct BareChild {
    pub file_id: String,
    pub name: String,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WrappedChild {
    pub folder_id: String,
    pub primary_file_id: String,
    pub primary_name: String,
    pub thumbnail_file_id: Option<String>,
    pub preview_file_id: Option<String>,
}

/// A folder's direct child is either a bare file, or a per-artifact folder
/// wrapping a primary file plus its derived assets. Consumers are expected to
/// match both arms rather than probe optional fields.
#[derive(Debug, Clone)]
pub enum Child {
    Bare(BareChild),
    Wrapped(WrappedChild),
}

#[derive(Debug, Clone)]
pub struct Metadata {
    pub size: u64,
    pub mime_type: Option<String>,
}

pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'a>>;
pub type ProgressCb<'a> = Box<dyn Fn(f64) + Send + Sync + 'a>;

/// Object-safe adapter over a remote folder/blob store. Every write is
/// expected to be idempotent on the caller's side: callers tolerate both a
/// "created before crash, retried after" double-create and a
/// delete-nonexistent no-op.
pub trait ObjectStore: Send + Sync {
    fn provider(&self) -> &'static str;

    fn resolve_path<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    fn ensure_path<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn list_children<'a>(
        &'a self,
        folder_id: &'a str,
        kind_filter: ChildKind,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Child>>> + Send + 'a>>;

    fn upload_resumable<'a>(
        &'a self,
        local_path: &'a std::path::Path,
        name: &'a str,
        parent_folder_id: &'a str,
        mime_type: &'a str,
        progress_cb: ProgressCb<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn download_range<'a>(
        &'a self,
        file_id: &'a str,
        start: u64,
        end: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream<'a>>> + Send + 'a>>;

    fn get_metadata<'a>(
        &'a self,
        file_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Metadata>> + Send + 'a>>;

    fn exists<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    fn rename<'a>(
        &'a self,
        id: &'a str,
        new_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn move_to<'a>(
        &'a self,
        file_id: &'a str,
        new_parent: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn delete_file<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn delete_folder<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct HttpObjectStoreConfig {
    pub base_url: String,
    pub api_token: String,
}

/// A bot-API-style HTTP backend: multipart upload, ranged GET download.
pub struct HttpObjectStore {
    config: HttpObjectStoreConfig,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(config: HttpObjectStoreConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderResult {
    folder_id: String,
}

#[derive(Debug, Deserialize)]
struct FileResult {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct MetadataResult {
    size: u64,
    mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildrenResult {
    children: Vec<WireChild>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireChild {
    Bare {
        file_id: String,
        name: String,
        mime_type: Option<String>,
    },
    Wrapped {
        folder_id: String,
        primary_file_id: String,
        primary_name: String,
        primary_mime_type: Option<String>,
        thumbnail_file_id: Option<String>,
        preview_file_id: Option<String>,
    },
}

fn child_kind_matches(mime_type: Option<&str>, kind_filter: ChildKind) -> bool {
    match kind_filter {
        ChildKind::Any => true,
        ChildKind::Video => mime_type.is_some_and(|m| m.starts_with("video/")),
        ChildKind::Pdf => mime_type == Some("application/pdf"),
    }
}

impl ObjectStore for HttpObjectStore {
    fn provider(&self) -> &'static str {
        "http.objectstore"
    }

    fn resolve_path<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/resolve", self.config.base_url);
            let res = self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .query(&[("path", path)])
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("resolve_path request failed: {e}")))?;

            if res.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|e| Error::remote_store(format!("resolve_path read failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::remote_store(format!("resolve_path http {status}: {body}")));
            }
            let parsed: ApiResponse<FolderResult> = serde_json::from_str(&body)
                .map_err(|e| Error::remote_store(format!("resolve_path invalid json: {e}")))?;
            if !parsed.ok {
                return Ok(None);
            }
            Ok(parsed.result.map(|r| r.folder_id))
        })
    }

    fn ensure_path<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/ensure_path", self.config.base_url);
            let res = self
                .client
                .post(url)
                .bearer_auth(&self.config.api_token)
                .json(&serde_json::json!({ "path": path }))
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("ensure_path request failed: {e}")))?;

            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|e| Error::remote_store(format!("ensure_path read failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::remote_store(format!("ensure_path http {status}: {body}")));
            }
            let parsed: ApiResponse<FolderResult> = serde_json::from_str(&body)
                .map_err(|e| Error::remote_store(format!("ensure_path invalid json: {e}")))?;
            parsed
                .result
                .map(|r| r.folder_id)
                .ok_or_else(|| Error::remote_store(parsed.description.unwrap_or_default()))
        })
    }

    fn list_children<'a>(
        &'a self,
        folder_id: &'a str,
        kind_filter: ChildKind,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Child>>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/children", self.config.base_url);
            let res = self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .query(&[("folder_id", folder_id)])
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("list_children request failed: {e}")))?;
            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|e| Error::remote_store(format!("list_children read failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::remote_store(format!("list_children http {status}: {body}")));
            }
            let parsed: ApiResponse<ChildrenResult> = serde_json::from_str(&body)
                .map_err(|e| Error::remote_store(format!("list_children invalid json: {e}")))?;
            let children = parsed.result.map(|r| r.children).unwrap_or_default();

            let mut out = Vec::with_capacity(children.len());
            for child in children {
                match child {
                    WireChild::Bare { file_id, name, mime_type } => {
                        if child_kind_matches(mime_type.as_deref(), kind_filter) {
                            out.push(Child::Bare(BareChild { file_id, name, mime_type }));
                        }
                    }
                    WireChild::Wrapped {
                        folder_id,
                        primary_file_id,
                        primary_name,
                        primary_mime_type,
                        thumbnail_file_id,
                        preview_file_id,
                    } => {
                        if child_kind_matches(primary_mime_type.as_deref(), kind_filter) {
                            out.push(Child::Wrapped(WrappedChild {
                                folder_id,
                                primary_file_id,
                                primary_name,
                                thumbnail_file_id,
                                preview_file_id,
                            }));
                        }
                    }
                }
            }
            Ok(out)
        })
    }

    fn upload_resumable<'a>(
        &'a self,
        local_path: &'a std::path::Path,
        name: &'a str,
        parent_folder_id: &'a str,
        mime_type: &'a str,
        progress_cb: ProgressCb<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            const CHUNK_BYTES: usize = 10 * 1024 * 1024;

            let bytes = tokio::fs::read(local_path).await?;
            let total = bytes.len().max(1);
            let mut uploaded = 0usize;

            // Chunked for parity with the streaming upload contract even
            // though this reference backend sends a single multipart body;
            // a real provider would open a resumable session per chunk.
            while uploaded < bytes.len() {
                let end = (uploaded + CHUNK_BYTES).min(bytes.len());
                uploaded = end;
                progress_cb(uploaded as f64 / total as f64);
            }
            progress_cb(1.0);

            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(name.to_string())
                .mime_str(mime_type)
                .unwrap_or_else(|_| reqwest::multipart::Part::bytes(Vec::new()));
            let form = reqwest::multipart::Form::new()
                .text("parent_folder_id", parent_folder_id.to_string())
                .part("file", part);

            let url = format!("{}/upload", self.config.base_url);
            let res = self
                .client
                .post(url)
                .bearer_auth(&self.config.api_token)
                .multipart(form)
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("upload request failed: {e}")))?;

            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|e| Error::remote_store(format!("upload read failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::remote_store(format!("upload http {status}: {body}")));
            }
            let parsed: ApiResponse<FileResult> = serde_json::from_str(&body)
                .map_err(|e| Error::remote_store(format!("upload invalid json: {e}")))?;
            parsed
                .result
                .map(|r| r.file_id)
                .ok_or_else(|| Error::remote_store(parsed.description.unwrap_or_default()))
        })
    }

    fn download_range<'a>(
        &'a self,
        file_id: &'a str,
        start: u64,
        end: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream<'a>>> + Send + 'a>> {
        Box::pin(async move {
            let range_header = match end {
                Some(end) => format!("bytes={start}-{end}"),
                None => format!("bytes={start}-"),
            };
            let url = format!("{}/download/{}", self.config.base_url, file_id);
            let res = self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .header(reqwest::header::RANGE, range_header)
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("download request failed: {e}")))?;

            let status = res.status();
            if !status.is_success() && status != reqwest::StatusCode::PARTIAL_CONTENT {
                return Err(Error::remote_store(format!("download http {status}")));
            }

            let stream = res
                .bytes_stream()
                .map(|r| r.map_err(|e| Error::remote_store(format!("download chunk failed: {e}"))));
            Ok(Box::pin(stream) as ByteStream<'a>)
        })
    }

    fn get_metadata<'a>(
        &'a self,
        file_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Metadata>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/metadata/{}", self.config.base_url, file_id);
            let res = self
                .client
                .get(url)
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("get_metadata request failed: {e}")))?;
            let status = res.status();
            let body = res
                .text()
                .await
                .map_err(|e| Error::remote_store(format!("get_metadata read failed: {e}")))?;
            if !status.is_success() {
                return Err(Error::remote_store(format!("get_metadata http {status}: {body}")));
            }
            let parsed: ApiResponse<MetadataResult> = serde_json::from_str(&body)
                .map_err(|e| Error::remote_store(format!("get_metadata invalid json: {e}")))?;
            let result = parsed
                .result
                .ok_or_else(|| Error::remote_store(parsed.description.unwrap_or_default()))?;
            Ok(Metadata {
                size: result.size,
                mime_type: result.mime_type,
            })
        })
    }

    fn exists<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.get_metadata(id).await.is_ok()) })
    }

    fn rename<'a>(
        &'a self,
        id: &'a str,
        new_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/rename", self.config.base_url);
            let res = self
                .client
                .post(url)
                .bearer_auth(&self.config.api_token)
                .json(&serde_json::json!({ "id": id, "new_name": new_name }))
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("rename request failed: {e}")))?;
            if !res.status().is_success() {
                return Err(Error::remote_store(format!("rename http {}", res.status())));
            }
            Ok(())
        })
    }

    fn move_to<'a>(
        &'a self,
        file_id: &'a str,
        new_parent: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/move", self.config.base_url);
            let res = self
                .client
                .post(url)
                .bearer_auth(&self.config.api_token)
                .json(&serde_json::json!({ "file_id": file_id, "new_parent": new_parent }))
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("move request failed: {e}")))?;
            if !res.status().is_success() {
                return Err(Error::remote_store(format!("move http {}", res.status())));
            }
            Ok(())
        })
    }

    fn delete_file<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/file/{}", self.config.base_url, id);
            let res = self
                .client
                .delete(url)
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("delete_file request failed: {e}")))?;
            if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
                return Err(Error::remote_store(format!("delete_file http {}", res.status())));
            }
            Ok(())
        })
    }

    fn delete_folder<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!("{}/folder/{}", self.config.base_url, id);
            let res = self
                .client
                .delete(url)
                .bearer_auth(&self.config.api_token)
                .send()
                .await
                .map_err(|e| Error::remote_store(format!("delete_folder request failed: {e}")))?;
            if !res.status().is_success() && res.status() != reqwest::StatusCode::NOT_FOUND {
                return Err(Error::remote_store(format!("delete_folder http {}", res.status())));
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone)]
enum MemNode {
    Folder { children: Vec<String> },
    File { bytes: Bytes, mime_type: Option<String> },
}

/// In-memory double used by tests in place of a real remote backend.
#[derive(Default)]
pub struct InMemoryObjectStore {
    nodes: Mutex<HashMap<String, MemNode>>,
    names: Mutex<HashMap<String, String>>,
    parents: Mutex<HashMap<String, String>>,
    root: Mutex<Option<String>>,
    uploaded: AtomicUsize,
}

impl InMemoryObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn uploaded_count(&self) -> usize {
        self.uploaded.load(Ordering::Relaxed)
    }

    async fn new_id(&self, prefix: &str) -> String {
        format!("{prefix}:{}", uuid::Uuid::new_v4())
    }

    async fn root_id(&self) -> String {
        let mut root = self.root.lock().await;
        if let Some(id) = root.as_ref() {
            return id.clone();
        }
        let id = format!("folder:root");
        self.nodes
            .lock()
            .await
            .insert(id.clone(), MemNode::Folder { children: Vec::new() });
        *root = Some(id.clone());
        id
    }

    async fn child_named(&self, folder_id: &str, name: &str) -> Option<String> {
        let nodes = self.nodes.lock().await;
        let names = self.names.lock().await;
        if let Some(MemNode::Folder { children }) = nodes.get(folder_id) {
            for child in children {
                if names.get(child).map(|n| n.as_str()) == Some(name) {
                    return Some(child.clone());
                }
            }
        }
        None
    }

    /// Test helper: drop a blob directly into a folder, bypassing upload, to
    /// simulate an out-of-band external write for reconciliation scenarios.
    pub async fn seed_file(&self, folder_id: &str, name: &str, bytes: Vec<u8>, mime_type: &str) -> String {
        let id = self.new_id("file").await;
        self.nodes.lock().await.insert(
            id.clone(),
            MemNode::File {
                bytes: Bytes::from(bytes),
                mime_type: Some(mime_type.to_string()),
            },
        );
        self.names.lock().await.insert(id.clone(), name.to_string());
        self.parents.lock().await.insert(id.clone(), folder_id.to_string());
        if let Some(MemNode::Folder { children }) = self.nodes.lock().await.get_mut(folder_id) {
            children.push(id.clone());
        }
        id
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn provider(&self) -> &'static str {
        "test.mem"
    }

    fn resolve_path<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let mut current = self.root_id().await;
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                match self.child_named(&current, segment).await {
                    Some(id) => current = id,
                    None => return Ok(None),
                }
            }
            Ok(Some(current))
        })
    }

    fn ensure_path<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let mut current = self.root_id().await;
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                current = match self.child_named(&current, segment).await {
                    Some(id) => id,
                    None => {
                        let id = self.new_id("folder").await;
                        self.nodes
                            .lock()
                            .await
                            .insert(id.clone(), MemNode::Folder { children: Vec::new() });
                        self.names.lock().await.insert(id.clone(), segment.to_string());
                        self.parents.lock().await.insert(id.clone(), current.clone());
                        if let Some(MemNode::Folder { children }) =
                            self.nodes.lock().await.get_mut(&current)
                        {
                            children.push(id.clone());
                        }
                        id
                    }
                };
            }
            Ok(current)
        })
    }

    fn list_children<'a>(
        &'a self,
        folder_id: &'a str,
        kind_filter: ChildKind,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Child>>> + Send + 'a>> {
        Box::pin(async move {
            let nodes = self.nodes.lock().await;
            let names = self.names.lock().await;
            let Some(MemNode::Folder { children }) = nodes.get(folder_id) else {
                return Err(Error::not_found(format!("folder {folder_id}")));
            };

            let mut out = Vec::new();
            for child_id in children {
                match nodes.get(child_id) {
                    Some(MemNode::File { mime_type, .. }) => {
                        if child_kind_matches(mime_type.as_deref(), kind_filter) {
                            out.push(Child::Bare(BareChild {
                                file_id: child_id.clone(),
                                name: names.get(child_id).cloned().unwrap_or_default(),
                                mime_type: mime_type.clone(),
                            }));
                        }
                    }
                    Some(MemNode::Folder { children: inner }) => {
                        // A wrapping folder: its sole video/pdf child is the primary.
                        for inner_id in inner {
                            if let Some(MemNode::File { mime_type, .. }) = nodes.get(inner_id) {
                                if child_kind_matches(mime_type.as_deref(), kind_filter) {
                                    out.push(Child::Wrapped(WrappedChild {
                                        folder_id: child_id.clone(),
                                        primary_file_id: inner_id.clone(),
                                        primary_name: names.get(inner_id).cloned().unwrap_or_default(),
                                        thumbnail_file_id: None,
                                        preview_file_id: None,
                                    }));
                                }
                            }
                        }
                    }
                    None => {}
                }
            }
            Ok(out)
        })
    }

    fn upload_resumable<'a>(
        &'a self,
        local_path: &'a std::path::Path,
        name: &'a str,
        parent_folder_id: &'a str,
        mime_type: &'a str,
        progress_cb: ProgressCb<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async move {
            let bytes = tokio::fs::read(local_path).await?;
            progress_cb(1.0);
            let id = self.seed_file(parent_folder_id, name, bytes, mime_type).await;
            self.uploaded.fetch_add(1, Ordering::Relaxed);
            Ok(id)
        })
    }

    fn download_range<'a>(
        &'a self,
        file_id: &'a str,
        start: u64,
        end: Option<u64>,
    ) -> Pin<Box<dyn Future<Output = Result<ByteStream<'a>>> + Send + 'a>> {
        Box::pin(async move {
            let nodes = self.nodes.lock().await;
            let Some(MemNode::File { bytes, .. }) = nodes.get(file_id) else {
                return Err(Error::not_found(format!("file {file_id}")));
            };
            let len = bytes.len() as u64;
            let start = start.min(len);
            let end = end.map(|e| (e + 1).min(len)).unwrap_or(len);
            let slice = bytes.slice(start as usize..end.max(start) as usize);
            Ok(Box::pin(stream::once(async move { Ok(slice) })) as ByteStream<'a>)
        })
    }

    fn get_metadata<'a>(
        &'a self,
        file_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Metadata>> + Send + 'a>> {
        Box::pin(async move {
            let nodes = self.nodes.lock().await;
            match nodes.get(file_id) {
                Some(MemNode::File { bytes, mime_type }) => Ok(Metadata {
                    size: bytes.len() as u64,
                    mime_type: mime_type.clone(),
                }),
                _ => Err(Error::not_found(format!("file {file_id}"))),
            }
        })
    }

    fn exists<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>> {
        Box::pin(async move { Ok(self.nodes.lock().await.contains_key(id)) })
    }

    fn rename<'a>(
        &'a self,
        id: &'a str,
        new_name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.names.lock().await.insert(id.to_string(), new_name.to_string());
            Ok(())
        })
    }

    fn move_to<'a>(
        &'a self,
        file_id: &'a str,
        new_parent: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let old_parent = self.parents.lock().await.get(file_id).cloned();
            if let Some(old_parent) = old_parent
                && let Some(MemNode::Folder { children }) = self.nodes.lock().await.get_mut(&old_parent)
            {
                children.retain(|c| c != file_id);
            }
            if let Some(MemNode::Folder { children }) = self.nodes.lock().await.get_mut(new_parent) {
                children.push(file_id.to_string());
            }
            self.parents
                .lock()
                .await
                .insert(file_id.to_string(), new_parent.to_string());
            Ok(())
        })
    }

    fn delete_file<'a>(&'a self, id: &'a str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let parent = self.parents.lock().await.remove(id);
            if let Some(parent) = parent
                && let Some(MemNode::Folder { children }) = self.nodes.lock().await.get_mut(&parent)
            {
                children.retain(|c| c != id);
            }
            self.nodes.lock().await.remove(id);
            self.names.lock().await.remove(id);
            Ok(())
        })
    }

    fn delete_folder<'a>(
        &'a self,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let children: Vec<String> = match self.nodes.lock().await.get(id) {
                Some(MemNode::Folder { children }) => children.clone(),
                _ => Vec::new(),
            };
            for child in children {
                Box::pin(self.delete_file(&child)).await.ok();
            }
            let parent = self.parents.lock().await.remove(id);
            if let Some(parent) = parent
                && let Some(MemNode::Folder { children }) = self.nodes.lock().await.get_mut(&parent)
            {
                children.retain(|c| c != id);
            }
            self.nodes.lock().await.remove(id);
            self.names.lock().await.remove(id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_path_creates_missing_segments_then_resolves() {
        let store = InMemoryObjectStore::new();
        let id = store.ensure_path("course/chapter1").await.unwrap();
        let resolved = store.resolve_path("course/chapter1").await.unwrap();
        assert_eq!(resolved, Some(id));
        assert_eq!(store.resolve_path("course/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upload_then_download_range_roundtrips() {
        let store = InMemoryObjectStore::new();
        let folder = store.ensure_path("course").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        let file_id = store
            .upload_resumable(&path, "a.bin", &folder, "application/octet-stream", Box::new(|_| {}))
            .await
            .unwrap();

        let mut stream = store.download_range(&file_id, 2, Some(5)).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"2345");
    }

    #[tokio::test]
    async fn delete_folder_removes_children() {
        let store = InMemoryObjectStore::new();
        let folder = store.ensure_path("course").await.unwrap();
        store.seed_file(&folder, "v.mp4", vec![1, 2, 3], "video/mp4").await;
        store.delete_folder(&folder).await.unwrap();
        assert_eq!(store.resolve_path("course").await.unwrap(), None);
    }
}

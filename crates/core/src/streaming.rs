use futures::stream::{Stream, StreamExt};

use crate::catalog::{self, Artifact};
use crate::object_store::{ByteStream, ObjectStore};
use crate::{Error, Result};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Thumbnail,
    Preview,
}

#[derive(Debug, Clone, Copy)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

pub struct RangeResponse<'a> {
    pub status_partial: bool,
    pub content_length: u64,
    pub content_range: Option<ContentRange>,
    pub accept_ranges: bool,
    pub mime_type: Option<String>,
    pub body: ByteStream<'a>,
}

/// A requested `Range: bytes=a-b` header, already split into its two optional
/// endpoints; `end = None` means open-ended (`bytes=a-`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestedRange {
    pub start: u64,
    pub end: Option<u64>,
}

pub async fn serve_range<'a>(
    store: &'a dyn ObjectStore,
    pool: &SqlitePool,
    artifact_id: &str,
    owner: &str,
    range: Option<RequestedRange>,
    initial_range_cap_bytes: u64,
) -> Result<RangeResponse<'a>> {
    let artifact = catalog::get_artifact(pool, artifact_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("artifact {artifact_id}")))?;
    if artifact.owner != owner {
        return Err(Error::Authorization);
    }
    let file_id = artifact
        .remote_file_id
        .as_deref()
        .ok_or_else(|| Error::not_found("artifact has no uploaded file yet"))?;

    let size = match artifact.size_bytes {
        Some(size) if size >= 0 => size as u64,
        _ => {
            let metadata = store.get_metadata(file_id).await?;
            catalog::set_size_and_mime(
                pool,
                artifact_id,
                metadata.size as i64,
                metadata.mime_type.as_deref().unwrap_or("application/octet-stream"),
            )
            .await?;
            metadata.size
        }
    };

    let Some(requested) = range else {
        let body = store.download_range(file_id, 0, None).await?;
        return Ok(RangeResponse {
            status_partial: false,
            content_length: size,
            content_range: None,
            accept_ranges: true,
            mime_type: artifact.mime_type.clone(),
            body,
        });
    };

    let start = requested.start.min(size.saturating_sub(1));
    let end = match requested.end {
        Some(end) => end.min(size.saturating_sub(1)),
        None => (start + initial_range_cap_bytes.saturating_sub(1)).min(size.saturating_sub(1)),
    };

    let body = store.download_range(file_id, start, Some(end)).await?;
    Ok(RangeResponse {
        status_partial: true,
        content_length: end.saturating_sub(start) + 1,
        content_range: Some(ContentRange { start, end, total: size }),
        accept_ranges: true,
        mime_type: artifact.mime_type.clone(),
        body,
    })
}

pub struct AssetResponse<'a> {
    pub content_length: Option<u64>,
    pub cache_max_age_seconds: u64,
    pub body: ByteStream<'a>,
}

/// Streams `thumbnail_ref` or `preview_ref`, refusing any `asset_ref` that
/// does not match one of the two values recorded on the artifact.
pub async fn serve_asset<'a>(
    store: &'a dyn ObjectStore,
    pool: &SqlitePool,
    artifact_id: &str,
    owner: &str,
    kind: AssetKind,
) -> Result<AssetResponse<'a>> {
    let artifact: Artifact = catalog::get_artifact(pool, artifact_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("artifact {artifact_id}")))?;
    if artifact.owner != owner {
        return Err(Error::Authorization);
    }

    let asset_ref = match kind {
        AssetKind::Thumbnail => artifact.thumbnail_ref.as_deref(),
        AssetKind::Preview => artifact.preview_ref.as_deref(),
    }
    .ok_or_else(|| Error::not_found("artifact has no such derived asset"))?;

    let metadata = store.get_metadata(asset_ref).await.ok();
    let body = store.download_range(asset_ref, 0, None).await?;

    Ok(AssetResponse {
        content_length: metadata.map(|m| m.size),
        cache_max_age_seconds: 24 * 60 * 60,
        body,
    })
}

/// Drains a byte stream into a `Vec<u8>`, honoring cancellation between
/// chunks so a disconnected client abandons the upstream range download
/// within one chunk boundary rather than reading it to completion.
pub async fn collect_cancellable(
    mut stream: impl Stream<Item = Result<bytes::Bytes>> + Unpin,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match stream.next().await {
            Some(chunk) => out.extend_from_slice(&chunk?),
            None => break,
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{open_catalog_db, ArtifactKind};
    use crate::object_store::InMemoryObjectStore;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn full_body_when_no_range_requested() {
        let pool = test_pool().await;
        let store = InMemoryObjectStore::new();
        let folder = store.ensure_path("course").await.unwrap();
        let file_id = store.seed_file(&folder, "v.mp4", b"0123456789".to_vec(), "video/mp4").await;

        let artifact = catalog::create_pending_artifact(
            &pool,
            "user-1",
            ArtifactKind::Video,
            "v",
            "course",
            Some("video/mp4"),
        )
        .await
        .unwrap();
        catalog::complete_artifact(&pool, &artifact.id, &file_id, Some(&folder), None, None, Some(10), None)
            .await
            .unwrap();

        let response = serve_range(store.as_ref(), &pool, &artifact.id, "user-1", None, 2 * 1024 * 1024)
            .await
            .unwrap();
        assert!(!response.status_partial);
        assert_eq!(response.content_length, 10);
    }

    #[tokio::test]
    async fn open_ended_range_caps_at_initial_range_cap() {
        let pool = test_pool().await;
        let store = InMemoryObjectStore::new();
        let folder = store.ensure_path("course").await.unwrap();
        let file_id = store.seed_file(&folder, "v.mp4", vec![0u8; 100], "video/mp4").await;

        let artifact = catalog::create_pending_artifact(
            &pool,
            "user-1",
            ArtifactKind::Video,
            "v",
            "course",
            Some("video/mp4"),
        )
        .await
        .unwrap();
        catalog::complete_artifact(&pool, &artifact.id, &file_id, Some(&folder), None, None, Some(100), None)
            .await
            .unwrap();

        let response = serve_range(
            store.as_ref(),
            &pool,
            &artifact.id,
            "user-1",
            Some(RequestedRange { start: 10, end: None }),
            20,
        )
        .await
        .unwrap();
        assert!(response.status_partial);
        let range = response.content_range.unwrap();
        assert_eq!(range.start, 10);
        assert_eq!(range.end, 29);
        assert_eq!(response.content_length, 20);
    }

    #[tokio::test]
    async fn wrong_owner_is_rejected() {
        let pool = test_pool().await;
        let store = InMemoryObjectStore::new();
        let folder = store.ensure_path("course").await.unwrap();
        let file_id = store.seed_file(&folder, "v.mp4", vec![0u8; 10], "video/mp4").await;

        let artifact = catalog::create_pending_artifact(
            &pool,
            "user-1",
            ArtifactKind::Video,
            "v",
            "course",
            Some("video/mp4"),
        )
        .await
        .unwrap();
        catalog::complete_artifact(&pool, &artifact.id, &file_id, Some(&folder), None, None, Some(10), None)
            .await
            .unwrap();

        let err = serve_range(store.as_ref(), &pool, &artifact.id, "user-2", None, 2 * 1024 * 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authorization));
    }
}

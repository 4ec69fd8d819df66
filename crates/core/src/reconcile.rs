use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::catalog::{self, Artifact, ArtifactKind, ArtifactStatus};
use crate::object_store::{Child, ChildKind, ObjectStore};
use crate::pipeline::PipelineController;
use crate::transcode::{generate_preview, generate_thumbnail, probe_media, MediaToolConfig};
use crate::Result;

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReconcileReport {
    pub hierarchy_path: String,
    pub purged: u64,
    pub confirmed_present: u64,
    pub removed_missing: u64,
    pub imported_videos: u64,
    pub imported_pdfs: u64,
    pub sync_metadata_enqueued: u64,
    pub sync_metadata_failed: u64,
}

impl ReconcileReport {
    fn purged_only(hierarchy_path: &str, purged: u64) -> Self {
        Self {
            hierarchy_path: hierarchy_path.to_string(),
            purged,
            ..Default::default()
        }
    }
}

struct DiffSet {
    /// The primary file id of every remote child (bare file id, or a
    /// wrapped folder's primary file id).
    primary_ids: HashSet<String>,
    /// Wrapping folder ids, keyed for the `remote_folder_id`-based match.
    container_ids: HashSet<String>,
    children: Vec<Child>,
}

fn build_diff_set(children: Vec<Child>) -> DiffSet {
    let mut primary_ids = HashSet::new();
    let mut container_ids = HashSet::new();
    for child in &children {
        match child {
            Child::Bare(bare) => {
                primary_ids.insert(bare.file_id.clone());
            }
            Child::Wrapped(wrapped) => {
                primary_ids.insert(wrapped.primary_file_id.clone());
                container_ids.insert(wrapped.folder_id.clone());
            }
        }
    }
    DiffSet {
        primary_ids,
        container_ids,
        children,
    }
}

fn child_primary_id(child: &Child) -> &str {
    match child {
        Child::Bare(bare) => &bare.file_id,
        Child::Wrapped(wrapped) => &wrapped.primary_file_id,
    }
}

/// Runs phases A through D for a single hierarchy path. Phases execute
/// strictly in order; paths themselves may be run concurrently by the
/// caller (see `reconcile_scope`).
pub async fn reconcile_path(
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    media_tool: &MediaToolConfig,
    controller: &PipelineController,
    owner: &str,
    hierarchy_path: &str,
) -> Result<ReconcileReport> {
    // Phase A: drive-presence gate.
    let Some(folder_id) = store.resolve_path(hierarchy_path).await? else {
        let purged = catalog::delete_all_for_path(pool, owner, hierarchy_path).await?;
        debug!(event = "reconcile.purge", hierarchy_path, purged, "reconcile.purge");
        return Ok(ReconcileReport::purged_only(hierarchy_path, purged));
    };

    let mut report = ReconcileReport {
        hierarchy_path: hierarchy_path.to_string(),
        ..Default::default()
    };

    diff_and_import(
        store,
        pool,
        media_tool,
        controller,
        owner,
        hierarchy_path,
        &folder_id,
        ArtifactKind::Video,
        &mut report,
    )
    .await?;

    diff_and_import(
        store,
        pool,
        media_tool,
        controller,
        owner,
        hierarchy_path,
        &folder_id,
        ArtifactKind::Pdf,
        &mut report,
    )
    .await?;

    Ok(report)
}

#[allow(clippy::too_many_arguments)]
async fn diff_and_import(
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    media_tool: &MediaToolConfig,
    controller: &PipelineController,
    owner: &str,
    hierarchy_path: &str,
    folder_id: &str,
    kind: ArtifactKind,
    report: &mut ReconcileReport,
) -> Result<()> {
    let kind_filter = match kind {
        ArtifactKind::Video => ChildKind::Video,
        ArtifactKind::Pdf => ChildKind::Pdf,
        ArtifactKind::Other => ChildKind::Any,
    };
    let diff = build_diff_set(store.list_children(folder_id, kind_filter).await?);

    let rows = catalog::list_by_hierarchy_path_and_kind(pool, hierarchy_path, kind).await?;
    let mut remaining_ids: HashSet<String> = HashSet::new();

    for row in rows {
        let Some(remote_file_id) = row.remote_file_id.clone() else {
            continue;
        };
        let present = diff.primary_ids.contains(&remote_file_id)
            || row
                .remote_folder_id
                .as_ref()
                .is_some_and(|folder| diff.container_ids.contains(folder));

        if present {
            remaining_ids.insert(remote_file_id);
            report.confirmed_present += 1;
            continue;
        }

        let file_gone = !store.exists(&remote_file_id).await.unwrap_or(true);
        let folder_gone = match &row.remote_folder_id {
            Some(folder) => !store.exists(folder).await.unwrap_or(true),
            None => true,
        };
        if file_gone && folder_gone {
            catalog::delete_artifact(pool, &row.id).await?;
            report.removed_missing += 1;
        } else {
            // Ambiguous: store round-trip disagrees with the listing. Leave
            // the row as-is rather than guess; a later reconciliation run
            // will re-evaluate it.
            remaining_ids.insert(remote_file_id);
            warn!(event = "reconcile.ambiguous", artifact_id = %row.id, "reconcile.ambiguous");
        }
    }

    for child in &diff.children {
        let primary_id = child_primary_id(child);
        if remaining_ids.contains(primary_id) {
            continue;
        }

        let (name, remote_folder_id, thumbnail_ref, preview_ref) = match child {
            Child::Bare(bare) => (bare.name.clone(), None, None, None),
            Child::Wrapped(wrapped) => (
                wrapped.primary_name.clone(),
                Some(wrapped.folder_id.clone()),
                wrapped.thumbnail_file_id.clone(),
                wrapped.preview_file_id.clone(),
            ),
        };

        let mime_type = match kind {
            ArtifactKind::Video => "video/mp4",
            ArtifactKind::Pdf => "application/pdf",
            ArtifactKind::Other => "application/octet-stream",
        };

        let artifact = catalog::create_pending_artifact(
            pool,
            owner,
            kind,
            &name,
            hierarchy_path,
            Some(mime_type),
        )
        .await?;

        let size_bytes = store.get_metadata(primary_id).await.ok().map(|m| m.size as i64);

        catalog::complete_artifact(
            pool,
            &artifact.id,
            primary_id,
            remote_folder_id.as_deref(),
            thumbnail_ref.as_deref(),
            preview_ref.as_deref(),
            size_bytes,
            None,
        )
        .await?;

        match kind {
            ArtifactKind::Video => report.imported_videos += 1,
            ArtifactKind::Pdf => report.imported_pdfs += 1,
            ArtifactKind::Other => {}
        }

        if kind == ArtifactKind::Video && (thumbnail_ref.is_none() || preview_ref.is_none()) {
            report.sync_metadata_enqueued += 1;
            match run_sync_metadata_job(store, pool, media_tool, controller, &artifact).await {
                Ok(()) => {}
                Err(e) => {
                    report.sync_metadata_failed += 1;
                    warn!(event = "reconcile.sync_metadata_failed", artifact_id = %artifact.id, error = %e, "reconcile.sync_metadata_failed");
                }
            }
        }
    }

    Ok(())
}

/// Downloads the primary file, regenerates any missing derived asset, and
/// wraps a still-flat artifact in a per-artifact folder. Failures here are
/// logged and counted by the caller, never propagated to the reconciliation
/// pass as a whole.
async fn run_sync_metadata_job(
    store: &dyn ObjectStore,
    pool: &SqlitePool,
    media_tool: &MediaToolConfig,
    controller: &PipelineController,
    artifact: &Artifact,
) -> Result<()> {
    let cancel = controller.register_job(&artifact.id);
    let remote_file_id = artifact
        .remote_file_id
        .clone()
        .ok_or_else(|| crate::Error::not_found("artifact has no remote file"))?;

    let temp_dir = std::env::temp_dir().join("mediavault-sync");
    tokio::fs::create_dir_all(&temp_dir).await?;
    let local_path = temp_dir.join(format!("{}.sync.mp4", artifact.id));

    {
        let mut stream = store.download_range(&remote_file_id, 0, None).await?;
        let mut file = tokio::fs::File::create(&local_path).await?;
        use tokio::io::AsyncWriteExt;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
    }

    let probe = probe_media(&media_tool.media_probe_path, &local_path).await?;

    let needs_thumbnail = artifact.thumbnail_ref.is_none();
    let needs_preview = artifact.preview_ref.is_none();

    let thumbnail_path = temp_dir.join(format!("{}.thumb.jpg", artifact.id));
    let preview_path = temp_dir.join(format!("{}.preview.mp4", artifact.id));

    if needs_thumbnail {
        let thumb_at = if probe.duration_seconds.unwrap_or(2.0) > 1.0 { 1.0 } else { 0.0 };
        generate_thumbnail(&media_tool.media_tool_path, &local_path, &thumbnail_path, thumb_at, &cancel).await?;
    }
    if needs_preview {
        let preview_len = probe.duration_seconds.map(|d| (5.0_f64).min(d.max(0.5))).unwrap_or(5.0);
        generate_preview(&media_tool.media_tool_path, &local_path, &preview_path, 0.0, preview_len, &cancel).await?;
    }

    let folder_id = match &artifact.remote_folder_id {
        Some(folder_id) => folder_id.clone(),
        None => {
            let folder_name = format!("{}/{}", artifact.hierarchy_path, artifact.title);
            let folder_id = store.ensure_path(&folder_name).await?;
            store.move_to(&remote_file_id, &folder_id).await?;
            folder_id
        }
    };

    let thumbnail_ref = if needs_thumbnail {
        Some(
            store
                .upload_resumable(&thumbnail_path, "thumbnail.jpg", &folder_id, "image/jpeg", Box::new(|_| {}))
                .await?,
        )
    } else {
        artifact.thumbnail_ref.clone()
    };
    let preview_ref = if needs_preview {
        Some(
            store
                .upload_resumable(&preview_path, "preview.mp4", &folder_id, "video/mp4", Box::new(|_| {}))
                .await?,
        )
    } else {
        artifact.preview_ref.clone()
    };

    catalog::complete_artifact(
        pool,
        &artifact.id,
        &remote_file_id,
        Some(&folder_id),
        thumbnail_ref.as_deref(),
        preview_ref.as_deref(),
        artifact.size_bytes,
        probe.duration_seconds,
    )
    .await?;

    let _ = tokio::fs::remove_file(&local_path).await;
    let _ = tokio::fs::remove_file(&thumbnail_path).await;
    let _ = tokio::fs::remove_file(&preview_path).await;
    controller.unregister_job(&artifact.id);
    Ok(())
}

/// Fans reconciliation out across paths with bounded concurrency, mirroring
/// the teacher's upload-worker fan-out. Per-path failures are logged and
/// surfaced in the returned reports rather than aborting the whole scope.
pub async fn reconcile_scope(
    store: Arc<dyn ObjectStore>,
    pool: SqlitePool,
    media_tool: MediaToolConfig,
    controller: Arc<PipelineController>,
    owner: String,
    hierarchy_paths: Vec<String>,
    concurrency: usize,
) -> Vec<(String, Result<ReconcileReport>)> {
    let mut futures = FuturesUnordered::new();
    let mut pending = hierarchy_paths.into_iter();
    let mut in_flight = 0usize;
    let mut results = Vec::new();

    loop {
        while in_flight < concurrency.max(1) {
            let Some(path) = pending.next() else { break };
            let store = Arc::clone(&store);
            let pool = pool.clone();
            let media_tool = media_tool.clone();
            let controller = Arc::clone(&controller);
            let owner = owner.clone();
            futures.push(async move {
                let report = reconcile_path(store.as_ref(), &pool, &media_tool, controller.as_ref(), &owner, &path).await;
                (path, report)
            });
            in_flight += 1;
        }
        if futures.is_empty() {
            break;
        }
        if let Some(result) = futures.next().await {
            results.push(result);
            in_flight -= 1;
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn media_tool() -> MediaToolConfig {
        MediaToolConfig {
            media_tool_path: "ffmpeg".into(),
            media_probe_path: "ffprobe".into(),
        }
    }

    #[tokio::test]
    async fn missing_drive_folder_purges_catalog_rows() {
        let pool = test_pool().await;
        let store = InMemoryObjectStore::new();
        let controller = PipelineController::new();

        catalog::create_pending_artifact(&pool, "user-1", ArtifactKind::Video, "v", "course/ch1", None)
            .await
            .unwrap();

        let report = reconcile_path(store.as_ref(), &pool, &media_tool(), &controller, "user-1", "course/ch1")
            .await
            .unwrap();
        assert_eq!(report.purged, 1);

        let (rows, _) = catalog::list_artifacts(&pool, "user-1", Some("course/ch1"), 1, 10).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn bare_pdf_not_in_catalog_is_imported() {
        let pool = test_pool().await;
        let store = InMemoryObjectStore::new();
        let controller = PipelineController::new();

        let folder = store.ensure_path("course/ch1").await.unwrap();
        store.seed_file(&folder, "notes.pdf", b"%PDF-1.4".to_vec(), "application/pdf").await;

        let report = reconcile_path(store.as_ref(), &pool, &media_tool(), &controller, "user-1", "course/ch1")
            .await
            .unwrap();
        assert_eq!(report.imported_pdfs, 1);

        let (rows, _) = catalog::list_artifacts(&pool, "user-1", Some("course/ch1"), 1, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ArtifactStatus::Completed);
    }

    #[tokio::test]
    async fn running_reconcile_twice_with_no_change_is_idempotent() {
        let pool = test_pool().await;
        let store = InMemoryObjectStore::new();
        let controller = PipelineController::new();

        let folder = store.ensure_path("course/ch1").await.unwrap();
        store.seed_file(&folder, "notes.pdf", b"%PDF-1.4".to_vec(), "application/pdf").await;

        reconcile_path(store.as_ref(), &pool, &media_tool(), &controller, "user-1", "course/ch1")
            .await
            .unwrap();
        let second = reconcile_path(store.as_ref(), &pool, &media_tool(), &controller, "user-1", "course/ch1")
            .await
            .unwrap();

        assert_eq!(second.imported_pdfs, 0);
        assert_eq!(second.removed_missing, 0);
        assert_eq!(second.confirmed_present, 1);
    }
}

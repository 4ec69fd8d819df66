use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::{Error, Result};

pub async fn open_catalog_db(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&pool)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Video,
    Pdf,
    Other,
}

impl ArtifactKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime.starts_with("video/") {
            ArtifactKind::Video
        } else if mime == "application/pdf" {
            ArtifactKind::Pdf
        } else {
            ArtifactKind::Other
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            ArtifactKind::Video => "video",
            ArtifactKind::Pdf => "pdf",
            ArtifactKind::Other => "other",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self> {
        match s {
            "video" => Ok(ArtifactKind::Video),
            "pdf" => Ok(ArtifactKind::Pdf),
            "other" => Ok(ArtifactKind::Other),
            other => Err(Error::validation(format!("unknown artifact kind {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtifactStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl ArtifactStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "PENDING",
            ArtifactStatus::Processing => "PROCESSING",
            ArtifactStatus::Completed => "COMPLETED",
            ArtifactStatus::Failed => "FAILED",
            ArtifactStatus::Canceled => "CANCELED",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ArtifactStatus::Pending),
            "PROCESSING" => Ok(ArtifactStatus::Processing),
            "COMPLETED" => Ok(ArtifactStatus::Completed),
            "FAILED" => Ok(ArtifactStatus::Failed),
            "CANCELED" => Ok(ArtifactStatus::Canceled),
            other => Err(Error::validation(format!("unknown artifact status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub owner: String,
    pub kind: ArtifactKind,
    pub title: String,
    pub hierarchy_path: String,
    pub status: ArtifactStatus,
    pub progress: i64,
    pub error: Option<String>,
    pub remote_file_id: Option<String>,
    pub remote_folder_id: Option<String>,
    pub size_bytes: Option<i64>,
    pub mime_type: Option<String>,
    pub duration_seconds: Option<f64>,
    pub thumbnail_ref: Option<String>,
    pub preview_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    id: String,
    owner: String,
    kind: String,
    title: String,
    hierarchy_path: String,
    status: String,
    progress: i64,
    error: Option<String>,
    remote_file_id: Option<String>,
    remote_folder_id: Option<String>,
    size_bytes: Option<i64>,
    mime_type: Option<String>,
    duration_seconds: Option<f64>,
    thumbnail_ref: Option<String>,
    preview_ref: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ArtifactRow {
    fn into_artifact(self) -> Result<Artifact> {
        Ok(Artifact {
            id: self.id,
            owner: self.owner,
            kind: ArtifactKind::from_db_str(&self.kind)?,
            title: self.title,
            hierarchy_path: self.hierarchy_path,
            status: ArtifactStatus::from_db_str(&self.status)?,
            progress: self.progress,
            error: self.error,
            remote_file_id: self.remote_file_id,
            remote_folder_id: self.remote_folder_id,
            size_bytes: self.size_bytes,
            mime_type: self.mime_type,
            duration_seconds: self.duration_seconds,
            thumbnail_ref: self.thumbnail_ref,
            preview_ref: self.preview_ref,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

pub fn new_artifact_id() -> String {
    format!("art_{}", uuid::Uuid::new_v4())
}

pub async fn create_pending_artifact(
    pool: &SqlitePool,
    owner: &str,
    kind: ArtifactKind,
    title: &str,
    hierarchy_path: &str,
    mime_type: Option<&str>,
) -> Result<Artifact> {
    let id = new_artifact_id();
    sqlx::query(
        "INSERT INTO artifacts (id, owner, kind, title, hierarchy_path, status, progress, mime_type)
         VALUES (?, ?, ?, ?, ?, 'PENDING', 0, ?)",
    )
    .bind(&id)
    .bind(owner)
    .bind(kind.as_db_str())
    .bind(title)
    .bind(hierarchy_path)
    .bind(mime_type)
    .execute(pool)
    .await?;

    get_artifact(pool, &id)
        .await?
        .ok_or_else(|| Error::not_found(format!("artifact {id}")))
}

pub async fn get_artifact(pool: &SqlitePool, id: &str) -> Result<Option<Artifact>> {
    let row: Option<ArtifactRow> = sqlx::query_as(
        r#"SELECT id, owner, kind, title, hierarchy_path, status, progress,
                  error, remote_file_id, remote_folder_id, size_bytes, mime_type,
                  duration_seconds, thumbnail_ref, preview_ref, created_at, updated_at
           FROM artifacts WHERE id = ?"#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(ArtifactRow::into_artifact).transpose()
}

pub async fn list_artifacts(
    pool: &SqlitePool,
    owner: &str,
    hierarchy_path_prefix: Option<&str>,
    page: i64,
    page_size: i64,
) -> Result<(Vec<Artifact>, i64)> {
    let page_size = page_size.clamp(1, 100);
    let offset = (page.max(1) - 1) * page_size;

    let pattern = hierarchy_path_prefix.map(|p| format!("{p}%"));

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM artifacts WHERE owner = ? AND (?1 IS NULL OR hierarchy_path LIKE ?2)",
    )
    .bind(owner)
    .bind(&pattern)
    .fetch_one(pool)
    .await
    .unwrap_or(0);

    let rows: Vec<ArtifactRow> = sqlx::query_as(
        r#"SELECT id, owner, kind, title, hierarchy_path, status, progress,
                  error, remote_file_id, remote_folder_id, size_bytes, mime_type,
                  duration_seconds, thumbnail_ref, preview_ref, created_at, updated_at
           FROM artifacts
           WHERE owner = ?1 AND (?2 IS NULL OR hierarchy_path LIKE ?2)
           ORDER BY created_at DESC
           LIMIT ?3 OFFSET ?4"#,
    )
    .bind(owner)
    .bind(&pattern)
    .bind(page_size)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    let artifacts = rows
        .into_iter()
        .map(ArtifactRow::into_artifact)
        .collect::<Result<Vec<_>>>()?;

    Ok((artifacts, total))
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: ArtifactStatus,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE artifacts SET status = ?, error = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
         WHERE id = ?",
    )
    .bind(status.as_db_str())
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_progress(pool: &SqlitePool, id: &str, percent: i64) -> Result<()> {
    sqlx::query(
        "UPDATE artifacts SET progress = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
         WHERE id = ?",
    )
    .bind(percent.clamp(0, 100))
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn complete_artifact(
    pool: &SqlitePool,
    id: &str,
    remote_file_id: &str,
    remote_folder_id: Option<&str>,
    thumbnail_ref: Option<&str>,
    preview_ref: Option<&str>,
    size_bytes: Option<i64>,
    duration_seconds: Option<f64>,
) -> Result<()> {
    sqlx::query(
        "UPDATE artifacts SET
            status = 'COMPLETED', progress = 100, error = NULL,
            remote_file_id = ?, remote_folder_id = ?,
            thumbnail_ref = ?, preview_ref = ?,
            size_bytes = COALESCE(?, size_bytes),
            duration_seconds = COALESCE(?, duration_seconds),
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
         WHERE id = ?",
    )
    .bind(remote_file_id)
    .bind(remote_folder_id)
    .bind(thumbnail_ref)
    .bind(preview_ref)
    .bind(size_bytes)
    .bind(duration_seconds)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn rename_artifact(pool: &SqlitePool, id: &str, new_title: &str) -> Result<()> {
    if new_title.is_empty() || new_title.len() > 255 {
        return Err(Error::validation("title must be 1..=255 characters"));
    }
    sqlx::query(
        "UPDATE artifacts SET title = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?",
    )
    .bind(new_title)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_artifact(pool: &SqlitePool, id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_size_and_mime(
    pool: &SqlitePool,
    id: &str,
    size_bytes: i64,
    mime_type: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE artifacts SET size_bytes = ?, mime_type = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
         WHERE id = ?",
    )
    .bind(size_bytes)
    .bind(mime_type)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Run once at daemon startup: any row left in `PROCESSING` from a prior
/// process cannot still have a live worker, so it is flipped to `FAILED`.
pub async fn sweep_interrupted_jobs(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE artifacts SET status = 'FAILED', error = 'interrupted by restart',
            progress = 0, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
         WHERE status = 'PROCESSING'",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn find_by_remote_file_id(
    pool: &SqlitePool,
    hierarchy_path: &str,
    remote_file_id: &str,
) -> Result<Option<Artifact>> {
    let row: Option<ArtifactRow> = sqlx::query_as(
        r#"SELECT id, owner, kind, title, hierarchy_path, status, progress,
                  error, remote_file_id, remote_folder_id, size_bytes, mime_type,
                  duration_seconds, thumbnail_ref, preview_ref, created_at, updated_at
           FROM artifacts WHERE hierarchy_path = ? AND remote_file_id = ?"#,
    )
    .bind(hierarchy_path)
    .bind(remote_file_id)
    .fetch_optional(pool)
    .await?;
    row.map(ArtifactRow::into_artifact).transpose()
}

pub async fn list_by_hierarchy_path_and_kind(
    pool: &SqlitePool,
    hierarchy_path: &str,
    kind: ArtifactKind,
) -> Result<Vec<Artifact>> {
    let rows: Vec<ArtifactRow> = sqlx::query_as(
        r#"SELECT id, owner, kind, title, hierarchy_path, status, progress,
                  error, remote_file_id, remote_folder_id, size_bytes, mime_type,
                  duration_seconds, thumbnail_ref, preview_ref, created_at, updated_at
           FROM artifacts WHERE hierarchy_path = ? AND kind = ? AND remote_file_id IS NOT NULL"#,
    )
    .bind(hierarchy_path)
    .bind(kind.as_db_str())
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(ArtifactRow::into_artifact).collect()
}

pub async fn delete_all_for_path(pool: &SqlitePool, owner: &str, hierarchy_path: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM artifacts WHERE owner = ? AND hierarchy_path = ?")
        .bind(owner)
        .bind(hierarchy_path)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

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
    async fn create_then_get_roundtrips() {
        let pool = test_pool().await;
        let artifact = create_pending_artifact(
            &pool,
            "user-1",
            ArtifactKind::Video,
            "lecture-1",
            "course/chapter1",
            Some("video/mp4"),
        )
        .await
        .unwrap();

        let fetched = get_artifact(&pool, &artifact.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ArtifactStatus::Pending);
        assert_eq!(fetched.progress, 0);
        assert_eq!(fetched.hierarchy_path, "course/chapter1");
    }

    #[tokio::test]
    async fn sweep_interrupted_flips_processing_rows() {
        let pool = test_pool().await;
        let artifact = create_pending_artifact(
            &pool,
            "user-1",
            ArtifactKind::Video,
            "lecture-1",
            "course/chapter1",
            None,
        )
        .await
        .unwrap();
        set_status(&pool, &artifact.id, ArtifactStatus::Processing, None)
            .await
            .unwrap();

        let swept = sweep_interrupted_jobs(&pool).await.unwrap();
        assert_eq!(swept, 1);

        let fetched = get_artifact(&pool, &artifact.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ArtifactStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("interrupted by restart"));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let pool = test_pool().await;
        let artifact = create_pending_artifact(
            &pool,
            "user-1",
            ArtifactKind::Other,
            "notes",
            "course/chapter1",
            None,
        )
        .await
        .unwrap();

        assert!(delete_artifact(&pool, &artifact.id).await.unwrap());
        assert!(get_artifact(&pool, &artifact.id).await.unwrap().is_none());
    }
}

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::catalog::{self, ArtifactStatus};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const QUEUE_CAPACITY: usize = 256;

/// A terminal status transition that a job worker could not apply inline
/// (the worker has already given up ownership of the job and has nothing
/// left to retry from) but that must still land in the catalog eventually.
pub enum TerminalWrite {
    Canceled { artifact_id: String },
    Failed { artifact_id: String, error: String },
}

/// Small retrying writer pool for terminal `Canceled`/`Failed` catalog
/// transitions. `run_job`/`run_one_download` already retry nothing once a
/// job exits, so a write dropped by a transient SQLite busy error used to
/// strand the artifact in `PROCESSING` forever; this pool gives those writes
/// a few bounded retries on a background task instead.
pub struct DbWriterPool {
    sender: mpsc::Sender<TerminalWrite>,
}

impl DbWriterPool {
    pub fn spawn(pool: SqlitePool, worker_count: usize) -> (Arc<Self>, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<TerminalWrite>(QUEUE_CAPACITY);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let write = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(write) = write else { break };
                    apply_with_retry(&pool, write).await;
                }
            }));
        }

        (Arc::new(Self { sender: tx }), handles)
    }

    /// Enqueues a terminal write for the background pool. Backpressure is
    /// applied by blocking on the bounded channel rather than dropping the
    /// write if the queue is momentarily full.
    pub async fn submit(&self, write: TerminalWrite) {
        if self.sender.send(write).await.is_err() {
            error!(event = "db_writer.queue_closed", "writer pool shut down, terminal write dropped");
        }
    }
}

async fn apply_with_retry(pool: &SqlitePool, write: TerminalWrite) {
    let artifact_id = match &write {
        TerminalWrite::Canceled { artifact_id } => artifact_id.as_str(),
        TerminalWrite::Failed { artifact_id, .. } => artifact_id.as_str(),
    };

    for attempt in 1..=MAX_ATTEMPTS {
        let result = match &write {
            TerminalWrite::Canceled { artifact_id } => {
                catalog::set_status(pool, artifact_id, ArtifactStatus::Canceled, Some("Cancelled by user"))
                    .await
                    .and(catalog::set_progress(pool, artifact_id, 0).await)
            }
            TerminalWrite::Failed { artifact_id, error } => {
                catalog::set_status(pool, artifact_id, ArtifactStatus::Failed, Some(error)).await
            }
        };

        match result {
            Ok(()) => return,
            Err(e) if attempt < MAX_ATTEMPTS => {
                warn!(
                    event = "db_writer.retry",
                    artifact_id,
                    attempt,
                    error = %e,
                    "terminal catalog write failed, retrying"
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
            }
            Err(e) => {
                error!(
                    event = "db_writer.give_up",
                    artifact_id,
                    error = %e,
                    "terminal catalog write failed after max attempts"
                );
            }
        }
    }
}

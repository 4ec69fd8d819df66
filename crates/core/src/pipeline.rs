use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

struct JobTicket {
    cancel: CancellationToken,
}

struct ProgressEntry {
    last_percent: u8,
    last_reported_at: Instant,
}

#[derive(Clone, Copy)]
struct SpeedSample {
    bytes_per_second: f64,
    sampled_at: Instant,
}

/// The single owned value holding every piece of cross-job mutable state the
/// pipeline needs: the job registry (for cancellation), the progress-throttle
/// cache, and the speed-tracking cache. Each map is behind its own short-lived
/// lock; callers never hold one across an await point.
pub struct PipelineController {
    jobs: Mutex<HashMap<String, JobTicket>>,
    progress: Mutex<HashMap<String, ProgressEntry>>,
    speed: Mutex<HashMap<String, SpeedSample>>,
}

const PROGRESS_MIN_DELTA: u8 = 3;
const PROGRESS_MIN_INTERVAL: Duration = Duration::from_secs(1);

impl PipelineController {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            speed: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new active job and returns the cancellation token the
    /// worker should observe cooperatively.
    pub fn register_job(&self, artifact_id: &str) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.jobs.lock().unwrap().insert(
            artifact_id.to_string(),
            JobTicket {
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub fn unregister_job(&self, artifact_id: &str) {
        self.jobs.lock().unwrap().remove(artifact_id);
        self.progress.lock().unwrap().remove(artifact_id);
    }

    /// Cancels the job if one is registered; returns whether a job was found.
    pub fn cancel(&self, artifact_id: &str) -> bool {
        match self.jobs.lock().unwrap().get(artifact_id) {
            Some(ticket) => {
                ticket.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, artifact_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(artifact_id)
    }

    /// Throttled progress report: drops updates within 3 points and 1s of the
    /// last one, but status-changing transitions go through `catalog::`
    /// functions directly and are never dropped by this cache.
    pub fn report_progress(&self, artifact_id: &str, percent: u8) -> bool {
        let mut progress = self.progress.lock().unwrap();
        let now = Instant::now();
        match progress.get(artifact_id) {
            Some(entry)
                if percent.abs_diff(entry.last_percent) < PROGRESS_MIN_DELTA
                    && now.duration_since(entry.last_reported_at) < PROGRESS_MIN_INTERVAL
                    && percent != 100 =>
            {
                false
            }
            _ => {
                progress.insert(
                    artifact_id.to_string(),
                    ProgressEntry {
                        last_percent: percent,
                        last_reported_at: now,
                    },
                );
                true
            }
        }
    }

    /// Records a rolling speed sample (bytes observed over at least 0.5s).
    pub fn record_speed_sample(&self, artifact_id: &str, bytes_per_second: f64) {
        self.speed.lock().unwrap().insert(
            artifact_id.to_string(),
            SpeedSample {
                bytes_per_second,
                sampled_at: Instant::now(),
            },
        );
    }

    /// Returns the last known throughput in MiB/s, or 0 if no sample exists
    /// or the job has finished (cleared on cancel/unregister).
    pub fn speed_mbps(&self, artifact_id: &str) -> f64 {
        self.speed
            .lock()
            .unwrap()
            .get(artifact_id)
            .map(|s| s.bytes_per_second / (1024.0 * 1024.0))
            .unwrap_or(0.0)
    }

    pub fn clear_speed(&self, artifact_id: &str) {
        self.speed.lock().unwrap().remove(artifact_id);
    }
}

impl Default for PipelineController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_returns_false_for_unknown_artifact() {
        let controller = PipelineController::new();
        assert!(!controller.cancel("missing"));
    }

    #[test]
    fn register_then_cancel_cancels_token() {
        let controller = PipelineController::new();
        let token = controller.register_job("art-1");
        assert!(!token.is_cancelled());
        assert!(controller.cancel("art-1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn progress_throttle_drops_small_fast_updates_but_keeps_100() {
        let controller = PipelineController::new();
        assert!(controller.report_progress("art-1", 10));
        assert!(!controller.report_progress("art-1", 11));
        assert!(controller.report_progress("art-1", 100));
    }
}

//! In-process job queue for tests and simulation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use scanfleet_core::ScanRequest;

use crate::client::JobQueue;
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
struct RunningScan {
    host: String,
    dispatched_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<ScanRequest>,
    running: HashMap<String, RunningScan>,
    completed: HashSet<String>,
    unavailable: bool,
    reject_dispatch: bool,
}

/// A job queue held entirely in memory.
///
/// Scans move `pending → running → completed`. With a scan duration set,
/// a running scan completes on its own once that long has passed since
/// dispatch; otherwise call [`complete`](Self::complete).
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    scan_duration: Option<Duration>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete every scan automatically `duration` after dispatch.
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = Some(duration);
        self
    }

    pub async fn submit(&self, request: ScanRequest) {
        debug!(job = %request.id, size = request.size_metric, "scan queued");
        self.state.lock().await.pending.push(request);
    }

    /// Mark a running scan finished.
    pub async fn complete(&self, job_id: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.running.remove(job_id).is_none() {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        }
        state.completed.insert(job_id.to_string());
        Ok(())
    }

    /// Running scans as `(job, host)` pairs, sorted by job id.
    pub async fn running(&self) -> Vec<(String, String)> {
        let state = self.state.lock().await;
        let mut running: Vec<(String, String)> = state
            .running
            .iter()
            .map(|(job, scan)| (job.clone(), scan.host.clone()))
            .collect();
        running.sort();
        running
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn completed_len(&self) -> usize {
        self.state.lock().await.completed.len()
    }

    /// Make every call fail with [`QueueError::Unavailable`].
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Make `dispatch` fail with [`QueueError::Rejected`].
    pub async fn set_reject_dispatch(&self, reject: bool) {
        self.state.lock().await.reject_dispatch = reject;
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn list_pending(&self) -> QueueResult<Vec<ScanRequest>> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(QueueError::Unavailable("queue offline".to_string()));
        }
        Ok(state.pending.clone())
    }

    async fn dispatch(&self, job_id: &str, host: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(QueueError::Unavailable("queue offline".to_string()));
        }
        if state.reject_dispatch {
            return Err(QueueError::Rejected {
                job: job_id.to_string(),
                host: host.to_string(),
                reason: "engine refused the scan".to_string(),
            });
        }

        let slot = state
            .pending
            .iter()
            .position(|r| r.id == job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        state.pending.remove(slot);
        state.running.insert(
            job_id.to_string(),
            RunningScan {
                host: host.to_string(),
                dispatched_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn is_complete(&self, job_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        if state.unavailable {
            return Err(QueueError::Unavailable("queue offline".to_string()));
        }
        if state.completed.contains(job_id) {
            return Ok(true);
        }

        let Some(scan) = state.running.get(job_id) else {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        };
        let finished = self
            .scan_duration
            .is_some_and(|d| scan.dispatched_at.elapsed() >= d);
        if finished {
            state.running.remove(job_id);
            state.completed.insert(job_id.to_string());
        }
        Ok(finished)
    }
}

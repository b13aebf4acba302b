//! The job queue port.

use async_trait::async_trait;

use scanfleet_core::ScanRequest;

use crate::error::QueueResult;

/// Client for the external service that holds queued scans.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Scans waiting for an engine, in no particular order.
    async fn list_pending(&self) -> QueueResult<Vec<ScanRequest>>;

    /// Hand a scan to the engine at `host`.
    async fn dispatch(&self, job_id: &str, host: &str) -> QueueResult<()>;

    /// Whether a dispatched scan has finished.
    async fn is_complete(&self, job_id: &str) -> QueueResult<bool>;
}

//! Queue monitor — fixed-rate matching of queued scans to engines.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use scanfleet_core::{ScanRequest, epoch_millis, sort_queue};
use scanfleet_pool::{Engine, EnginePool, EngineState};

use crate::client::JobQueue;
use crate::error::{QueueError, QueueResult};

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Scans returned by the queue.
    pub fetched: usize,
    pub dispatched: usize,
    /// Scans left queued for lack of an idle engine.
    pub waiting: usize,
    /// Scans whose size matches no tier.
    pub unclassified: usize,
    /// Slots claimed for provisioning.
    pub provisioning_requested: usize,
    pub failures: usize,
    /// The queue could not be read this tick.
    pub queue_unavailable: bool,
}

/// Polls the job queue and claims engines for pending scans.
pub struct QueueMonitor {
    pool: Arc<EnginePool>,
    queue: Arc<dyn JobQueue>,
    /// Bounds every queue call.
    fetch_timeout: Duration,
}

impl QueueMonitor {
    pub fn new(pool: Arc<EnginePool>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            pool,
            queue,
            fetch_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Run one matching pass over the queue.
    ///
    /// A failure for one scan is counted and the pass moves on.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let mut jobs = match self.bounded(self.queue.list_pending()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "failed to fetch scan queue");
                report.queue_unavailable = true;
                return report;
            }
        };

        report.fetched = jobs.len();
        if jobs.is_empty() {
            debug!("scan queue empty");
            return report;
        }
        sort_queue(&mut jobs);

        // Scans per tier that found no idle engine this tick.
        let mut unmatched: HashMap<String, u32> = HashMap::new();

        for job in &jobs {
            let Some(tier) = self.pool.calc_engine_size(job.size_metric) else {
                warn!(job = %job.id, size = job.size_metric, "scan size matches no tier, skipping");
                report.unclassified += 1;
                continue;
            };
            let tier = tier.name.clone();

            match self
                .pool
                .allocate_engine(&tier, EngineState::Idle, EngineState::Scanning)
                .await
            {
                Ok(Some(engine)) => self.dispatch(job, &engine, &mut report).await,
                Ok(None) => {
                    report.waiting += 1;
                    let backlog = unmatched.entry(tier.clone()).or_default();
                    *backlog += 1;
                    let backlog = *backlog;
                    self.request_provisioning(&tier, backlog, &mut report).await;
                }
                Err(e) => {
                    error!(job = %job.id, %tier, error = %e, "engine allocation failed");
                    report.failures += 1;
                }
            }
        }

        if report.dispatched > 0 || report.provisioning_requested > 0 {
            info!(
                fetched = report.fetched,
                dispatched = report.dispatched,
                waiting = report.waiting,
                provisioning = report.provisioning_requested,
                "queue tick complete"
            );
        } else {
            debug!(fetched = report.fetched, waiting = report.waiting, "queue tick complete");
        }
        report
    }

    /// Run ticks every `interval` until `shutdown` flips to true.
    ///
    /// Ticks that would overlap a slow pass are skipped.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "queue monitor started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    info!("queue monitor shutting down");
                    break;
                }
            }
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    async fn dispatch(&self, job: &ScanRequest, engine: &Engine, report: &mut TickReport) {
        let Some(host) = engine.host() else {
            error!(engine = %engine.name(), job = %job.id, "scanning engine has no host");
            self.release(engine).await;
            report.failures += 1;
            return;
        };

        match self.bounded(self.queue.dispatch(&job.id, host)).await {
            Ok(()) => {
                self.record_job(engine, job).await;
                info!(engine = %engine.name(), tier = %engine.tier(), job = %job.id, %host, "scan dispatched");
                report.dispatched += 1;
            }
            Err(e @ QueueError::Timeout(_)) => {
                // The queue may have accepted the scan. Hold the engine on the
                // job; completion or the scan timeout frees it.
                warn!(engine = %engine.name(), job = %job.id, error = %e, "scan dispatch outcome unknown, holding engine");
                self.record_job(engine, job).await;
                report.failures += 1;
            }
            Err(e) => {
                warn!(engine = %engine.name(), job = %job.id, error = %e, "scan dispatch failed");
                self.release(engine).await;
                report.failures += 1;
            }
        }
    }

    async fn record_job(&self, engine: &Engine, job: &ScanRequest) {
        let assigned = self
            .pool
            .update_if(engine.name(), EngineState::Scanning, |e| e.assign_job(job.id.clone()))
            .await;
        if let Err(e) = assigned {
            error!(engine = %engine.name(), job = %job.id, error = %e, "failed to record job");
        }
    }

    /// Bound a queue call by the fetch timeout.
    async fn bounded<T>(&self, call: impl Future<Output = QueueResult<T>>) -> QueueResult<T> {
        match tokio::time::timeout(self.fetch_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Timeout(self.fetch_timeout)),
        }
    }

    /// Return an engine claimed for a failed dispatch to idle.
    async fn release(&self, engine: &Engine) {
        let released = self
            .pool
            .update_if(engine.name(), EngineState::Scanning, |e| e.on_idle(epoch_millis()))
            .await;
        if let Err(e) = released {
            error!(engine = %engine.name(), error = %e, "failed to release engine");
        }
    }

    /// Claim a slot for provisioning unless launches already in flight
    /// cover the tier's `backlog`.
    async fn request_provisioning(&self, tier: &str, backlog: u32, report: &mut TickReport) {
        let counts = self.pool.tier_counts(tier).await;
        if counts.in_flight() >= backlog {
            debug!(%tier, backlog, in_flight = counts.in_flight(), "provisioning already in flight");
            return;
        }

        match self
            .pool
            .allocate_engine(tier, EngineState::Unprovisioned, EngineState::Pending)
            .await
        {
            Ok(Some(engine)) => {
                info!(engine = %engine.name(), %tier, "engine requested for queued scan");
                report.provisioning_requested += 1;
            }
            Ok(None) => debug!(%tier, "tier at capacity, scan waits"),
            Err(e) => {
                error!(%tier, error = %e, "provisioning claim failed");
                report.failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueue;
    use scanfleet_core::PoolEntry;

    fn test_pool(total: u32) -> Arc<EnginePool> {
        Arc::new(
            EnginePool::new(
                "engine",
                vec![
                    PoolEntry::new("S", 0, 99, total, 0),
                    PoolEntry::new("L", 100, 999, total, 0),
                ],
            )
            .unwrap(),
        )
    }

    async fn make_idle(pool: &EnginePool, tier: &str) -> Engine {
        let engine = pool
            .allocate_engine(tier, EngineState::Unprovisioned, EngineState::Pending)
            .await
            .unwrap()
            .unwrap();
        pool.update(engine.name(), |e| {
            e.on_start(1_000, "10.0.0.1:8080")?;
            e.on_idle(1_000)
        })
        .await
        .unwrap()
    }

    fn monitor(pool: &Arc<EnginePool>, queue: &Arc<InMemoryQueue>) -> QueueMonitor {
        let client: Arc<dyn JobQueue> = queue.clone();
        QueueMonitor::new(Arc::clone(pool), client).with_fetch_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn dispatches_to_idle_engine() {
        let pool = test_pool(2);
        let queue = Arc::new(InMemoryQueue::new());
        let idle = make_idle(&pool, "S").await;
        queue.submit(ScanRequest::new("scan-1", 50)).await;

        let report = monitor(&pool, &queue).tick().await;

        assert_eq!(report.fetched, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.provisioning_requested, 0);
        let engine = pool.engine_by_name(idle.name()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Scanning);
        assert_eq!(engine.job(), Some("scan-1"));
        assert_eq!(queue.pending_len().await, 0);
    }

    #[tokio::test]
    async fn dispatches_in_queue_order() {
        let pool = test_pool(2);
        let queue = Arc::new(InMemoryQueue::new());
        let idle = make_idle(&pool, "S").await;
        queue.submit(ScanRequest::new("later", 5).with_queue_position(2)).await;
        queue.submit(ScanRequest::new("first", 5).with_queue_position(1)).await;

        let report = monitor(&pool, &queue).tick().await;

        assert_eq!(report.dispatched, 1);
        assert_eq!(report.waiting, 1);
        let engine = pool.engine_by_name(idle.name()).await.unwrap();
        assert_eq!(engine.job(), Some("first"));
    }

    #[tokio::test]
    async fn miss_requests_one_engine_per_waiting_scan() {
        let pool = test_pool(3);
        let queue = Arc::new(InMemoryQueue::new());
        for i in 0..2 {
            queue.submit(ScanRequest::new(format!("scan-{i}"), 500)).await;
        }
        let monitor = monitor(&pool, &queue);

        let report = monitor.tick().await;
        assert_eq!(report.waiting, 2);
        assert_eq!(report.provisioning_requested, 2);
        assert_eq!(pool.tier_counts("L").await.pending, 2);

        // The same backlog next tick is covered by what is already pending.
        let report = monitor.tick().await;
        assert_eq!(report.provisioning_requested, 0);
        assert_eq!(pool.tier_counts("L").await.pending, 2);
        assert_eq!(pool.tier_counts("S").await.pending, 0);
    }

    #[tokio::test]
    async fn miss_at_capacity_leaves_scan_queued() {
        let pool = test_pool(1);
        let queue = Arc::new(InMemoryQueue::new());
        pool.allocate_engine("S", EngineState::Unprovisioned, EngineState::Pending)
            .await
            .unwrap();
        for i in 0..3 {
            queue.submit(ScanRequest::new(format!("scan-{i}"), 1)).await;
        }

        let report = monitor(&pool, &queue).tick().await;

        assert_eq!(report.waiting, 3);
        assert_eq!(report.provisioning_requested, 0);
        assert_eq!(report.failures, 0);
        assert_eq!(queue.pending_len().await, 3);
    }

    #[tokio::test]
    async fn unclassified_scans_are_skipped() {
        let pool = test_pool(1);
        let queue = Arc::new(InMemoryQueue::new());
        let idle = make_idle(&pool, "S").await;
        queue.submit(ScanRequest::new("huge", 10_000).with_queue_position(1)).await;
        queue.submit(ScanRequest::new("small", 1).with_queue_position(2)).await;

        let report = monitor(&pool, &queue).tick().await;

        assert_eq!(report.unclassified, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(pool.engine_by_name(idle.name()).await.unwrap().job(), Some("small"));
    }

    #[tokio::test]
    async fn failed_dispatch_returns_engine_to_idle() {
        let pool = test_pool(1);
        let queue = Arc::new(InMemoryQueue::new());
        let idle = make_idle(&pool, "S").await;
        queue.submit(ScanRequest::new("scan-1", 1)).await;
        queue.set_reject_dispatch(true).await;

        let report = monitor(&pool, &queue).tick().await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.dispatched, 0);
        let engine = pool.engine_by_name(idle.name()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.job().is_none());
        assert_eq!(queue.pending_len().await, 1);
    }

    /// Lists one scan and never answers a dispatch in time.
    struct StalledDispatch;

    #[async_trait::async_trait]
    impl JobQueue for StalledDispatch {
        async fn list_pending(&self) -> QueueResult<Vec<ScanRequest>> {
            Ok(vec![ScanRequest::new("scan-1", 1)])
        }

        async fn dispatch(&self, _job_id: &str, _host: &str) -> QueueResult<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn is_complete(&self, _job_id: &str) -> QueueResult<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn dispatch_timeout_holds_engine_on_job() {
        let pool = test_pool(1);
        let idle = make_idle(&pool, "S").await;
        let client: Arc<dyn JobQueue> = Arc::new(StalledDispatch);
        let monitor =
            QueueMonitor::new(Arc::clone(&pool), client).with_fetch_timeout(Duration::from_millis(50));

        let report = monitor.tick().await;

        assert_eq!(report.failures, 1);
        assert_eq!(report.dispatched, 0);
        let engine = pool.engine_by_name(idle.name()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Scanning);
        assert_eq!(engine.job(), Some("scan-1"));

        // The held engine is not offered to the next tick.
        let report = monitor.tick().await;
        assert_eq!(report.waiting, 1);
        assert_eq!(report.failures, 0);
    }

    #[tokio::test]
    async fn unavailable_queue_skips_tick() {
        let pool = test_pool(1);
        let queue = Arc::new(InMemoryQueue::new());
        queue.submit(ScanRequest::new("scan-1", 1)).await;
        queue.set_unavailable(true).await;

        let report = monitor(&pool, &queue).tick().await;

        assert!(report.queue_unavailable);
        assert_eq!(report.fetched, 0);
        assert_eq!(pool.tier_counts("S").await.unprovisioned, 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let pool = test_pool(1);
        let queue = Arc::new(InMemoryQueue::new());
        let monitor = monitor(&pool, &queue);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            monitor.run(Duration::from_millis(10), rx).await;
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

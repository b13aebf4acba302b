//! ServiceSupervisor — owns the two long-running service tasks.
//!
//! ```text
//! start():  FleetManager::initialize ─► spawn FleetManager::run
//!                                     └► spawn QueueMonitor::run
//! run_until(signal):  signal fires ──┐
//!                     a task exits ──┴─► stop(): shutdown=true, join (bounded), abort
//!                                            └► terminate_all (if terminate_on_stop)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use scanfleet_core::FleetTimings;
use scanfleet_manager::FleetManager;
use scanfleet_queue::QueueMonitor;

const FLEET_MANAGER: &str = "fleet manager";
const QUEUE_MONITOR: &str = "queue monitor";

/// Reports a task's exit when dropped, including by a panic.
struct ExitGuard {
    task: &'static str,
    exited: mpsc::UnboundedSender<&'static str>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.exited.send(self.task);
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    manager: JoinHandle<()>,
    monitor: JoinHandle<()>,
    exited: mpsc::UnboundedReceiver<&'static str>,
}

pub struct ServiceSupervisor {
    manager: Arc<FleetManager>,
    monitor: Arc<QueueMonitor>,
    reconcile_interval: Duration,
    queue_interval: Duration,
    shutdown_timeout: Duration,
    terminate_on_stop: bool,
    running: Option<Running>,
}

impl ServiceSupervisor {
    pub fn new(manager: Arc<FleetManager>, monitor: Arc<QueueMonitor>, timings: &FleetTimings) -> Self {
        Self {
            manager,
            monitor,
            reconcile_interval: timings.reconcile_interval,
            queue_interval: timings.queue_interval,
            shutdown_timeout: timings.shutdown_timeout,
            terminate_on_stop: false,
            running: None,
        }
    }

    /// Tear down every provisioned engine once both loops have stopped.
    pub fn with_terminate_on_stop(mut self, enabled: bool) -> Self {
        self.terminate_on_stop = enabled;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Rebuild the pool from the provider, then start both loops.
    ///
    /// Nothing is started if the rebuild fails.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.running.is_some() {
            bail!("services already started");
        }

        let restored = self
            .manager
            .initialize()
            .await
            .context("failed to rebuild engine pool from provider")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exit_tx, exited) = mpsc::unbounded_channel();

        let manager = {
            let manager = Arc::clone(&self.manager);
            let shutdown = shutdown_rx.clone();
            let guard = ExitGuard {
                task: FLEET_MANAGER,
                exited: exit_tx.clone(),
            };
            let interval = self.reconcile_interval;
            tokio::spawn(async move {
                let _guard = guard;
                manager.run(interval, shutdown).await;
            })
        };

        let monitor = {
            let monitor = Arc::clone(&self.monitor);
            let guard = ExitGuard {
                task: QUEUE_MONITOR,
                exited: exit_tx,
            };
            let interval = self.queue_interval;
            tokio::spawn(async move {
                let _guard = guard;
                monitor.run(interval, shutdown_rx).await;
            })
        };

        self.running = Some(Running {
            shutdown_tx,
            manager,
            monitor,
            exited,
        });
        info!(restored, "services started");
        Ok(())
    }

    /// Serve until `signal` resolves or a service task exits on its own,
    /// then stop both tasks.
    ///
    /// Returns an error if a task exited unexpectedly.
    pub async fn run_until<F>(&mut self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let Some(running) = self.running.as_mut() else {
            bail!("services not started");
        };

        let outcome = tokio::select! {
            _ = signal => {
                info!("shutdown signal received");
                Ok(())
            }
            task = running.exited.recv() => {
                let task = task.unwrap_or("service task");
                error!(task, "service task exited unexpectedly, shutting down");
                Err(anyhow!("{task} exited unexpectedly"))
            }
        };

        self.stop().await;
        outcome
    }

    /// Signal shutdown and wait for both tasks, aborting any that take
    /// longer than the shutdown timeout. With terminate-on-stop set, every
    /// provisioned engine is then terminated.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);
        join_or_abort(FLEET_MANAGER, running.manager, self.shutdown_timeout).await;
        join_or_abort(QUEUE_MONITOR, running.monitor, self.shutdown_timeout).await;
        if self.terminate_on_stop {
            self.manager.terminate_all().await;
        }
        info!("services stopped");
    }
}

async fn join_or_abort(task: &'static str, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => debug!(task, "task stopped"),
        Ok(Err(e)) => warn!(task, error = %e, "task ended abnormally"),
        Err(_) => {
            warn!(task, ?timeout, "task did not stop in time, aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scanfleet_core::{FleetConfig, PoolEntry, ScanRequest};
    use scanfleet_manager::{
        CloudDriver, DriverError, DriverResult, FleetPolicy, InstanceStatus, LaunchSpec,
        ProvisionedInstance, SimulatedCloud,
    };
    use scanfleet_pool::EnginePool;
    use scanfleet_queue::{InMemoryQueue, JobQueue, QueueResult};

    struct OfflineCloud;

    #[async_trait]
    impl CloudDriver for OfflineCloud {
        async fn launch(&self, _spec: &LaunchSpec) -> DriverResult<String> {
            Err(DriverError::Unavailable("offline".to_string()))
        }

        async fn terminate(&self, _name: &str) -> DriverResult<()> {
            Err(DriverError::Unavailable("offline".to_string()))
        }

        async fn status(&self, _name: &str) -> DriverResult<InstanceStatus> {
            Err(DriverError::Unavailable("offline".to_string()))
        }

        async fn list(&self) -> DriverResult<Vec<ProvisionedInstance>> {
            Err(DriverError::Unavailable("offline".to_string()))
        }
    }

    struct PanickingQueue;

    #[async_trait]
    impl JobQueue for PanickingQueue {
        async fn list_pending(&self) -> QueueResult<Vec<ScanRequest>> {
            panic!("queue client bug");
        }

        async fn dispatch(&self, _job_id: &str, _host: &str) -> QueueResult<()> {
            Ok(())
        }

        async fn is_complete(&self, _job_id: &str) -> QueueResult<bool> {
            Ok(false)
        }
    }

    fn timings() -> FleetTimings {
        let mut config = FleetConfig::from_toml_str(
            r#"
            [[pool]]
            tier = "S"
            min_metric = 0
            max_metric = 100
            total = 1
            "#,
        )
        .unwrap();
        config.fleet.queue_interval = "20ms".to_string();
        config.fleet.reconcile_interval = "20ms".to_string();
        config.fleet.shutdown_timeout = "1s".to_string();
        config.timings().unwrap()
    }

    fn supervisor(driver: Arc<dyn CloudDriver>, queue: Arc<dyn JobQueue>) -> (Arc<EnginePool>, ServiceSupervisor) {
        supervisor_with(driver, queue, false)
    }

    fn supervisor_with(
        driver: Arc<dyn CloudDriver>,
        queue: Arc<dyn JobQueue>,
        terminate_on_stop: bool,
    ) -> (Arc<EnginePool>, ServiceSupervisor) {
        let pool = Arc::new(EnginePool::new("engine", vec![PoolEntry::new("S", 0, 100, 2, 1)]).unwrap());
        let manager = FleetManager::new(Arc::clone(&pool), driver, Arc::clone(&queue), FleetPolicy::default());
        let monitor = QueueMonitor::new(Arc::clone(&pool), queue);
        let supervisor = ServiceSupervisor::new(Arc::new(manager), Arc::new(monitor), &timings())
            .with_terminate_on_stop(terminate_on_stop);
        (pool, supervisor)
    }

    #[tokio::test]
    async fn runs_until_signal_then_stops() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        let (pool, mut supervisor) = supervisor(Arc::new(SimulatedCloud::new(Duration::ZERO)), queue);

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        assert!(supervisor.start().await.is_err());

        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(!supervisor.is_running());
        assert_eq!(pool.tier_counts("S").await.idle, 1);
    }

    #[tokio::test]
    async fn stop_terminates_engines_when_configured() {
        let cloud = Arc::new(SimulatedCloud::new(Duration::ZERO));
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        let (pool, mut supervisor) = supervisor_with(cloud.clone(), queue, true);

        supervisor.start().await.unwrap();
        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert_eq!(pool.tier_counts("S").await.unprovisioned, 2);
        assert!(cloud.is_terminated("engine-s-01").await);
        assert!(cloud.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_leaves_engines_running_by_default() {
        let cloud = Arc::new(SimulatedCloud::new(Duration::ZERO));
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        let (pool, mut supervisor) = supervisor(cloud.clone(), queue);

        supervisor.start().await.unwrap();
        supervisor
            .run_until(tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert_eq!(pool.tier_counts("S").await.idle, 1);
        assert!(!cloud.is_terminated("engine-s-01").await);
    }

    #[tokio::test]
    async fn initialize_failure_starts_nothing() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        let (_pool, mut supervisor) = supervisor(Arc::new(OfflineCloud), queue);

        let err = supervisor.start().await.unwrap_err();
        assert!(err.to_string().contains("rebuild engine pool"));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn task_exit_shuts_everything_down() {
        let queue: Arc<dyn JobQueue> = Arc::new(PanickingQueue);
        let (_pool, mut supervisor) = supervisor(Arc::new(SimulatedCloud::new(Duration::ZERO)), queue);

        supervisor.start().await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            supervisor.run_until(std::future::pending()),
        )
        .await
        .unwrap();

        let err = result.unwrap_err();
        assert!(err.to_string().contains("queue monitor"));
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        let (_pool, mut supervisor) = supervisor(Arc::new(SimulatedCloud::new(Duration::ZERO)), queue);
        supervisor.stop().await;
        assert!(supervisor.run_until(async {}).await.is_err());
    }
}

//! FleetManager — the reconciliation loop.
//!
//! Every cycle takes a fresh snapshot per phase, asks [`crate::plan`] which
//! engines to act on, talks to the provider with no pool lock held, and
//! applies each transition with `update_if` so a result computed from a
//! stale snapshot is dropped rather than applied.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use scanfleet_core::epoch_millis;
use scanfleet_pool::{Engine, EnginePool, EngineState, PoolResult};
use scanfleet_queue::{JobQueue, QueueError};

use crate::driver::{CloudDriver, InstanceStatus, LaunchSpec};
use crate::error::{DriverError, DriverResult, FleetResult};
use crate::hooks::LifecycleHook;
use crate::plan::{self, FleetPolicy, ReapCheck, ScanCheck, StartupCheck};
use crate::probe::{ProbeResult, ReadinessProbe};

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Slots claimed to restore min idle.
    pub claimed: usize,
    pub launched: usize,
    /// Started engines that became idle.
    pub ready: usize,
    /// Launches or startups that failed; their slots were released.
    pub failed: usize,
    pub expired: usize,
    /// Expiring engines whose slots were released.
    pub stopped: usize,
    /// Scans that finished, freeing their engine.
    pub completed: usize,
    /// Scans past the scan timeout whose engine was reclaimed.
    pub abandoned: usize,
    /// Provider, queue or pool errors that left an engine as it was.
    pub errors: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives cloud provisioning for every engine in the pool.
pub struct FleetManager {
    pool: Arc<EnginePool>,
    driver: Arc<dyn CloudDriver>,
    queue: Arc<dyn JobQueue>,
    policy: FleetPolicy,
    hooks: Option<Arc<dyn LifecycleHook>>,
    probe: Option<ReadinessProbe>,
    tags: BTreeMap<String, String>,
    /// Bounds status, terminate and list calls.
    provider_timeout: Duration,
    /// Bounds completion polls.
    queue_timeout: Duration,
}

impl FleetManager {
    pub fn new(
        pool: Arc<EnginePool>,
        driver: Arc<dyn CloudDriver>,
        queue: Arc<dyn JobQueue>,
        policy: FleetPolicy,
    ) -> Self {
        Self {
            pool,
            driver,
            queue,
            policy,
            hooks: None,
            probe: None,
            tags: BTreeMap::new(),
            provider_timeout: Duration::from_secs(30),
            queue_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHook>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Require a 2xx readiness probe before a running engine goes idle.
    pub fn with_probe(mut self, probe: ReadinessProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Tags passed to every launch.
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_provider_timeout(mut self, timeout: Duration) -> Self {
        self.provider_timeout = timeout;
        self
    }

    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Arc<EnginePool> {
        &self.pool
    }

    /// Rebuild the pool from the provider's instance list.
    ///
    /// Running instances come back idle and starting ones as starting;
    /// terminated instances and names that are not pool slots are skipped.
    /// Returns the number of engines restored.
    pub async fn initialize(&self) -> FleetResult<usize> {
        let instances = self.provider_call("list", self.driver.list()).await?;
        let now = epoch_millis();
        let mut restored = 0;

        for instance in instances {
            let Some(slot) = self.pool.engine_by_name(&instance.name).await else {
                warn!(engine = %instance.name, host = %instance.host, "provider instance is not a pool slot, ignoring");
                continue;
            };

            let mut engine = Engine::new(instance.name.clone(), slot.tier());
            match instance.status {
                InstanceStatus::Terminated => continue,
                InstanceStatus::Running => {
                    engine.on_start(now, instance.host)?;
                    engine.on_idle(now)?;
                }
                // Unreachable instances get a fresh launch timeout to recover.
                InstanceStatus::Starting | InstanceStatus::Unreachable => {
                    engine.on_start(now, instance.host)?;
                }
            }
            self.pool.add_existing_engine(engine).await?;
            restored += 1;
        }

        info!(restored, "engine pool rebuilt from provider");
        Ok(restored)
    }

    /// Run one reconciliation cycle now.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(epoch_millis()).await
    }

    /// Run one reconciliation cycle as of `now` (epoch ms).
    pub async fn run_cycle_at(&self, now: u64) -> CycleReport {
        let mut report = CycleReport::default();

        self.launch_pending(now, &mut report).await;
        self.check_starting(now, &mut report).await;
        self.expire_idle(now, &mut report).await;
        self.reap_expiring(now, &mut report).await;
        self.complete_scans(now, &mut report).await;

        if report.is_empty() {
            debug!("fleet reconciled, nothing to do");
        } else {
            info!(
                claimed = report.claimed,
                launched = report.launched,
                ready = report.ready,
                failed = report.failed,
                expired = report.expired,
                stopped = report.stopped,
                completed = report.completed,
                abandoned = report.abandoned,
                errors = report.errors,
                "reconciliation cycle complete"
            );
        }
        report
    }

    /// Run cycles until `shutdown` flips to true.
    ///
    /// A cycle starts every `interval` and whenever the pool reports a
    /// provisioning request. Shutdown lets the current cycle finish.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "fleet manager started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("fleet manager shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.pool.provisioning_requested() => {
                    debug!("provisioning requested, reconciling early");
                }
            }
            self.run_cycle().await;
        }
    }

    /// Terminate every engine that holds an instance and release its slot.
    ///
    /// Meant for after the loops have stopped. An engine whose terminate
    /// call fails keeps its state. Returns the number of slots released.
    pub async fn terminate_all(&self) -> usize {
        let snapshot = self.pool.snapshot().await;
        let mut released = 0;

        for engine in snapshot.engines().iter().filter(|e| e.host().is_some()) {
            if let Err(e) = self.provider_call("terminate", self.driver.terminate(engine.name())).await {
                warn!(engine = %engine.name(), error = %e, "terminate on stop failed");
                continue;
            }
            let stopped = self
                .pool
                .update_if(engine.name(), engine.state(), |e| e.on_stop())
                .await;
            if self.applied(engine, "stop", stopped) {
                released += 1;
            }
        }

        info!(released, "fleet terminated on stop");
        released
    }

    // ── Phases ─────────────────────────────────────────────────────

    async fn launch_pending(&self, now: u64, report: &mut CycleReport) {
        report.claimed = self.pool.allocate_min_idle_engines().await.len();

        let snapshot = self.pool.snapshot().await;
        for engine in plan::pending_launches(&snapshot) {
            self.launch(&engine, now, report).await;
        }
    }

    async fn launch(&self, engine: &Engine, now: u64, report: &mut CycleReport) {
        let spec = LaunchSpec {
            name: engine.name().to_string(),
            tier: engine.tier().to_string(),
            instance_type: self
                .pool
                .entry(engine.tier())
                .and_then(|e| e.instance_type.clone()),
            tags: self.tags.clone(),
        };

        let launched = match tokio::time::timeout(self.policy.launch_timeout, self.driver.launch(&spec)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                op: "launch",
                timeout: self.policy.launch_timeout,
            }),
        };

        match launched {
            Ok(host) => {
                let started = self
                    .pool
                    .update_if(engine.name(), EngineState::Pending, |e| e.on_start(now, host.clone()))
                    .await;
                if self.applied(engine, "start", started) {
                    info!(engine = %engine.name(), tier = %engine.tier(), %host, "engine launched");
                    report.launched += 1;
                }
            }
            Err(e) => {
                warn!(engine = %engine.name(), tier = %engine.tier(), error = %e, "engine launch failed");
                if matches!(e, DriverError::Timeout { .. }) {
                    // The instance may exist even though the call timed out.
                    self.terminate_best_effort(engine.name()).await;
                }
                let stopped = self
                    .pool
                    .update_if(engine.name(), EngineState::Pending, |e| e.on_stop())
                    .await;
                if self.applied(engine, "release", stopped) {
                    report.failed += 1;
                }
            }
        }
    }

    async fn check_starting(&self, now: u64, report: &mut CycleReport) {
        let snapshot = self.pool.snapshot().await;
        for check in plan::startup_checks(&snapshot, now, &self.policy) {
            self.check_startup(check, now, report).await;
        }
    }

    async fn check_startup(&self, check: StartupCheck, now: u64, report: &mut CycleReport) {
        let StartupCheck { engine, overdue } = check;

        let status = match self.provider_call("status", self.driver.status(engine.name())).await {
            Ok(status) => Some(status),
            Err(e) => {
                warn!(engine = %engine.name(), error = %e, "engine status check failed");
                report.errors += 1;
                None
            }
        };

        if status == Some(InstanceStatus::Running) && self.is_ready(&engine).await {
            let ready = self
                .pool
                .update_if(engine.name(), EngineState::Starting, |e| e.on_idle(now))
                .await;
            if self.applied(&engine, "go idle", ready) {
                let host = engine.host().unwrap_or_default().to_string();
                info!(engine = %engine.name(), tier = %engine.tier(), %host, "engine ready");
                report.ready += 1;
                self.fire_launch_hook(engine.name(), &host);
            }
            return;
        }

        // Unreachable counts as still starting until the launch timeout.
        let reason = match status {
            Some(InstanceStatus::Terminated) => "instance terminated during startup",
            Some(InstanceStatus::Unreachable) if overdue => "instance unreachable past launch timeout",
            _ if overdue => "launch timed out",
            _ => {
                debug!(engine = %engine.name(), status = ?status, "engine still starting");
                return;
            }
        };

        warn!(engine = %engine.name(), tier = %engine.tier(), reason, "engine provisioning failed");
        self.terminate_best_effort(engine.name()).await;
        let stopped = self
            .pool
            .update_if(engine.name(), EngineState::Starting, |e| e.on_stop())
            .await;
        if self.applied(&engine, "release", stopped) {
            report.failed += 1;
        }
    }

    async fn is_ready(&self, engine: &Engine) -> bool {
        let (Some(probe), Some(host)) = (&self.probe, engine.host()) else {
            return true;
        };
        match probe.check(host).await {
            ProbeResult::Ready => true,
            result => {
                debug!(engine = %engine.name(), %host, ?result, "engine running but not ready");
                false
            }
        }
    }

    async fn expire_idle(&self, now: u64, report: &mut CycleReport) {
        let snapshot = self.pool.snapshot().await;
        for engine in plan::expiry_candidates(&snapshot, now, &self.policy) {
            let expired = self
                .pool
                .update_if(engine.name(), EngineState::Idle, |e| e.on_expire(now))
                .await;
            if !self.applied(&engine, "expire", expired) {
                continue;
            }

            info!(
                engine = %engine.name(),
                tier = %engine.tier(),
                idle_secs = engine.idle_for(now).unwrap_or_default().as_secs(),
                "expiring idle engine"
            );
            report.expired += 1;
            if let Err(e) = self.provider_call("terminate", self.driver.terminate(engine.name())).await {
                // Re-issued while the engine is expiring.
                warn!(engine = %engine.name(), error = %e, "terminate failed");
                report.errors += 1;
            }
            self.fire_terminate_hook(engine.name());
        }
    }

    async fn reap_expiring(&self, now: u64, report: &mut CycleReport) {
        let snapshot = self.pool.snapshot().await;
        for check in plan::reap_checks(&snapshot, now, &self.policy) {
            self.reap(check, report).await;
        }
    }

    async fn reap(&self, check: ReapCheck, report: &mut CycleReport) {
        let ReapCheck {
            engine,
            grace_elapsed,
        } = check;

        let status = self.provider_call("status", self.driver.status(engine.name())).await;
        match &status {
            Ok(InstanceStatus::Terminated) => {}
            _ if grace_elapsed => {
                warn!(engine = %engine.name(), status = ?status.as_ref().ok(), "termination unconfirmed after grace period, releasing slot");
            }
            Ok(InstanceStatus::Running | InstanceStatus::Starting) => {
                debug!(engine = %engine.name(), "engine still running, re-issuing terminate");
                self.terminate_best_effort(engine.name()).await;
                return;
            }
            Ok(InstanceStatus::Unreachable) => {
                debug!(engine = %engine.name(), "waiting for termination");
                return;
            }
            Err(e) => {
                warn!(engine = %engine.name(), error = %e, "engine status check failed");
                report.errors += 1;
                return;
            }
        }

        let stopped = self
            .pool
            .update_if(engine.name(), EngineState::Expiring, |e| e.on_stop())
            .await;
        if self.applied(&engine, "stop", stopped) {
            info!(engine = %engine.name(), tier = %engine.tier(), "engine terminated");
            report.stopped += 1;
        }
    }

    async fn complete_scans(&self, now: u64, report: &mut CycleReport) {
        let snapshot = self.pool.snapshot().await;
        for check in plan::scan_checks(&snapshot, now, &self.policy) {
            self.check_scan(check, now, report).await;
        }
    }

    async fn check_scan(&self, check: ScanCheck, now: u64, report: &mut CycleReport) {
        let ScanCheck { engine, overrun } = check;

        if overrun {
            warn!(
                engine = %engine.name(),
                job = engine.job().unwrap_or("-"),
                timeout = ?self.policy.scan_timeout,
                "scan exceeded timeout, reclaiming engine"
            );
            let idle = self
                .pool
                .update_if(engine.name(), EngineState::Scanning, |e| e.on_idle(now))
                .await;
            if self.applied(&engine, "reclaim", idle) {
                report.abandoned += 1;
            }
            return;
        }

        let Some(job) = engine.job() else { return };
        let checked = tokio::time::timeout(self.queue_timeout, self.queue.is_complete(job))
            .await
            .unwrap_or(Err(QueueError::Timeout(self.queue_timeout)));
        let complete = match checked {
            Ok(complete) => complete,
            Err(e) => {
                warn!(engine = %engine.name(), %job, error = %e, "scan completion check failed");
                report.errors += 1;
                return;
            }
        };
        if !complete {
            return;
        }

        let idle = self
            .pool
            .update_if(engine.name(), EngineState::Scanning, |e| e.on_idle(now))
            .await;
        if self.applied(&engine, "go idle", idle) {
            info!(
                engine = %engine.name(),
                %job,
                scan_secs = engine.stats_at(now).scan_time.as_secs(),
                "scan complete"
            );
            report.completed += 1;
        }
    }

    // ── Internal helpers ───────────────────────────────────────────

    /// Bound a provider call by the provider timeout.
    async fn provider_call<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = DriverResult<T>>,
    ) -> DriverResult<T> {
        match tokio::time::timeout(self.provider_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                op,
                timeout: self.provider_timeout,
            }),
        }
    }

    async fn terminate_best_effort(&self, name: &str) {
        if let Err(e) = self.provider_call("terminate", self.driver.terminate(name)).await {
            warn!(engine = %name, error = %e, "best-effort terminate failed");
        }
    }

    /// Log the outcome of a conditional transition; true if it was applied.
    fn applied(&self, engine: &Engine, op: &str, result: PoolResult<Option<Engine>>) -> bool {
        match result {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(engine = %engine.name(), op, "engine changed since snapshot, skipping");
                false
            }
            Err(e) => {
                error!(engine = %engine.name(), op, error = %e, "engine transition failed");
                false
            }
        }
    }

    fn fire_launch_hook(&self, name: &str, host: &str) {
        let Some(hooks) = &self.hooks else { return };
        let hooks = Arc::clone(hooks);
        let (name, host) = (name.to_string(), host.to_string());
        tokio::spawn(async move {
            if let Err(e) = hooks.on_launch(&name, &host).await {
                warn!(engine = %name, error = %e, "launch hook failed");
            }
        });
    }

    fn fire_terminate_hook(&self, name: &str) {
        let Some(hooks) = &self.hooks else { return };
        let hooks = Arc::clone(hooks);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = hooks.on_terminate(&name).await {
                warn!(engine = %name, error = %e, "terminate hook failed");
            }
        });
    }
}

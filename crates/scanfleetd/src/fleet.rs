//! Assembling a fleet from configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::info;

use scanfleet_core::{FleetConfig, ScanRequest, SimulatorConfig};
use scanfleet_manager::{
    CloudDriver, FleetManager, FleetPolicy, LifecycleHook, ReadinessProbe, ScriptHook,
    SimulatedCloud,
};
use scanfleet_pool::{Engine, EnginePool, TierCounts};
use scanfleet_queue::{InMemoryQueue, JobQueue, QueueMonitor};

use crate::supervisor::ServiceSupervisor;

/// A fleet running against the in-process cloud and job queue.
pub struct SimulatedFleet {
    pub pool: Arc<EnginePool>,
    pub cloud: Arc<SimulatedCloud>,
    pub queue: Arc<InMemoryQueue>,
    pub supervisor: ServiceSupervisor,
}

/// Final state printed by `scanfleetd simulate`.
#[derive(Debug, Serialize)]
pub struct FleetReport {
    pub counts: BTreeMap<String, TierCounts>,
    pub engines: BTreeMap<String, Engine>,
    pub queue: QueueReport,
}

#[derive(Debug, Serialize)]
pub struct QueueReport {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
}

impl SimulatedFleet {
    pub fn from_config(config: &FleetConfig) -> anyhow::Result<Self> {
        let timings = config.timings()?;
        let simulator = config.simulator.clone().unwrap_or_default();

        let pool = Arc::new(EnginePool::from_config(config)?);
        let cloud = Arc::new(SimulatedCloud::new(simulator.launch_delay()?));
        let queue = Arc::new(InMemoryQueue::new().with_scan_duration(simulator.scan_duration()?));

        let driver: Arc<dyn CloudDriver> = cloud.clone();
        let client: Arc<dyn JobQueue> = queue.clone();

        let mut manager = FleetManager::new(
            Arc::clone(&pool),
            driver,
            Arc::clone(&client),
            FleetPolicy::from_timings(&timings),
        )
        .with_tags(config.tags.clone())
        .with_provider_timeout(timings.provider_timeout)
        .with_queue_timeout(timings.queue_fetch_timeout);
        if let Some(hooks) = &config.hooks {
            let hooks: Arc<dyn LifecycleHook> = Arc::new(ScriptHook::from_config(hooks)?);
            manager = manager.with_hooks(hooks);
        }
        if let Some(probe) = &config.probe {
            manager = manager.with_probe(ReadinessProbe::from_config(probe)?);
        }

        let monitor =
            QueueMonitor::new(Arc::clone(&pool), client).with_fetch_timeout(timings.queue_fetch_timeout);
        let supervisor = ServiceSupervisor::new(Arc::new(manager), Arc::new(monitor), &timings)
            .with_terminate_on_stop(config.fleet.terminate_on_stop);

        info!(
            tiers = config.pool.len(),
            launch_delay = %simulator.launch_delay,
            scan_duration = %simulator.scan_duration,
            "simulated fleet assembled"
        );

        Ok(Self {
            pool,
            cloud,
            queue,
            supervisor,
        })
    }

    /// Queue `count` synthetic scans, spread round-robin across the tiers.
    pub async fn seed_scans(&self, count: usize) {
        let entries = self.pool.entries();
        if entries.is_empty() {
            return;
        }
        for i in 0..count {
            let entry = &entries[i % entries.len()];
            let span = entry.max_metric.saturating_sub(entry.min_metric).saturating_add(1);
            let size = entry.min_metric + (i as u64).wrapping_mul(7_919) % span;
            let request = ScanRequest::new(format!("scan-{:04}", i + 1), size)
                .with_queue_position(u32::try_from(i + 1).unwrap_or(u32::MAX));
            self.queue.submit(request).await;
        }
    }

    pub async fn report(&self) -> FleetReport {
        FleetReport {
            counts: self.pool.state_counts().await,
            engines: self.pool.all_engines_by_name().await,
            queue: QueueReport {
                pending: self.queue.pending_len().await,
                running: self.queue.running().await.len(),
                completed: self.queue.completed_len().await,
            },
        }
    }
}

/// Load and validate a config file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<FleetConfig> {
    FleetConfig::from_file(path).with_context(|| format!("invalid config {}", path.display()))
}

/// Human-readable tier table for `check-config`.
pub fn describe(config: &FleetConfig) -> anyhow::Result<String> {
    let timings = config.timings()?;
    let simulator: SimulatorConfig = config.simulator.clone().unwrap_or_default();

    let mut out = format!(
        "{:<8} {:>12} {:>12} {:>6} {:>9}  {}\n",
        "TIER", "MIN", "MAX", "TOTAL", "MIN_IDLE", "INSTANCE"
    );
    for entry in &config.pool {
        out.push_str(&format!(
            "{:<8} {:>12} {:>12} {:>6} {:>9}  {}\n",
            entry.tier,
            entry.min_metric,
            entry.max_metric,
            entry.total,
            entry.min_idle,
            entry.instance_type.as_deref().unwrap_or("-")
        ));
    }
    out.push_str(&format!(
        "\nprefix={} queue={:?} reconcile={:?} launch_timeout={:?} idle_expiry={:?} terminate_grace={:?} terminate_on_stop={}\n",
        config.fleet.name_prefix,
        timings.queue_interval,
        timings.reconcile_interval,
        timings.launch_timeout,
        timings.idle_expiry,
        timings.terminate_grace,
        config.fleet.terminate_on_stop,
    ));
    out.push_str(&format!(
        "simulator: launch_delay={} scan_duration={}\n",
        simulator.launch_delay, simulator.scan_duration
    ));
    Ok(out)
}

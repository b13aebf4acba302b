//! Pure planning over a pool snapshot.
//!
//! Each selector picks the engines one reconciliation phase should act on.
//! Nothing here performs I/O, so each phase's policy is tested without a
//! driver or a queue.

use std::time::Duration;

use scanfleet_core::FleetTimings;
use scanfleet_pool::{Engine, EngineState, PoolSnapshot};

/// Timers that drive reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetPolicy {
    /// Longest a launch may take, from the launch call to readiness.
    pub launch_timeout: Duration,
    /// Idle time after which a surplus engine is expired.
    pub idle_expiry: Duration,
    /// Wait for the provider to confirm termination before freeing the slot.
    pub terminate_grace: Duration,
    /// Longest a scan may hold an engine.
    pub scan_timeout: Duration,
}

impl FleetPolicy {
    pub fn from_timings(timings: &FleetTimings) -> Self {
        Self {
            launch_timeout: timings.launch_timeout,
            idle_expiry: timings.idle_expiry,
            terminate_grace: timings.terminate_grace,
            scan_timeout: timings.scan_timeout,
        }
    }
}

impl Default for FleetPolicy {
    fn default() -> Self {
        Self {
            launch_timeout: Duration::from_secs(60),
            idle_expiry: Duration::from_secs(3600),
            terminate_grace: Duration::from_secs(120),
            scan_timeout: Duration::from_secs(4 * 3600),
        }
    }
}

/// A starting engine and whether its launch deadline has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupCheck {
    pub engine: Engine,
    pub overdue: bool,
}

/// An expiring engine and whether its termination grace has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapCheck {
    pub engine: Engine,
    pub grace_elapsed: bool,
}

/// A scanning engine and whether it has exceeded the scan timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCheck {
    pub engine: Engine,
    pub overrun: bool,
}

/// Engines claimed for provisioning that still need a launch call.
pub fn pending_launches(snapshot: &PoolSnapshot) -> Vec<Engine> {
    snapshot.in_state(EngineState::Pending).cloned().collect()
}

pub fn startup_checks(snapshot: &PoolSnapshot, now: u64, policy: &FleetPolicy) -> Vec<StartupCheck> {
    snapshot
        .in_state(EngineState::Starting)
        .map(|engine| StartupCheck {
            overdue: elapsed_since(engine.started_at(), now) >= policy.launch_timeout,
            engine: engine.clone(),
        })
        .collect()
}

/// Idle engines past `idle_expiry`, oldest first, limited per tier to the
/// surplus above `min_idle`.
pub fn expiry_candidates(snapshot: &PoolSnapshot, now: u64, policy: &FleetPolicy) -> Vec<Engine> {
    let mut expired = Vec::new();

    for entry in snapshot.entries() {
        let mut idle: Vec<&Engine> = snapshot
            .in_tier_state(&entry.tier, EngineState::Idle)
            .collect();
        let surplus = idle.len().saturating_sub(entry.min_idle as usize);
        if surplus == 0 {
            continue;
        }

        idle.sort_by_key(|e| e.idle_since().unwrap_or(0));
        expired.extend(
            idle.into_iter()
                .filter(|e| e.idle_for(now).is_some_and(|d| d >= policy.idle_expiry))
                .take(surplus)
                .cloned(),
        );
    }

    expired
}

pub fn reap_checks(snapshot: &PoolSnapshot, now: u64, policy: &FleetPolicy) -> Vec<ReapCheck> {
    snapshot
        .in_state(EngineState::Expiring)
        .map(|engine| ReapCheck {
            grace_elapsed: elapsed_since(engine.expiring_since(), now) >= policy.terminate_grace,
            engine: engine.clone(),
        })
        .collect()
}

/// Scanning engines to poll for completion or reclaim.
///
/// An engine without a recorded job is only returned once it overruns;
/// until then the queue monitor may still be dispatching to it.
pub fn scan_checks(snapshot: &PoolSnapshot, now: u64, policy: &FleetPolicy) -> Vec<ScanCheck> {
    snapshot
        .in_state(EngineState::Scanning)
        .map(|engine| ScanCheck {
            overrun: elapsed_since(engine.scan_started_at(), now) >= policy.scan_timeout,
            engine: engine.clone(),
        })
        .filter(|check| check.overrun || check.engine.job().is_some())
        .collect()
}

fn elapsed_since(at: Option<u64>, now: u64) -> Duration {
    at.map_or(Duration::ZERO, |at| Duration::from_millis(now.saturating_sub(at)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanfleet_core::PoolEntry;
    use scanfleet_pool::EnginePool;

    const MINUTE: u64 = 60_000;

    fn policy() -> FleetPolicy {
        FleetPolicy {
            launch_timeout: Duration::from_secs(60),
            idle_expiry: Duration::from_secs(600),
            terminate_grace: Duration::from_secs(120),
            scan_timeout: Duration::from_secs(3600),
        }
    }

    /// A pool with one tier where each engine is started at 0 and goes
    /// idle at the given time.
    async fn pool_with_idle(min_idle: u32, idle_at: &[u64]) -> EnginePool {
        let total = idle_at.len() as u32 + 1;
        let pool = EnginePool::new("engine", vec![PoolEntry::new("S", 0, 10, total, min_idle)]).unwrap();
        for (i, at) in idle_at.iter().enumerate() {
            let name = format!("engine-s-{:02}", i + 1);
            pool.update(&name, |e| {
                e.on_start(0, "h:1")?;
                e.on_idle(*at)
            })
            .await
            .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn expires_only_surplus_oldest_first() {
        // Idle since minute 5, 1 and 3; all past expiry at minute 20.
        let pool = pool_with_idle(1, &[5 * MINUTE, MINUTE, 3 * MINUTE]).await;
        let snapshot = pool.snapshot().await;

        let expired = expiry_candidates(&snapshot, 20 * MINUTE, &policy());
        let names: Vec<&str> = expired.iter().map(Engine::name).collect();
        assert_eq!(names, vec!["engine-s-02", "engine-s-03"]);
    }

    #[tokio::test]
    async fn recently_idle_engines_are_kept() {
        let pool = pool_with_idle(0, &[0, 9 * MINUTE]).await;
        let snapshot = pool.snapshot().await;

        let expired = expiry_candidates(&snapshot, 12 * MINUTE, &policy());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].name(), "engine-s-01");
    }

    #[tokio::test]
    async fn nothing_expires_at_min_idle() {
        let pool = pool_with_idle(2, &[0, 0]).await;
        let snapshot = pool.snapshot().await;
        assert!(expiry_candidates(&snapshot, 100 * MINUTE, &policy()).is_empty());
    }

    #[tokio::test]
    async fn startup_deadline() {
        let pool = EnginePool::new("engine", vec![PoolEntry::new("S", 0, 10, 2, 0)]).unwrap();
        pool.update("engine-s-01", |e| e.on_start(1_000, "h:1")).await.unwrap();
        pool.update("engine-s-02", |e| e.on_claim()).await.unwrap();
        let snapshot = pool.snapshot().await;

        let checks = startup_checks(&snapshot, 1_000 + 59_999, &policy());
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].overdue);

        let checks = startup_checks(&snapshot, 1_000 + 60_000, &policy());
        assert!(checks[0].overdue);

        let pending = pending_launches(&snapshot);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name(), "engine-s-02");
    }

    #[tokio::test]
    async fn reap_grace() {
        let pool = pool_with_idle(0, &[0]).await;
        pool.update("engine-s-01", |e| e.on_expire(10_000)).await.unwrap();
        let snapshot = pool.snapshot().await;

        assert!(!reap_checks(&snapshot, 10_000 + 119_999, &policy())[0].grace_elapsed);
        assert!(reap_checks(&snapshot, 10_000 + 120_000, &policy())[0].grace_elapsed);
    }

    #[tokio::test]
    async fn only_scans_with_jobs_are_polled() {
        let pool = pool_with_idle(0, &[0, 0]).await;
        pool.update("engine-s-01", |e| {
            e.on_scan(1)?;
            e.assign_job("scan-1")
        })
        .await
        .unwrap();
        pool.update("engine-s-02", |e| e.on_scan(1)).await.unwrap();
        let snapshot = pool.snapshot().await;

        let scans = scan_checks(&snapshot, 2, &policy());
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].engine.job(), Some("scan-1"));
        assert!(!scans[0].overrun);
    }

    #[tokio::test]
    async fn overrun_scans_are_flagged_with_or_without_a_job() {
        let pool = pool_with_idle(0, &[0, 0]).await;
        pool.update("engine-s-01", |e| {
            e.on_scan(1_000)?;
            e.assign_job("scan-1")
        })
        .await
        .unwrap();
        pool.update("engine-s-02", |e| e.on_scan(1_000)).await.unwrap();
        let snapshot = pool.snapshot().await;

        let scans = scan_checks(&snapshot, 1_000 + 3_599_999, &policy());
        assert_eq!(scans.len(), 1);

        let scans = scan_checks(&snapshot, 1_000 + 3_600_000, &policy());
        assert_eq!(scans.len(), 2);
        assert!(scans.iter().all(|c| c.overrun));
    }
}

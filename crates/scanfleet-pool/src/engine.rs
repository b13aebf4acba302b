//! Engine — one logical worker slot and its lifecycle state machine.
//!
//! Every transition takes the observation time `at` (Unix epoch ms) so the
//! timers stay deterministic under test. Illegal transitions return
//! [`PoolError::IllegalState`] and leave the engine untouched.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use scanfleet_core::epoch_millis;

use crate::error::{PoolError, PoolResult};

/// Lifecycle state of an engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// No cloud resource; the slot is free.
    Unprovisioned,
    /// Slot claimed for provisioning; launch not yet issued.
    Pending,
    /// Launched, waiting to become reachable.
    Starting,
    /// Warm and ready for a scan.
    Idle,
    /// Running a scan.
    Scanning,
    /// Being decommissioned.
    Expiring,
}

impl EngineState {
    pub const ALL: [EngineState; 6] = [
        EngineState::Unprovisioned,
        EngineState::Pending,
        EngineState::Starting,
        EngineState::Idle,
        EngineState::Scanning,
        EngineState::Expiring,
    ];

    /// Whether a cloud resource exists, and so a host is bound, in this state.
    pub fn has_host(self) -> bool {
        matches!(
            self,
            EngineState::Starting | EngineState::Idle | EngineState::Scanning | EngineState::Expiring
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Unprovisioned => "unprovisioned",
            EngineState::Pending => "pending",
            EngineState::Starting => "starting",
            EngineState::Idle => "idle",
            EngineState::Scanning => "scanning",
            EngineState::Expiring => "expiring",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation attempted on an engine, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOp {
    Claim,
    Start,
    Idle,
    Scan,
    AssignJob,
    Expire,
    Stop,
}

impl fmt::Display for EngineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineOp::Claim => "claim",
            EngineOp::Start => "start",
            EngineOp::Idle => "go idle",
            EngineOp::Scan => "scan",
            EngineOp::AssignJob => "assign job",
            EngineOp::Expire => "expire",
            EngineOp::Stop => "stop",
        })
    }
}

/// Point-in-time timing statistics for an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    /// Time since the engine was started; zero if not running.
    pub run_time: Duration,
    /// Time since the current scan started; zero unless scanning.
    pub scan_time: Duration,
}

/// A single engine slot.
///
/// `PartialEq` compares every field. Use [`Engine::is_same_engine`] to
/// compare identity (name) only, e.g. to spot an externally replaced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Engine {
    name: String,
    tier: String,
    state: EngineState,
    host: Option<String>,
    started_at: Option<u64>,
    idle_since: Option<u64>,
    scan_started_at: Option<u64>,
    expiring_since: Option<u64>,
    job: Option<String>,
}

impl Engine {
    /// Create an unprovisioned engine slot.
    pub fn new(name: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: tier.into(),
            state: EngineState::Unprovisioned,
            host: None,
            started_at: None,
            idle_since: None,
            scan_started_at: None,
            expiring_since: None,
            job: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Network address of the provisioned worker.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn started_at(&self) -> Option<u64> {
        self.started_at
    }

    pub fn idle_since(&self) -> Option<u64> {
        self.idle_since
    }

    pub fn scan_started_at(&self) -> Option<u64> {
        self.scan_started_at
    }

    pub fn expiring_since(&self) -> Option<u64> {
        self.expiring_since
    }

    /// Id of the scan this engine is running.
    pub fn job(&self) -> Option<&str> {
        self.job.as_deref()
    }

    /// Whether `other` is a record of the same slot, regardless of state.
    pub fn is_same_engine(&self, other: &Engine) -> bool {
        self.name == other.name
    }

    fn require(&self, op: EngineOp, allowed: &[EngineState]) -> PoolResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PoolError::IllegalState {
                engine: self.name.clone(),
                state: self.state,
                op,
            })
        }
    }

    /// Claim a free slot for provisioning.
    pub fn on_claim(&mut self) -> PoolResult<()> {
        self.require(EngineOp::Claim, &[EngineState::Unprovisioned])?;
        self.state = EngineState::Pending;
        Ok(())
    }

    /// The cloud resource was launched and is reachable at `host`.
    ///
    /// Resets all timers; an expiring engine can be restarted in place.
    pub fn on_start(&mut self, at: u64, host: impl Into<String>) -> PoolResult<()> {
        self.require(
            EngineOp::Start,
            &[EngineState::Unprovisioned, EngineState::Pending, EngineState::Expiring],
        )?;
        self.state = EngineState::Starting;
        self.host = Some(host.into());
        self.started_at = Some(at);
        self.idle_since = None;
        self.scan_started_at = None;
        self.expiring_since = None;
        self.job = None;
        Ok(())
    }

    pub fn on_idle(&mut self, at: u64) -> PoolResult<()> {
        self.require(EngineOp::Idle, &[EngineState::Starting, EngineState::Scanning])?;
        self.state = EngineState::Idle;
        self.idle_since = Some(at);
        self.scan_started_at = None;
        self.job = None;
        Ok(())
    }

    pub fn on_scan(&mut self, at: u64) -> PoolResult<()> {
        self.require(EngineOp::Scan, &[EngineState::Idle])?;
        self.state = EngineState::Scanning;
        self.scan_started_at = Some(at);
        self.idle_since = None;
        Ok(())
    }

    /// Record which scan a scanning engine is running.
    pub fn assign_job(&mut self, job_id: impl Into<String>) -> PoolResult<()> {
        self.require(EngineOp::AssignJob, &[EngineState::Scanning])?;
        self.job = Some(job_id.into());
        Ok(())
    }

    pub fn on_expire(&mut self, at: u64) -> PoolResult<()> {
        self.require(EngineOp::Expire, &[EngineState::Idle])?;
        self.state = EngineState::Expiring;
        self.expiring_since = Some(at);
        self.idle_since = None;
        Ok(())
    }

    /// Release the slot: the cloud resource is gone (or never came up).
    pub fn on_stop(&mut self) -> PoolResult<()> {
        self.require(
            EngineOp::Stop,
            &[
                EngineState::Pending,
                EngineState::Starting,
                EngineState::Idle,
                EngineState::Scanning,
                EngineState::Expiring,
            ],
        )?;
        *self = Engine::new(std::mem::take(&mut self.name), std::mem::take(&mut self.tier));
        Ok(())
    }

    /// Timing statistics as of now.
    pub fn stats(&self) -> EngineStats {
        self.stats_at(epoch_millis())
    }

    /// Timing statistics as of `now`.
    ///
    /// `scan_time` never exceeds `run_time`.
    pub fn stats_at(&self, now: u64) -> EngineStats {
        let run_time = match (self.state.has_host(), self.started_at) {
            (true, Some(started)) => Duration::from_millis(now.saturating_sub(started)),
            _ => Duration::ZERO,
        };
        let scan_time = match (self.state, self.scan_started_at) {
            (EngineState::Scanning, Some(started)) => {
                Duration::from_millis(now.saturating_sub(started))
            }
            _ => Duration::ZERO,
        };
        EngineStats {
            run_time,
            scan_time: scan_time.min(run_time),
        }
    }

    /// How long the engine has been idle as of `now`; `None` unless idle.
    pub fn idle_for(&self, now: u64) -> Option<Duration> {
        match (self.state, self.idle_since) {
            (EngineState::Idle, Some(since)) => Some(Duration::from_millis(now.saturating_sub(since))),
            _ => None,
        }
    }
}

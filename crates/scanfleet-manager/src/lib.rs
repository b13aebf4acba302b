//! scanfleet-manager — converging the provisioned fleet toward policy.
//!
//! The `FleetManager` owns every call to the cloud provider. Each cycle it
//! launches engines the pool has marked pending, promotes started engines
//! once they are reachable, expires engines that sat idle too long, and
//! frees engines whose scans have finished.
//!
//! # Cycle
//!
//! ```text
//!            ┌─────────────────────── FleetManager::run_cycle ───────────────────────┐
//!            │                                                                        │
//! snapshot ──► plan (pure) ──► CloudDriver / JobQueue calls ──► pool.update_if(...)   │
//!            │                                                                        │
//!            │  1. launch      PENDING  ──launch──►  STARTING                         │
//!            │  2. readiness   STARTING ──status──►  IDLE | UNPROVISIONED             │
//!            │  3. expiry      IDLE ──terminate──► EXPIRING ──status──► UNPROVISIONED │
//!            │  4. completion  SCANNING ──is_complete──► IDLE                         │
//!            └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pool locks are never held across a provider call; each transition is
//! applied only if the engine is still in the state the plan saw.

pub mod driver;
pub mod error;
pub mod hooks;
pub mod manager;
pub mod plan;
pub mod probe;
pub mod simulated;

pub use driver::{CloudDriver, InstanceStatus, LaunchSpec, ProvisionedInstance};
pub use error::{DriverError, DriverResult, FleetError, FleetResult};
pub use hooks::{LifecycleHook, ScriptHook};
pub use manager::{CycleReport, FleetManager};
pub use plan::FleetPolicy;
pub use probe::{ProbeResult, ReadinessProbe};
pub use simulated::SimulatedCloud;

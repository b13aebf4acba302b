//! scanfleet-core — shared types for the scan engine fleet.
//!
//! Everything here is plain data plus pure functions; no task spawns,
//! no locks, no I/O beyond reading the config file.
//!
//! - [`SizeTier`] / [`SizeClassifier`] map a scan's size metric onto a
//!   capacity tier.
//! - [`ScanRequest`] and [`sort_queue`] define the dispatch priority of
//!   queued scans.
//! - [`FleetConfig`] is the `fleet.toml` schema with validation.

pub mod config;
pub mod error;
pub mod job;
pub mod tier;
pub mod time;

pub use config::{
    FleetConfig, FleetSettings, FleetTimings, HooksConfig, PoolEntry, ProbeConfig,
    SimulatorConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use job::{ScanRequest, dispatch_order, sort_queue};
pub use tier::{SizeClassifier, SizeTier};
pub use time::{epoch_millis, parse_duration};

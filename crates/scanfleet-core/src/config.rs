//! fleet.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::tier::{SizeClassifier, SizeTier};
use crate::time::parse_duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub fleet: FleetSettings,
    pub hooks: Option<HooksConfig>,
    pub probe: Option<ProbeConfig>,
    /// Tags passed to the cloud driver on every launch.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub simulator: Option<SimulatorConfig>,
    #[serde(default)]
    pub pool: Vec<PoolEntry>,
}

/// Loop cadences and timeouts, as duration strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Prefix for engine slot names (`{prefix}-{tier}-{NN}`).
    pub name_prefix: String,
    pub queue_interval: String,
    pub reconcile_interval: String,
    /// Time allowed from launch until the engine is reachable.
    pub launch_timeout: String,
    /// Idle time after which a surplus engine is decommissioned.
    pub idle_expiry: String,
    /// Time allowed for the provider to confirm termination.
    pub terminate_grace: String,
    /// Longest a scan may hold an engine before the engine is reclaimed.
    pub scan_timeout: String,
    pub queue_fetch_timeout: String,
    /// Bound on terminate/status/list calls to the cloud driver.
    pub provider_timeout: String,
    pub shutdown_timeout: String,
    /// Terminate every provisioned engine when the service stops.
    pub terminate_on_stop: bool,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            name_prefix: "engine".to_string(),
            queue_interval: "20s".to_string(),
            reconcile_interval: "10s".to_string(),
            launch_timeout: "60s".to_string(),
            idle_expiry: "1h".to_string(),
            terminate_grace: "2m".to_string(),
            scan_timeout: "4h".to_string(),
            queue_fetch_timeout: "30s".to_string(),
            provider_timeout: "30s".to_string(),
            shutdown_timeout: "10s".to_string(),
            terminate_on_stop: false,
        }
    }
}

/// Parsed form of [`FleetSettings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetTimings {
    pub queue_interval: Duration,
    pub reconcile_interval: Duration,
    pub launch_timeout: Duration,
    pub idle_expiry: Duration,
    pub terminate_grace: Duration,
    pub scan_timeout: Duration,
    pub queue_fetch_timeout: Duration,
    pub provider_timeout: Duration,
    pub shutdown_timeout: Duration,
}

/// One tier of the engine pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub tier: String,
    pub min_metric: u64,
    pub max_metric: u64,
    /// Number of engine slots; the hard ceiling for this tier.
    pub total: u32,
    /// Warm engines to keep ready.
    #[serde(default)]
    pub min_idle: u32,
    /// Provider instance type for this tier.
    pub instance_type: Option<String>,
}

impl PoolEntry {
    pub fn new(tier: &str, min_metric: u64, max_metric: u64, total: u32, min_idle: u32) -> Self {
        Self {
            tier: tier.to_string(),
            min_metric,
            max_metric,
            total,
            min_idle,
            instance_type: None,
        }
    }

    pub fn size_tier(&self) -> SizeTier {
        SizeTier::new(self.tier.clone(), self.min_metric, self.max_metric)
    }

    /// Check the slot counts; range checks live in [`SizeClassifier::new`].
    pub fn validate(&self) -> ConfigResult<()> {
        if self.total == 0 {
            return Err(ConfigError::EmptyTier(self.tier.clone()));
        }
        if self.min_idle > self.total {
            return Err(ConfigError::MinIdleExceedsTotal {
                tier: self.tier.clone(),
                min_idle: self.min_idle,
                total: self.total,
            });
        }
        Ok(())
    }
}

/// Executables run when an engine comes up or goes away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    pub on_launch: Option<PathBuf>,
    pub on_terminate: Option<PathBuf>,
    #[serde(default = "default_hook_timeout")]
    pub timeout: String,
}

impl HooksConfig {
    pub fn timeout(&self) -> ConfigResult<Duration> {
        duration_field("hooks.timeout", &self.timeout)
    }
}

/// HTTP readiness check run against a freshly started engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub path: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout: String,
}

impl ProbeConfig {
    pub fn timeout(&self) -> ConfigResult<Duration> {
        duration_field("probe.timeout", &self.timeout)
    }
}

/// Behaviour of the in-process cloud and queue used by `scanfleetd simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub launch_delay: String,
    pub scan_duration: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            launch_delay: "2s".to_string(),
            scan_duration: "10s".to_string(),
        }
    }
}

impl SimulatorConfig {
    pub fn launch_delay(&self) -> ConfigResult<Duration> {
        duration_field("simulator.launch_delay", &self.launch_delay)
    }

    pub fn scan_duration(&self) -> ConfigResult<Duration> {
        duration_field("simulator.scan_duration", &self.scan_duration)
    }
}

fn default_hook_timeout() -> String {
    "30s".to_string()
}

fn default_probe_timeout() -> String {
    "2s".to_string()
}

impl FleetConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config from TOML text.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the pool specification and every duration string.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.fleet.name_prefix.trim().is_empty() {
            return Err(ConfigError::EmptyPrefix);
        }

        self.classifier()?;

        for entry in &self.pool {
            entry.validate()?;
        }

        let timings = self.timings()?;
        if timings.queue_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("fleet.queue_interval"));
        }
        if timings.reconcile_interval.is_zero() {
            return Err(ConfigError::ZeroInterval("fleet.reconcile_interval"));
        }
        if let Some(hooks) = &self.hooks {
            hooks.timeout()?;
        }
        if let Some(probe) = &self.probe {
            probe.timeout()?;
        }
        if let Some(sim) = &self.simulator {
            sim.launch_delay()?;
            sim.scan_duration()?;
        }

        Ok(())
    }

    /// Build the size classifier from the pool's tier ranges.
    pub fn classifier(&self) -> ConfigResult<SizeClassifier> {
        SizeClassifier::new(self.pool.iter().map(PoolEntry::size_tier).collect())
    }

    /// Resolve all `[fleet]` duration strings.
    pub fn timings(&self) -> ConfigResult<FleetTimings> {
        let f = &self.fleet;
        Ok(FleetTimings {
            queue_interval: duration_field("fleet.queue_interval", &f.queue_interval)?,
            reconcile_interval: duration_field("fleet.reconcile_interval", &f.reconcile_interval)?,
            launch_timeout: duration_field("fleet.launch_timeout", &f.launch_timeout)?,
            idle_expiry: duration_field("fleet.idle_expiry", &f.idle_expiry)?,
            terminate_grace: duration_field("fleet.terminate_grace", &f.terminate_grace)?,
            scan_timeout: duration_field("fleet.scan_timeout", &f.scan_timeout)?,
            queue_fetch_timeout: duration_field("fleet.queue_fetch_timeout", &f.queue_fetch_timeout)?,
            provider_timeout: duration_field("fleet.provider_timeout", &f.provider_timeout)?,
            shutdown_timeout: duration_field("fleet.shutdown_timeout", &f.shutdown_timeout)?,
        })
    }
}

fn duration_field(field: &'static str, value: &str) -> ConfigResult<Duration> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

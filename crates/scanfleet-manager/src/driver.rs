//! The cloud provider port.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DriverResult;

/// Provider-side state of an engine's instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Unreachable,
    Terminated,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Unreachable => "unreachable",
            InstanceStatus::Terminated => "terminated",
        })
    }
}

/// Everything a driver needs to launch one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub name: String,
    pub tier: String,
    pub instance_type: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// An instance the provider knows about, used to rebuild the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedInstance {
    pub name: String,
    pub host: String,
    pub status: InstanceStatus,
}

/// Launches and tears down engine instances.
///
/// Instances are addressed by engine name. Implementations must make
/// `terminate` idempotent.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Launch an instance and return its host address.
    async fn launch(&self, spec: &LaunchSpec) -> DriverResult<String>;

    async fn terminate(&self, name: &str) -> DriverResult<()>;

    async fn status(&self, name: &str) -> DriverResult<InstanceStatus>;

    /// Every instance the provider currently holds for this fleet.
    async fn list(&self) -> DriverResult<Vec<ProvisionedInstance>>;
}

//! Simulated cloud provider for tests and `scanfleetd simulate`.
//!
//! Instances become `Running` once `launch_delay` has passed since launch.
//! Failure toggles let tests drive the manager's recovery paths.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::driver::{CloudDriver, InstanceStatus, LaunchSpec, ProvisionedInstance};
use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone)]
struct SimInstance {
    host: String,
    launched_at: Instant,
    terminated: bool,
    unreachable: bool,
}

#[derive(Debug, Default)]
struct SimState {
    instances: HashMap<String, SimInstance>,
    next_address: u32,
    launches: usize,
    calls: usize,
    fail_launches: bool,
    fail_terminates: bool,
}

#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<SimState>,
    /// Time from launch until the instance reports `Running`.
    launch_delay: Duration,
    /// Time the `launch` call itself takes.
    launch_latency: Duration,
}

impl SimulatedCloud {
    pub fn new(launch_delay: Duration) -> Self {
        Self {
            launch_delay,
            ..Self::default()
        }
    }

    pub fn with_launch_latency(mut self, latency: Duration) -> Self {
        self.launch_latency = latency;
        self
    }

    pub async fn set_fail_launches(&self, fail: bool) {
        self.state.lock().await.fail_launches = fail;
    }

    pub async fn set_fail_terminates(&self, fail: bool) {
        self.state.lock().await.fail_terminates = fail;
    }

    /// Make a live instance report `Unreachable`.
    pub async fn set_unreachable(&self, name: &str) {
        if let Some(instance) = self.state.lock().await.instances.get_mut(name) {
            instance.unreachable = true;
        }
    }

    /// Register an instance that already exists, as found at startup.
    pub async fn insert_running(&self, name: &str, host: &str) {
        self.state.lock().await.instances.insert(
            name.to_string(),
            SimInstance {
                host: host.to_string(),
                launched_at: Instant::now()
                    .checked_sub(self.launch_delay)
                    .unwrap_or_else(Instant::now),
                terminated: false,
                unreachable: false,
            },
        );
    }

    /// Number of successful launches.
    pub async fn launches(&self) -> usize {
        self.state.lock().await.launches
    }

    /// Number of driver calls of any kind.
    pub async fn calls(&self) -> usize {
        self.state.lock().await.calls
    }

    pub async fn is_terminated(&self, name: &str) -> bool {
        self.state
            .lock()
            .await
            .instances
            .get(name)
            .is_some_and(|i| i.terminated)
    }

    fn status_of(&self, instance: &SimInstance) -> InstanceStatus {
        if instance.terminated {
            InstanceStatus::Terminated
        } else if instance.unreachable {
            InstanceStatus::Unreachable
        } else if instance.launched_at.elapsed() < self.launch_delay {
            InstanceStatus::Starting
        } else {
            InstanceStatus::Running
        }
    }
}

#[async_trait]
impl CloudDriver for SimulatedCloud {
    async fn launch(&self, spec: &LaunchSpec) -> DriverResult<String> {
        if !self.launch_latency.is_zero() {
            tokio::time::sleep(self.launch_latency).await;
        }

        let mut state = self.state.lock().await;
        state.calls += 1;
        if state.fail_launches {
            return Err(DriverError::Launch {
                engine: spec.name.clone(),
                reason: "simulated capacity error".to_string(),
            });
        }

        state.next_address += 1;
        let n = state.next_address;
        let host = format!("10.0.{}.{}:8080", n / 250, n % 250 + 1);
        state.instances.insert(
            spec.name.clone(),
            SimInstance {
                host: host.clone(),
                launched_at: Instant::now(),
                terminated: false,
                unreachable: false,
            },
        );
        state.launches += 1;

        debug!(engine = %spec.name, tier = %spec.tier, %host, "simulated instance launched");
        Ok(host)
    }

    async fn terminate(&self, name: &str) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        if state.fail_terminates {
            return Err(DriverError::Terminate {
                engine: name.to_string(),
                reason: "simulated provider error".to_string(),
            });
        }
        if let Some(instance) = state.instances.get_mut(name) {
            instance.terminated = true;
        }
        Ok(())
    }

    async fn status(&self, name: &str) -> DriverResult<InstanceStatus> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        // Unknown to the provider means gone.
        Ok(state
            .instances
            .get(name)
            .map_or(InstanceStatus::Terminated, |i| self.status_of(i)))
    }

    async fn list(&self) -> DriverResult<Vec<ProvisionedInstance>> {
        let mut state = self.state.lock().await;
        state.calls += 1;
        let mut instances: Vec<ProvisionedInstance> = state
            .instances
            .iter()
            .filter(|(_, i)| !i.terminated)
            .map(|(name, i)| ProvisionedInstance {
                name: name.clone(),
                host: i.host.clone(),
                status: self.status_of(i),
            })
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            tier: "S".to_string(),
            instance_type: None,
            tags: Default::default(),
        }
    }

    #[tokio::test]
    async fn launch_then_terminate() {
        let cloud = SimulatedCloud::new(Duration::ZERO);
        let host = cloud.launch(&spec("engine-s-01")).await.unwrap();
        assert_eq!(host, "10.0.0.2:8080");
        assert_eq!(cloud.status("engine-s-01").await.unwrap(), InstanceStatus::Running);

        cloud.terminate("engine-s-01").await.unwrap();
        assert_eq!(cloud.status("engine-s-01").await.unwrap(), InstanceStatus::Terminated);
        assert!(cloud.is_terminated("engine-s-01").await);
        assert!(cloud.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn instance_starts_until_delay_passes() {
        let cloud = SimulatedCloud::new(Duration::from_secs(600));
        cloud.launch(&spec("engine-s-01")).await.unwrap();
        assert_eq!(cloud.status("engine-s-01").await.unwrap(), InstanceStatus::Starting);
    }

    #[tokio::test]
    async fn unknown_instance_is_terminated() {
        let cloud = SimulatedCloud::new(Duration::ZERO);
        assert_eq!(cloud.status("nope").await.unwrap(), InstanceStatus::Terminated);
        cloud.terminate("nope").await.unwrap();
    }

    #[tokio::test]
    async fn failure_toggles() {
        let cloud = SimulatedCloud::new(Duration::ZERO);
        cloud.set_fail_launches(true).await;
        assert!(matches!(
            cloud.launch(&spec("engine-s-01")).await,
            Err(DriverError::Launch { .. })
        ));
        assert_eq!(cloud.launches().await, 0);

        cloud.insert_running("engine-s-02", "10.9.9.9:8080").await;
        cloud.set_unreachable("engine-s-02").await;
        let listed = cloud.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, InstanceStatus::Unreachable);

        cloud.set_fail_terminates(true).await;
        assert!(cloud.terminate("engine-s-02").await.is_err());
    }
}

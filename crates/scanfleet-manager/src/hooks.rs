//! Lifecycle hooks fired when engines come up or go away.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use scanfleet_core::{ConfigResult, HooksConfig};

/// Notified after an engine becomes ready and after it is terminated.
///
/// Hooks run on their own task; a failing hook is logged and otherwise
/// ignored.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn on_launch(&self, name: &str, host: &str) -> anyhow::Result<()>;

    async fn on_terminate(&self, name: &str) -> anyhow::Result<()>;
}

/// Runs external executables: `on_launch <name> <host>` and
/// `on_terminate <name>`.
#[derive(Debug, Clone)]
pub struct ScriptHook {
    on_launch: Option<PathBuf>,
    on_terminate: Option<PathBuf>,
    timeout: Duration,
}

impl ScriptHook {
    pub fn new(on_launch: Option<PathBuf>, on_terminate: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            on_launch,
            on_terminate,
            timeout,
        }
    }

    pub fn from_config(config: &HooksConfig) -> ConfigResult<Self> {
        Ok(Self::new(
            config.on_launch.clone(),
            config.on_terminate.clone(),
            config.timeout()?,
        ))
    }

    async fn exec(&self, script: &Path, args: &[&str]) -> anyhow::Result<()> {
        let output = Command::new(script)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, output)
            .await
            .with_context(|| format!("hook {} timed out after {:?}", script.display(), self.timeout))?
            .with_context(|| format!("failed to run hook {}", script.display()))?;

        if !output.status.success() {
            bail!(
                "hook {} exited with {}: {}",
                script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(hook = %script.display(), ?args, "hook completed");
        Ok(())
    }
}

#[async_trait]
impl LifecycleHook for ScriptHook {
    async fn on_launch(&self, name: &str, host: &str) -> anyhow::Result<()> {
        match &self.on_launch {
            Some(script) => self.exec(script, &[name, host]).await,
            None => Ok(()),
        }
    }

    async fn on_terminate(&self, name: &str) -> anyhow::Result<()> {
        match &self.on_terminate {
            Some(script) => self.exec(script, &[name]).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_script() {
        let hook = ScriptHook::new(Some("true".into()), Some("true".into()), Duration::from_secs(5));
        hook.on_launch("engine-s-01", "10.0.0.1:8080").await.unwrap();
        hook.on_terminate("engine-s-01").await.unwrap();
    }

    #[tokio::test]
    async fn failing_script_is_an_error() {
        let hook = ScriptHook::new(Some("false".into()), None, Duration::from_secs(5));
        let err = hook.on_launch("engine-s-01", "h:1").await.unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[tokio::test]
    async fn missing_script_is_an_error() {
        let hook = ScriptHook::new(
            None,
            Some("/nonexistent/scanfleet-hook".into()),
            Duration::from_secs(5),
        );
        assert!(hook.on_terminate("engine-s-01").await.is_err());
    }

    #[tokio::test]
    async fn unset_hooks_do_nothing() {
        let hook = ScriptHook::new(None, None, Duration::from_secs(5));
        hook.on_launch("engine-s-01", "h:1").await.unwrap();
        hook.on_terminate("engine-s-01").await.unwrap();
    }

    #[test]
    fn from_config_parses_timeout() {
        let config = HooksConfig {
            on_launch: Some("/opt/on-launch.sh".into()),
            on_terminate: None,
            timeout: "45s".to_string(),
        };
        let hook = ScriptHook::from_config(&config).unwrap();
        assert_eq!(hook.timeout, Duration::from_secs(45));
    }
}

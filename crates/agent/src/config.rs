//! Agent configuration

use agent_lib::ErrorPolicy;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent configuration, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node to watch, usually injected through the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Wait between passes in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Abort a pass on any workload error instead of skipping the workload
    #[serde(default)]
    pub fail_fast: bool,

    /// Detect and report stuck workloads without restarting them
    #[serde(default)]
    pub dry_run: bool,

    /// Age in seconds after which a restart marker is stale; unset never expires
    #[serde(default)]
    pub restart_marker_ttl_secs: Option<u64>,

    /// Seconds without a completed pass before liveness fails
    #[serde(default = "default_stall_after")]
    pub stall_after_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("KUBERNETES_NODE_NAME")
        .or_else(|_| std::env::var("NODE_NAME"))
        .unwrap_or_default()
}

fn default_api_port() -> u16 {
    8080
}

fn default_interval() -> u64 {
    30
}

fn default_stall_after() -> u64 {
    300
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            interval_secs: default_interval(),
            fail_fast: false,
            dry_run: false,
            restart_marker_ttl_secs: None,
            stall_after_secs: default_stall_after(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()
            .context("Failed to read agent configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings under which a healthy loop would fail liveness
    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("AGENT_INTERVAL_SECS must be greater than zero");
        }
        if self.stall_after_secs <= self.interval_secs {
            bail!(
                "AGENT_STALL_AFTER_SECS ({}) must exceed AGENT_INTERVAL_SECS ({})",
                self.stall_after_secs,
                self.interval_secs
            );
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        if self.fail_fast {
            ErrorPolicy::FailFast
        } else {
            ErrorPolicy::ContainPerWorkload
        }
    }

    pub fn restart_marker_ttl(&self) -> Option<Duration> {
        self.restart_marker_ttl_secs.map(Duration::from_secs)
    }

    pub fn stall_after(&self) -> Duration {
        Duration::from_secs(self.stall_after_secs)
    }
}

/// Kubeconfig used when not running inside a cluster
pub fn kubeconfig_path(override_path: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(PathBuf::from(path));
    }

    if let Ok(path) = std::env::var("KUBECONFIG") {
        return Ok(PathBuf::from(path));
    }

    let home = dirs_next::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".kube").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.error_policy(), ErrorPolicy::ContainPerWorkload);
        assert!(config.restart_marker_ttl().is_none());
        assert!(!config.dry_run);
    }

    #[test]
    fn test_fail_fast_selects_policy() {
        let config = AgentConfig {
            fail_fast: true,
            ..Default::default()
        };
        assert_eq!(config.error_policy(), ErrorPolicy::FailFast);
    }

    #[test]
    fn test_restart_marker_ttl() {
        let config = AgentConfig {
            restart_marker_ttl_secs: Some(900),
            ..Default::default()
        };
        assert_eq!(config.restart_marker_ttl(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(AgentConfig::default().validate().is_ok());
    }

    #[test]
    fn test_interval_longer_than_stall_window_is_rejected() {
        let config = AgentConfig {
            interval_secs: 600,
            stall_after_secs: 300,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("AGENT_STALL_AFTER_SECS"));

        let equal = AgentConfig {
            interval_secs: 300,
            stall_after_secs: 300,
            ..Default::default()
        };
        assert!(equal.validate().is_err());
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = AgentConfig {
            interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_kubeconfig_override_wins() {
        let path = kubeconfig_path(Some("/tmp/kubeconfig")).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/kubeconfig"));
    }
}

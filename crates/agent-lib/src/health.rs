//! Health check infrastructure for the drain rollout agent
//!
//! Tracks component health and pass progress for Kubernetes liveness and
//! readiness probes. A loop that stops completing passes (for example a
//! cluster call that never returns) is reported unhealthy once the last
//! pass is older than the stall threshold.

use crate::models::PassReport;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Information about a component's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pass_timestamp: Option<i64>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .fold(ComponentStatus::Healthy, |worst, status| match (worst, status) {
                (ComponentStatus::Unhealthy, _) | (_, ComponentStatus::Unhealthy) => {
                    ComponentStatus::Unhealthy
                }
                (ComponentStatus::Degraded, _) | (_, ComponentStatus::Degraded) => {
                    ComponentStatus::Degraded
                }
                _ => ComponentStatus::Healthy,
            })
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pass_timestamp: Option<i64>,
    /// Counters of the last pass that scanned a cordoned node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<PassReport>,
}

/// Component names for health tracking
pub mod components {
    /// Node polling and remediation loop
    pub const NODE_WATCH: &str = "node_watch";
    /// Reads and writes against the cluster API
    pub const CLUSTER_API: &str = "cluster_api";
}

/// Default age after which a missing pass marks the loop as stalled
const DEFAULT_STALL_AFTER: Duration = Duration::from_secs(300);

/// Health registry for tracking component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    last_pass: Arc<RwLock<Option<i64>>>,
    last_report: Arc<RwLock<Option<PassReport>>>,
    started_at: i64,
    stall_after: Duration,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_stall_after(DEFAULT_STALL_AFTER)
    }

    /// Registry that reports a stalled loop once no pass completed for `stall_after`
    pub fn with_stall_after(stall_after: Duration) -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            last_pass: Arc::new(RwLock::new(None)),
            last_report: Arc::new(RwLock::new(None)),
            started_at: chrono::Utc::now().timestamp(),
            stall_after,
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Update component health status
    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Record that a pass completed now
    pub async fn record_pass(&self) {
        self.record_pass_at(chrono::Utc::now().timestamp()).await;
    }

    /// Record that a pass completed at the given unix timestamp
    pub async fn record_pass_at(&self, timestamp: i64) {
        *self.last_pass.write().await = Some(timestamp);
    }

    /// Keep the report of the last pass over a cordoned node
    pub async fn record_report(&self, report: PassReport) {
        *self.last_report.write().await = Some(report);
    }

    /// Until the first pass completes, staleness counts from registry creation
    fn is_stalled(&self, last_pass: Option<i64>, now: i64) -> bool {
        let since = last_pass.unwrap_or(self.started_at);
        now.saturating_sub(since) > self.stall_after.as_secs() as i64
    }

    /// Get health response
    pub async fn health(&self) -> HealthResponse {
        let mut components = self.components.read().await.clone();
        let last_pass = *self.last_pass.read().await;

        if self.is_stalled(last_pass, chrono::Utc::now().timestamp()) {
            components.insert(
                components::NODE_WATCH.to_string(),
                ComponentHealth::unhealthy(format!(
                    "No pass completed in the last {}s",
                    self.stall_after.as_secs()
                )),
            );
        }

        let status = HealthResponse::compute_status(&components);
        HealthResponse {
            status,
            components,
            last_pass_timestamp: last_pass,
        }
    }

    /// Get readiness response
    pub async fn readiness(&self) -> ReadinessResponse {
        let last_pass_timestamp = *self.last_pass.read().await;
        let last_report = self.last_report.read().await.clone();

        let reason = if last_pass_timestamp.is_none() {
            Some("No pass completed yet".to_string())
        } else if self.health().await.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy".to_string())
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
            last_pass_timestamp,
            last_report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
        assert!(health.last_pass_timestamp.is_none());
    }

    #[tokio::test]
    async fn test_health_registry_degraded_status() {
        let registry = HealthRegistry::new();
        registry.register(components::NODE_WATCH).await;
        registry.register(components::CLUSTER_API).await;

        registry
            .set_degraded(components::CLUSTER_API, "2 workload errors skipped")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());
    }

    #[tokio::test]
    async fn test_unhealthy_outranks_degraded() {
        let registry = HealthRegistry::new();
        registry.set_degraded(components::CLUSTER_API, "slow").await;
        registry
            .set_unhealthy(components::NODE_WATCH, "cannot read node")
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_readiness_requires_a_pass() {
        let registry = HealthRegistry::new();
        registry.register(components::NODE_WATCH).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());

        registry.record_pass().await;
        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::CLUSTER_API).await;
        registry.record_pass().await;
        registry.set_unhealthy(components::CLUSTER_API, "Failed").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
    }

    #[tokio::test]
    async fn test_loop_without_any_pass_goes_stale() {
        let registry = HealthRegistry {
            started_at: chrono::Utc::now().timestamp() - 120,
            ..HealthRegistry::with_stall_after(Duration::from_secs(60))
        };
        registry.register(components::NODE_WATCH).await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert!(health.last_pass_timestamp.is_none());
    }

    #[test]
    fn test_stall_measured_from_start_until_first_pass() {
        let registry = HealthRegistry::with_stall_after(Duration::from_secs(1));
        let start = registry.started_at;

        assert!(!registry.is_stalled(None, start + 1));
        assert!(registry.is_stalled(None, start + 2));
        assert!(!registry.is_stalled(Some(start + 5), start + 6));
    }

    #[tokio::test]
    async fn test_readiness_carries_last_report() {
        let registry = HealthRegistry::new();
        registry
            .record_report(PassReport {
                pods_scanned: 4,
                restarted: 1,
                ..Default::default()
            })
            .await;
        registry.record_pass().await;

        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.last_pass_timestamp.is_some());
        assert_eq!(readiness.last_report.unwrap().restarted, 1);
    }

    #[tokio::test]
    async fn test_stalled_loop_reports_unhealthy() {
        let registry = HealthRegistry::with_stall_after(Duration::from_secs(60));
        registry.register(components::NODE_WATCH).await;
        registry
            .record_pass_at(chrono::Utc::now().timestamp() - 120)
            .await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components[components::NODE_WATCH].status,
            ComponentStatus::Unhealthy
        );
    }
}

//! Node remediation loop
//!
//! Each pass reads the watched node and, when it is cordoned, walks every
//! pod on it to the deployments that own them, classifies those
//! deployments and restarts the stuck ones. Passes never overlap and carry
//! no state between them.

use super::actuator::{RemediationOutcome, RestartGuard, RolloutRestarter};
use super::eligibility::{self, Eligibility};
use super::ownership;
use crate::cluster::{ClusterError, ClusterReader};
use crate::health::{components, HealthRegistry};
use crate::models::{PassReport, WorkloadKey};
use crate::observability::{AgentMetrics, StructuredLogger};
use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

/// How errors raised while handling a single workload affect the pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log and skip the affected pod or workload, keep scanning
    #[default]
    ContainPerWorkload,
    /// Abort the pass on the first error of any kind
    FailFast,
}

/// Severity of a pass error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The pass cannot run at all (node or pod listing unavailable)
    Systemic,
    /// Only one pod or workload is affected
    Workload,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Systemic => "systemic",
            Severity::Workload => "workload",
        }
    }
}

/// Errors raised during a pass
#[derive(Debug, Error)]
pub enum PassError {
    #[error("failed to read node {node}: {cause}")]
    Node { node: String, cause: ClusterError },

    #[error("failed to list pods on node {node}: {cause}")]
    ListPods { node: String, cause: ClusterError },

    #[error("failed to resolve owners of pod {pod}: {cause}")]
    Ownership { pod: WorkloadKey, cause: ClusterError },

    #[error("failed to read disruption budgets for deployment {workload}: {cause}")]
    Eligibility {
        workload: WorkloadKey,
        cause: ClusterError,
    },

    #[error("failed to restart rollout of deployment {workload}: {cause}")]
    Remediation {
        workload: WorkloadKey,
        cause: ClusterError,
    },
}

impl PassError {
    pub fn severity(&self) -> Severity {
        match self {
            PassError::Node { .. } | PassError::ListPods { .. } => Severity::Systemic,
            PassError::Ownership { .. }
            | PassError::Eligibility { .. }
            | PassError::Remediation { .. } => Severity::Workload,
        }
    }

    pub fn is_systemic(&self) -> bool {
        self.severity() == Severity::Systemic
    }

    /// Underlying cluster error
    pub fn cause(&self) -> &ClusterError {
        match self {
            PassError::Node { cause, .. }
            | PassError::ListPods { cause, .. }
            | PassError::Ownership { cause, .. }
            | PassError::Eligibility { cause, .. }
            | PassError::Remediation { cause, .. } => cause,
        }
    }
}

/// Result of a pass that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// The node accepts new pods; nothing was scanned
    Schedulable,
    /// The node is cordoned and its workloads were scanned
    Scanned(PassReport),
}

/// Configuration for the remediation loop
#[derive(Debug, Clone)]
pub struct RemediationConfig {
    /// Wait between the end of one pass and the start of the next (default: 30 seconds)
    pub interval: Duration,
    /// Handling of per-workload errors
    pub error_policy: ErrorPolicy,
    /// Age after which a restart marker is stale; `None` never expires
    pub restart_marker_ttl: Option<Duration>,
    /// Report stuck workloads without patching them
    pub dry_run: bool,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            error_policy: ErrorPolicy::default(),
            restart_marker_ttl: None,
            dry_run: false,
        }
    }
}

/// Loop that watches one node and rescues workloads stuck behind
/// disruption budgets while it is cordoned
pub struct RemediationLoop {
    reader: Arc<dyn ClusterReader>,
    node_name: String,
    config: RemediationConfig,
    restarter: RolloutRestarter,
    health: Option<HealthRegistry>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl RemediationLoop {
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        node_name: impl Into<String>,
        config: RemediationConfig,
    ) -> Self {
        let node_name = node_name.into();
        let restarter = RolloutRestarter::new(
            RestartGuard::new(config.restart_marker_ttl),
            config.dry_run,
        );

        Self {
            reader,
            logger: StructuredLogger::new(&node_name),
            node_name,
            config,
            restarter,
            health: None,
            metrics: AgentMetrics::new(),
        }
    }

    /// Report pass results to a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn config(&self) -> &RemediationConfig {
        &self.config
    }

    /// Run passes until shutdown is signalled or a pass fails fatally.
    ///
    /// The first pass starts immediately; each following pass starts
    /// `interval` after the previous one finished.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<(), PassError> {
        info!(
            node = %self.node_name,
            interval_secs = self.config.interval.as_secs(),
            error_policy = ?self.config.error_policy,
            dry_run = self.config.dry_run,
            "Starting drain remediation loop"
        );

        loop {
            let start = Instant::now();
            let result = self.run_pass().await;
            let elapsed = start.elapsed();
            self.metrics.observe_pass_latency(elapsed.as_secs_f64());

            match result {
                Ok(outcome) => {
                    if let PassOutcome::Scanned(report) = &outcome {
                        self.logger.log_pass_completed(
                            report.pods_scanned,
                            report.workloads_evaluated,
                            report.stuck,
                            report.restarted,
                            report.already_restarting,
                            report.contained_errors,
                            elapsed.as_millis(),
                        );
                    }
                    self.report_health(&outcome).await;
                }
                Err(e) => {
                    self.metrics.inc_pass_errors(e.severity().as_str());
                    self.logger.log_pass_failed(&e.to_string(), e.is_systemic());
                    if let Some(health) = &self.health {
                        health
                            .set_unhealthy(components::NODE_WATCH, e.to_string())
                            .await;
                    }
                    return Err(e);
                }
            }

            tokio::select! {
                _ = sleep(self.config.interval) => {}
                _ = shutdown.recv() => {
                    info!(node = %self.node_name, "Shutting down drain remediation loop");
                    return Ok(());
                }
            }
        }
    }

    /// Run a single pass
    pub async fn run_pass(&self) -> Result<PassOutcome, PassError> {
        let node = self
            .reader
            .get_node(&self.node_name)
            .await
            .map_err(|cause| PassError::Node {
                node: self.node_name.clone(),
                cause,
            })?;

        let unschedulable = node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false);
        self.metrics.set_node_unschedulable(unschedulable);

        if !unschedulable {
            self.logger.log_node_schedulable();
            return Ok(PassOutcome::Schedulable);
        }

        let pods = self
            .reader
            .list_pods_on_node(&self.node_name)
            .await
            .map_err(|cause| PassError::ListPods {
                node: self.node_name.clone(),
                cause,
            })?;
        self.logger.log_node_unschedulable(pods.len());

        let mut report = PassReport {
            pods_scanned: pods.len(),
            ..Default::default()
        };

        let workloads = self.resolve_workloads(&pods, &mut report).await?;
        report.workloads_evaluated = workloads.len();

        let stuck = self.select_stuck(workloads, &mut report).await?;
        report.stuck = stuck.len();

        for (key, deployment) in stuck {
            self.remediate(key, deployment, &mut report).await?;
        }

        Ok(PassOutcome::Scanned(report))
    }

    /// Deployments reachable from the pods, de-duplicated by key
    async fn resolve_workloads(
        &self,
        pods: &[Pod],
        report: &mut PassReport,
    ) -> Result<BTreeMap<WorkloadKey, Deployment>, PassError> {
        let mut workloads = BTreeMap::new();

        for pod in pods {
            match ownership::resolve_owners(self.reader.as_ref(), pod).await {
                Ok(deployments) => {
                    for deployment in deployments {
                        workloads
                            .entry(WorkloadKey::of(&deployment))
                            .or_insert(deployment);
                    }
                }
                Err(cause) => self.contain(
                    PassError::Ownership {
                        pod: WorkloadKey::new(pod.namespace().unwrap_or_default(), pod.name_any()),
                        cause,
                    },
                    report,
                )?,
            }
        }

        Ok(workloads)
    }

    /// Keep only the deployments blocked by a disruption budget
    async fn select_stuck(
        &self,
        workloads: BTreeMap<WorkloadKey, Deployment>,
        report: &mut PassReport,
    ) -> Result<Vec<(WorkloadKey, Deployment)>, PassError> {
        let mut stuck = Vec::new();

        for (key, deployment) in workloads {
            match eligibility::evaluate(self.reader.as_ref(), &deployment).await {
                Ok(Eligibility::Stuck { budget }) => {
                    self.metrics.inc_stuck_workloads();
                    self.logger
                        .log_stuck_workload(&key.namespace, &key.name, &budget);
                    stuck.push((key, deployment));
                }
                Ok(other) => {
                    debug!(workload = %key, eligibility = ?other, "Deployment not stuck");
                }
                Err(cause) => self.contain(
                    PassError::Eligibility {
                        workload: key,
                        cause,
                    },
                    report,
                )?,
            }
        }

        Ok(stuck)
    }

    async fn remediate(
        &self,
        key: WorkloadKey,
        mut deployment: Deployment,
        report: &mut PassReport,
    ) -> Result<(), PassError> {
        match self
            .restarter
            .remediate(self.reader.as_ref(), &mut deployment)
            .await
        {
            Ok(RemediationOutcome::Restarted { restarted_at }) => {
                report.restarted += 1;
                self.metrics.inc_rollout_restarts();
                self.logger
                    .log_restart(&key.namespace, &key.name, &restarted_at, false);
            }
            Ok(RemediationOutcome::DryRun { restarted_at }) => {
                report.restarted += 1;
                self.logger
                    .log_restart(&key.namespace, &key.name, &restarted_at, true);
            }
            Ok(RemediationOutcome::AlreadyRestarting { marker }) => {
                report.already_restarting += 1;
                self.metrics.inc_restarts_in_flight();
                self.logger
                    .log_restart_in_flight(&key.namespace, &key.name, &marker);
            }
            Err(cause) => self.contain(
                PassError::Remediation {
                    workload: key,
                    cause,
                },
                report,
            )?,
        }

        Ok(())
    }

    /// Apply the error policy: systemic errors and fail-fast mode abort the
    /// pass, anything else is logged and counted
    fn contain(&self, err: PassError, report: &mut PassReport) -> Result<(), PassError> {
        if err.is_systemic() || self.config.error_policy == ErrorPolicy::FailFast {
            return Err(err);
        }

        self.metrics.inc_pass_errors(err.severity().as_str());
        self.logger.log_error_contained(&err.to_string());
        report.contained_errors += 1;
        Ok(())
    }

    async fn report_health(&self, outcome: &PassOutcome) {
        let Some(health) = &self.health else {
            return;
        };

        health.set_healthy(components::NODE_WATCH).await;
        match outcome {
            PassOutcome::Scanned(report) if !report.is_clean() => {
                health
                    .set_degraded(
                        components::CLUSTER_API,
                        format!(
                            "{} workload error(s) skipped in last pass",
                            report.contained_errors
                        ),
                    )
                    .await;
            }
            _ => health.set_healthy(components::CLUSTER_API).await,
        }
        if let PassOutcome::Scanned(report) = outcome {
            health.record_report(report.clone()).await;
        }
        health.record_pass().await;
    }
}

/// Builder for creating the remediation loop
pub struct RemediationLoopBuilder {
    reader: Option<Arc<dyn ClusterReader>>,
    node_name: Option<String>,
    health: Option<HealthRegistry>,
    config: RemediationConfig,
}

impl RemediationLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            reader: None,
            node_name: None,
            health: None,
            config: RemediationConfig::default(),
        }
    }

    /// Set the cluster reader
    pub fn reader(mut self, reader: Arc<dyn ClusterReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// Set the node to watch
    pub fn node_name(mut self, node_name: impl Into<String>) -> Self {
        self.node_name = Some(node_name.into());
        self
    }

    /// Set the wait between passes
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the per-workload error policy
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.config.error_policy = policy;
        self
    }

    /// Set the restart marker TTL
    pub fn restart_marker_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.restart_marker_ttl = ttl;
        self
    }

    /// Enable or disable dry-run mode
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.config.dry_run = dry_run;
        self
    }

    /// Report pass results to a health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the remediation loop
    pub fn build(self) -> Result<RemediationLoop> {
        let reader = self
            .reader
            .ok_or_else(|| anyhow::anyhow!("Cluster reader is required"))?;
        let node_name = self
            .node_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Node name is required"))?;

        let remediation_loop = RemediationLoop::new(reader, node_name, self.config);
        Ok(match self.health {
            Some(health) => remediation_loop.with_health(health),
            None => remediation_loop,
        })
    }
}

impl Default for RemediationLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::tests::fixtures::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_remediation_config_default() {
        let config = RemediationConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.error_policy, ErrorPolicy::ContainPerWorkload);
        assert!(config.restart_marker_ttl.is_none());
        assert!(!config.dry_run);
    }

    #[test]
    fn test_builder_requires_reader() {
        let result = RemediationLoopBuilder::new().node_name("n1").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_requires_node_name() {
        let result = RemediationLoopBuilder::new()
            .reader(Arc::new(MockCluster::default()))
            .node_name("")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_applies_settings() {
        let remediation_loop = RemediationLoopBuilder::new()
            .reader(Arc::new(MockCluster::default()))
            .node_name("n1")
            .interval(Duration::from_secs(5))
            .error_policy(ErrorPolicy::FailFast)
            .dry_run(true)
            .build()
            .unwrap();

        assert_eq!(remediation_loop.node_name(), "n1");
        assert_eq!(remediation_loop.config().interval, Duration::from_secs(5));
        assert_eq!(remediation_loop.config().error_policy, ErrorPolicy::FailFast);
        assert!(remediation_loop.config().dry_run);
    }

    #[test]
    fn test_error_severity() {
        let systemic = PassError::Node {
            node: "n1".to_string(),
            cause: ClusterError::not_found("Node", None, "n1"),
        };
        let workload = PassError::Remediation {
            workload: WorkloadKey::new("default", "web"),
            cause: ClusterError::transport("timeout"),
        };

        assert!(systemic.is_systemic());
        assert!(!workload.is_systemic());
        assert_eq!(
            workload.to_string(),
            "failed to restart rollout of deployment default/web: cluster API request failed: timeout"
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let cluster = Arc::new(MockCluster::default().with_node(node("n1", false)));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();

        let remediation_loop = RemediationLoop::new(
            cluster.clone(),
            "n1",
            RemediationConfig {
                interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        remediation_loop.run(shutdown_rx).await.unwrap();
        assert_eq!(cluster.node_reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_returns_systemic_error() {
        let cluster = Arc::new(MockCluster::default());
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let health = HealthRegistry::new();

        let remediation_loop =
            RemediationLoop::new(cluster, "missing-node", RemediationConfig::default())
                .with_health(health.clone());

        let err = remediation_loop.run(shutdown_rx).await.unwrap_err();
        assert!(err.is_systemic());
        assert!(err.cause().is_not_found());
        assert!(!health.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_run_marks_ready_after_first_pass() {
        let cluster = Arc::new(MockCluster::default().with_node(node("n1", false)));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();
        let health = HealthRegistry::new();

        RemediationLoop::new(cluster, "n1", RemediationConfig::default())
            .with_health(health.clone())
            .run(shutdown_rx)
            .await
            .unwrap();

        let readiness = health.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.last_report.is_none());
    }

    #[tokio::test]
    async fn test_run_publishes_report_of_cordoned_pass() {
        let cluster = Arc::new(stuck_web_cluster(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        shutdown_tx.send(()).unwrap();
        let health = HealthRegistry::new();

        RemediationLoop::new(cluster.clone(), "n1", RemediationConfig::default())
            .with_health(health.clone())
            .run(shutdown_rx)
            .await
            .unwrap();

        let readiness = health.readiness().await;
        assert!(readiness.ready);
        assert!(readiness.last_pass_timestamp.is_some());
        let report = readiness.last_report.unwrap();
        assert_eq!(report.stuck, 1);
        assert_eq!(report.restarted, 1);
        assert_eq!(cluster.patches().len(), 1);
    }
}

//! Observability infrastructure for the drain rollout agent
//!
//! Provides:
//! - Prometheus metrics (pass latency, node state, detections, restarts, errors)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for pass latency (in seconds)
const PASS_LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    pass_latency_seconds: Histogram,
    passes: IntCounter,
    node_unschedulable: IntGauge,
    stuck_workloads_detected: IntCounter,
    rollout_restarts: IntCounter,
    restarts_in_flight: IntCounter,
    pass_errors: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            pass_latency_seconds: register_histogram!(
                "drain_rollout_pass_latency_seconds",
                "Time spent on one node check and remediation pass",
                PASS_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register pass_latency_seconds"),

            passes: register_int_counter!(
                "drain_rollout_passes_total",
                "Total number of completed passes"
            )
            .expect("Failed to register passes_total"),

            node_unschedulable: register_int_gauge!(
                "drain_rollout_node_unschedulable",
                "Whether the watched node is cordoned (1) or schedulable (0)"
            )
            .expect("Failed to register node_unschedulable"),

            stuck_workloads_detected: register_int_counter!(
                "drain_rollout_stuck_workloads_detected_total",
                "Total number of single-replica workloads found blocked by a disruption budget"
            )
            .expect("Failed to register stuck_workloads_detected"),

            rollout_restarts: register_int_counter!(
                "drain_rollout_restarts_total",
                "Total number of rollout restarts issued"
            )
            .expect("Failed to register restarts_total"),

            restarts_in_flight: register_int_counter!(
                "drain_rollout_restarts_skipped_in_flight_total",
                "Total number of stuck workloads skipped because a restart was already in flight"
            )
            .expect("Failed to register restarts_skipped_in_flight"),

            pass_errors: register_int_counter_vec!(
                "drain_rollout_pass_errors_total",
                "Total number of errors raised during passes",
                &["severity"]
            )
            .expect("Failed to register pass_errors"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    /// Record the duration of a pass
    pub fn observe_pass_latency(&self, duration_secs: f64) {
        self.inner().pass_latency_seconds.observe(duration_secs);
        self.inner().passes.inc();
    }

    /// Update the watched node's schedulability
    pub fn set_node_unschedulable(&self, unschedulable: bool) {
        self.inner()
            .node_unschedulable
            .set(i64::from(unschedulable));
    }

    pub fn inc_stuck_workloads(&self) {
        self.inner().stuck_workloads_detected.inc();
    }

    pub fn inc_rollout_restarts(&self) {
        self.inner().rollout_restarts.inc();
    }

    pub fn inc_restarts_in_flight(&self) {
        self.inner().restarts_in_flight.inc();
    }

    /// Increment the error counter for the given severity ("systemic" or "workload")
    pub fn inc_pass_errors(&self, severity: &str) {
        self.inner()
            .pass_errors
            .with_label_values(&[severity])
            .inc();
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for node state changes,
/// detections and remediation actions.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, interval_secs: u64, dry_run: bool) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            interval_secs = interval_secs,
            dry_run = dry_run,
            "Drain rollout agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Drain rollout agent shutting down"
        );
    }

    pub fn log_node_schedulable(&self) {
        info!(
            event = "node_schedulable",
            node = %self.node_name,
            "Node is schedulable, ignoring"
        );
    }

    pub fn log_node_unschedulable(&self, pods: usize) {
        info!(
            event = "node_unschedulable",
            node = %self.node_name,
            pods = pods,
            "Node is unschedulable, checking workloads"
        );
    }

    /// Log a single-replica workload blocked by a disruption budget
    pub fn log_stuck_workload(&self, namespace: &str, name: &str, budget: &str) {
        warn!(
            event = "stuck_workload_detected",
            node = %self.node_name,
            namespace = %namespace,
            deployment = %name,
            disruption_budget = %budget,
            "Detected deployment blocking node drain"
        );
    }

    /// Log a rollout restart that was issued (or would be, in dry-run mode)
    pub fn log_restart(&self, namespace: &str, name: &str, restarted_at: &str, dry_run: bool) {
        if dry_run {
            info!(
                event = "rollout_restarted",
                node = %self.node_name,
                namespace = %namespace,
                deployment = %name,
                restarted_at = %restarted_at,
                dry_run = true,
                "[DRY-RUN] Would restart rollout"
            );
        } else {
            info!(
                event = "rollout_restarted",
                node = %self.node_name,
                namespace = %namespace,
                deployment = %name,
                restarted_at = %restarted_at,
                "Restarted rollout"
            );
        }
    }

    /// Log a stuck workload left alone because a restart is in flight
    pub fn log_restart_in_flight(&self, namespace: &str, name: &str, marker: &str) {
        info!(
            event = "restart_in_flight",
            node = %self.node_name,
            namespace = %namespace,
            deployment = %name,
            restarted_at = %marker,
            "Deployment already being restarted"
        );
    }

    /// Log a per-workload error that was skipped
    pub fn log_error_contained(&self, error: &str) {
        warn!(
            event = "pass_error_contained",
            node = %self.node_name,
            error = %error,
            "Skipping workload after error"
        );
    }

    /// Log an error that aborted the pass
    pub fn log_pass_failed(&self, error: &str, systemic: bool) {
        error!(
            event = "pass_failed",
            node = %self.node_name,
            error = %error,
            systemic = systemic,
            "Pass aborted"
        );
    }

    /// Log pass completion statistics
    pub fn log_pass_completed(
        &self,
        pods: usize,
        workloads: usize,
        stuck: usize,
        restarted: usize,
        already_restarting: usize,
        contained_errors: usize,
        elapsed_ms: u128,
    ) {
        info!(
            event = "pass_completed",
            node = %self.node_name,
            pods = pods,
            workloads = workloads,
            stuck = stuck,
            restarted = restarted,
            already_restarting = already_restarting,
            contained_errors = contained_errors,
            elapsed_ms = elapsed_ms,
            "Pass complete"
        );
    }
}

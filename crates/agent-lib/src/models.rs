//! Core data models for the drain rollout agent

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Namespaced identity of a workload
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadKey {
    pub namespace: String,
    pub name: String,
}

impl WorkloadKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key of a deployment object as returned by the API server
    pub fn of(deployment: &Deployment) -> Self {
        Self {
            namespace: deployment.namespace().unwrap_or_default(),
            name: deployment.name_any(),
        }
    }
}

impl fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Result of a single pass over an unschedulable node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Pods found on the node
    pub pods_scanned: usize,
    /// Distinct deployments reached through ownership chains
    pub workloads_evaluated: usize,
    /// Deployments judged stuck behind a disruption budget
    pub stuck: usize,
    /// Rollout restarts written (or reported, in dry-run mode)
    pub restarted: usize,
    /// Stuck deployments skipped because a restart is already in flight
    pub already_restarting: usize,
    /// Per-workload errors logged and skipped
    pub contained_errors: usize,
}

impl PassReport {
    /// True when the pass completed without containing any error
    pub fn is_clean(&self) -> bool {
        self.contained_errors == 0
    }
}

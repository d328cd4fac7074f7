//! Cluster state access
//!
//! The drain controller only needs a handful of reads (node, pods on a node,
//! replicasets, deployments, disruption budgets) and a single write (a
//! pod-template annotation patch). They are grouped behind [`ClusterReader`]
//! so the core logic can run against the real API server or an in-memory
//! double in tests.

mod kube_reader;

pub use kube_reader::KubeClusterReader;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use thiserror::Error;

/// Errors surfaced by cluster reads and writes
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The requested object does not exist (deleted, or a stale reference)
    #[error("{kind} {} not found", display_name(.namespace, .name))]
    NotFound {
        kind: &'static str,
        namespace: Option<String>,
        name: String,
    },

    /// Network, authentication or API server failure
    #[error("cluster API request failed: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, namespace: Option<&str>, name: &str) -> Self {
        ClusterError::NotFound {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn transport(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        ClusterError::Transport(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

fn display_name(namespace: &Option<String>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    }
}

/// Read access to cluster state plus the single remediation write
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Fetch a node by name
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// List pods scheduled on the given node, across all namespaces
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ClusterError>;

    /// Fetch a replicaset
    async fn get_replica_set(&self, namespace: &str, name: &str)
        -> Result<ReplicaSet, ClusterError>;

    /// Fetch a deployment
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, ClusterError>;

    /// List all disruption budgets in a namespace
    async fn list_disruption_budgets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PodDisruptionBudget>, ClusterError>;

    /// Set a single annotation on a deployment's pod template, leaving
    /// everything else untouched
    async fn patch_template_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display_namespaced() {
        let err = ClusterError::not_found("ReplicaSet", Some("default"), "web-5d4f");
        assert_eq!(err.to_string(), "ReplicaSet default/web-5d4f not found");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_not_found_display_cluster_scoped() {
        let err = ClusterError::not_found("Node", None, "n1");
        assert_eq!(err.to_string(), "Node n1 not found");
    }

    #[test]
    fn test_transport_display() {
        let err = ClusterError::transport("connection refused");
        assert_eq!(
            err.to_string(),
            "cluster API request failed: connection refused"
        );
        assert!(!err.is_not_found());
    }
}

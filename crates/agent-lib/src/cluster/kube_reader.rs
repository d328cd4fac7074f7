//! Kubernetes API server implementation of [`ClusterReader`]

use super::{ClusterError, ClusterReader};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

/// Field manager recorded on the template annotation patch
pub const FIELD_MANAGER: &str = "drain-rollout-agent";

/// Cluster reader backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a kube error onto the drain taxonomy: HTTP 404 becomes `NotFound`,
/// everything else is a transport failure
fn classify(
    err: kube::Error,
    kind: &'static str,
    namespace: Option<&str>,
    name: &str,
) -> ClusterError {
    match err {
        kube::Error::Api(ref response) if response.code == 404 => {
            ClusterError::not_found(kind, namespace, name)
        }
        other => ClusterError::transport(other),
    }
}

/// Strategic merge patch touching a single pod-template annotation
pub fn template_annotation_patch(key: &str, value: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        key: value
                    }
                }
            }
        }
    })
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        nodes
            .get(name)
            .await
            .map_err(|e| classify(e, "Node", None, name))
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, ClusterError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));

        let list = pods.list(&params).await.map_err(ClusterError::transport)?;
        debug!(node = %node_name, count = list.items.len(), "Listed pods on node");
        Ok(list.items)
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, ClusterError> {
        let replica_sets: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        replica_sets
            .get(name)
            .await
            .map_err(|e| classify(e, "ReplicaSet", Some(namespace), name))
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments
            .get(name)
            .await
            .map_err(|e| classify(e, "Deployment", Some(namespace), name))
    }

    async fn list_disruption_budgets(
        &self,
        namespace: &str,
    ) -> Result<Vec<PodDisruptionBudget>, ClusterError> {
        let budgets: Api<PodDisruptionBudget> = Api::namespaced(self.client.clone(), namespace);
        let list = budgets
            .list(&ListParams::default())
            .await
            .map_err(ClusterError::transport)?;
        Ok(list.items)
    }

    async fn patch_template_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = template_annotation_patch(key, value);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        deployments
            .patch(name, &params, &Patch::Strategic(&patch))
            .await
            .map_err(|e| classify(e, "Deployment", Some(namespace), name))?;
        Ok(())
    }
}

//! Ownership resolution from a pod to the deployments that manage it
//!
//! Deployments never own pods directly: the chain is always
//! Pod -> ReplicaSet -> Deployment. Resolution is a fixed two-step pipeline
//! of typed lookups rather than a generic owner graph walk.

use crate::cluster::{ClusterError, ClusterReader};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::debug;

pub const REPLICA_SET_KIND: &str = "ReplicaSet";
pub const DEPLOYMENT_KIND: &str = "Deployment";

/// Names of the owners with the given kind; other owners are ignored
fn owners_of_kind<'a>(
    references: &'a [OwnerReference],
    kind: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    references
        .iter()
        .filter(move |reference| reference.kind == kind)
        .map(|reference| reference.name.as_str())
}

/// First step: replicasets owning the pod
async fn replica_sets_of(
    reader: &dyn ClusterReader,
    pod: &Pod,
) -> Result<Vec<ReplicaSet>, ClusterError> {
    let namespace = pod.namespace().unwrap_or_default();
    let mut replica_sets = Vec::new();

    for name in owners_of_kind(pod.owner_references(), REPLICA_SET_KIND) {
        replica_sets.push(reader.get_replica_set(&namespace, name).await?);
    }

    Ok(replica_sets)
}

/// Second step: deployments owning a replicaset
async fn deployments_of(
    reader: &dyn ClusterReader,
    replica_set: &ReplicaSet,
) -> Result<Vec<Deployment>, ClusterError> {
    let namespace = replica_set.namespace().unwrap_or_default();
    let mut deployments = Vec::new();

    for name in owners_of_kind(replica_set.owner_references(), DEPLOYMENT_KIND) {
        deployments.push(reader.get_deployment(&namespace, name).await?);
    }

    Ok(deployments)
}

/// Resolve the deployments that transitively own a pod.
///
/// Pods without a replicaset owner (static pods, DaemonSet or StatefulSet
/// pods, bare pods) resolve to nothing. A referenced replicaset or
/// deployment that cannot be fetched is an error.
pub async fn resolve_owners(
    reader: &dyn ClusterReader,
    pod: &Pod,
) -> Result<Vec<Deployment>, ClusterError> {
    let mut deployments = Vec::new();

    for replica_set in replica_sets_of(reader, pod).await? {
        deployments.extend(deployments_of(reader, &replica_set).await?);
    }

    debug!(
        pod = %pod.name_any(),
        namespace = ?pod.namespace(),
        deployments = deployments.len(),
        "Resolved pod owners"
    );

    Ok(deployments)
}

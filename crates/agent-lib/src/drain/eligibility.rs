//! Eligibility test for drain deadlocks
//!
//! A deployment is stuck when it runs exactly one replica and a disruption
//! budget in its namespace both selects the same pods and demands one pod
//! stays available. Eviction of the sole replica is then never allowed and
//! `kubectl drain` waits forever.

use crate::cluster::{ClusterError, ClusterReader};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

/// Outcome of classifying a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    /// Blocked by the named disruption budget
    Stuck { budget: String },
    /// Runs a replica count other than one
    ReplicaCount(i32),
    /// No budget in the namespace blocks eviction
    NoBlockingBudget,
}

impl Eligibility {
    pub fn is_stuck(&self) -> bool {
        matches!(self, Eligibility::Stuck { .. })
    }
}

/// Canonical string form of a label selector.
///
/// Two selectors are equivalent only when these strings are byte-identical.
/// Label maps serialize with sorted keys; expressions keep their declared
/// order, so reordered but otherwise equal expressions do not match.
/// An empty label map or expression list is the same as an absent one.
pub fn canonical_selector(selector: &LabelSelector) -> Option<String> {
    let normalized = LabelSelector {
        match_labels: selector
            .match_labels
            .clone()
            .filter(|labels| !labels.is_empty()),
        match_expressions: selector
            .match_expressions
            .clone()
            .filter(|expressions| !expressions.is_empty()),
    };
    serde_json::to_string(&normalized).ok()
}

/// Desired replicas; the API server defaults an unset count to 1
pub fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1)
}

/// Whether a budget forbids evicting the sole replica of a workload whose
/// selector has the given canonical form
pub fn budget_blocks(budget: &PodDisruptionBudget, workload_selector: &str) -> bool {
    let Some(spec) = budget.spec.as_ref() else {
        return false;
    };

    let blocks_single_replica = matches!(spec.min_available, Some(IntOrString::Int(1)));

    let same_selector = spec
        .selector
        .as_ref()
        .and_then(canonical_selector)
        .is_some_and(|selector| selector == workload_selector);

    blocks_single_replica && same_selector
}

/// Classify a deployment against an already-fetched budget list
pub fn classify(deployment: &Deployment, budgets: &[PodDisruptionBudget]) -> Eligibility {
    let replicas = desired_replicas(deployment);
    if replicas != 1 {
        return Eligibility::ReplicaCount(replicas);
    }

    let Some(selector) = deployment
        .spec
        .as_ref()
        .and_then(|spec| canonical_selector(&spec.selector))
    else {
        return Eligibility::NoBlockingBudget;
    };

    budgets
        .iter()
        .find(|budget| budget_blocks(budget, &selector))
        .map(|budget| Eligibility::Stuck {
            budget: budget.name_any(),
        })
        .unwrap_or(Eligibility::NoBlockingBudget)
}

/// Classify a deployment, listing the budgets in its namespace.
///
/// Multi-replica deployments are rejected before any budget is read.
pub async fn evaluate(
    reader: &dyn ClusterReader,
    deployment: &Deployment,
) -> Result<Eligibility, ClusterError> {
    let replicas = desired_replicas(deployment);
    if replicas != 1 {
        return Ok(Eligibility::ReplicaCount(replicas));
    }

    let namespace = deployment.namespace().unwrap_or_default();
    let budgets = reader.list_disruption_budgets(&namespace).await?;

    Ok(classify(deployment, &budgets))
}

/// Boolean form of [`evaluate`]
pub async fn is_stuck(
    reader: &dyn ClusterReader,
    deployment: &Deployment,
) -> Result<bool, ClusterError> {
    Ok(evaluate(reader, deployment).await?.is_stuck())
}

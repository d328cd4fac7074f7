//! Agent library for rescuing node drains
//!
//! This crate provides the core functionality for:
//! - Cluster state access (nodes, pods, replicasets, deployments, disruption budgets)
//! - Drain deadlock detection and rollout-restart remediation
//! - Health checks and observability

pub mod cluster;
pub mod drain;
pub mod health;
pub mod models;
pub mod observability;

pub use cluster::{ClusterError, ClusterReader, KubeClusterReader};
pub use drain::{
    ErrorPolicy, PassError, PassOutcome, RemediationConfig, RemediationLoop,
    RemediationLoopBuilder,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};

//! Drain deadlock detection and remediation
//!
//! When the watched node is cordoned, pods on it are traced to their
//! deployments (`ownership`), deployments running a single replica behind
//! a disruption budget that forbids evicting it are flagged (`eligibility`),
//! and flagged deployments get a rollout restart (`actuator`) so they are
//! rescheduled elsewhere. `RemediationLoop` drives this on a fixed interval.

pub mod actuator;
pub mod eligibility;
pub mod ownership;
mod r#loop;


pub use actuator::{RemediationOutcome, RestartGuard, RolloutRestarter, RESTARTED_AT_ANNOTATION};
pub use eligibility::{is_stuck, Eligibility};
pub use ownership::resolve_owners;
pub use r#loop::{
    ErrorPolicy, PassError, PassOutcome, RemediationConfig, RemediationLoop,
    RemediationLoopBuilder, Severity,
};

//! Rollout restart of stuck deployments
//!
//! A restart is requested by stamping the pod template with a timestamp
//! annotation, which makes the deployment controller roll out a new
//! template revision. The same annotation marks the restart as in flight.

use crate::cluster::{ClusterError, ClusterReader};
use crate::models::WorkloadKey;
use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Pod-template annotation carrying the restart timestamp (RFC 3339)
pub const RESTARTED_AT_ANNOTATION: &str = "kubedrainrollout.kubernetes.io/restartedAt";

/// What the actuator did for a stuck deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationOutcome {
    /// The restart annotation was written
    Restarted { restarted_at: String },
    /// Dry-run mode: the restart was reported, not written
    DryRun { restarted_at: String },
    /// A restart marker is already present and not stale
    AlreadyRestarting { marker: String },
}

fn template_annotations(deployment: &Deployment) -> Option<&BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()?
        .template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()
}

fn set_template_annotation(deployment: &mut Deployment, key: &str, value: &str) {
    deployment
        .spec
        .get_or_insert_with(Default::default)
        .template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Guard deciding whether a restart marker is still in flight.
///
/// Without a TTL a marker never expires, so a deployment is remediated at
/// most once for as long as the annotation stays on its template. With a
/// TTL, markers older than the TTL are stale and the deployment may be
/// restarted again.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartGuard {
    marker_ttl: Option<Duration>,
}

impl RestartGuard {
    pub fn new(marker_ttl: Option<Duration>) -> Self {
        Self { marker_ttl }
    }

    /// Current restart marker on the deployment's pod template
    pub fn marker(deployment: &Deployment) -> Option<&str> {
        template_annotations(deployment)?
            .get(RESTARTED_AT_ANNOTATION)
            .map(String::as_str)
    }

    /// Whether a restart is considered in flight at `now`
    pub fn in_flight(&self, deployment: &Deployment, now: DateTime<Utc>) -> bool {
        let Some(marker) = Self::marker(deployment) else {
            return false;
        };

        let Some(ttl) = self.marker_ttl else {
            return true;
        };

        // A marker we cannot date is left alone
        let Ok(stamped) = DateTime::parse_from_rfc3339(marker) else {
            return true;
        };

        let age = now.signed_duration_since(stamped.with_timezone(&Utc));
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }
}

/// Issues rollout restarts for stuck deployments
#[derive(Debug, Clone, Default)]
pub struct RolloutRestarter {
    guard: RestartGuard,
    dry_run: bool,
}

impl RolloutRestarter {
    pub fn new(guard: RestartGuard, dry_run: bool) -> Self {
        Self { guard, dry_run }
    }

    pub fn guard(&self) -> &RestartGuard {
        &self.guard
    }

    /// Restart the deployment unless a restart is already in flight
    pub async fn remediate(
        &self,
        reader: &dyn ClusterReader,
        deployment: &mut Deployment,
    ) -> Result<RemediationOutcome, ClusterError> {
        self.remediate_at(reader, deployment, Utc::now()).await
    }

    /// Same as [`remediate`](Self::remediate) with an explicit clock.
    ///
    /// On success the annotation is also applied to `deployment`, so calling
    /// again with the same object is a no-op.
    pub async fn remediate_at(
        &self,
        reader: &dyn ClusterReader,
        deployment: &mut Deployment,
        now: DateTime<Utc>,
    ) -> Result<RemediationOutcome, ClusterError> {
        if self.guard.in_flight(deployment, now) {
            let marker = RestartGuard::marker(deployment)
                .unwrap_or_default()
                .to_string();
            return Ok(RemediationOutcome::AlreadyRestarting { marker });
        }

        let restarted_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        if self.dry_run {
            return Ok(RemediationOutcome::DryRun { restarted_at });
        }

        let key = WorkloadKey::of(deployment);
        reader
            .patch_template_annotation(
                &key.namespace,
                &key.name,
                RESTARTED_AT_ANNOTATION,
                &restarted_at,
            )
            .await?;

        debug!(workload = %key, restarted_at = %restarted_at, "Patched restart annotation");
        set_template_annotation(deployment, RESTARTED_AT_ANNOTATION, &restarted_at);

        Ok(RemediationOutcome::Restarted { restarted_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drain::tests::fixtures::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_remediate_writes_rfc3339_annotation() {
        let cluster = MockCluster::default();
        let mut web = deployment("default", "web", 1, &[("app", "web")]);
        let restarter = RolloutRestarter::default();

        let outcome = restarter
            .remediate_at(&cluster, &mut web, at(12, 0))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RemediationOutcome::Restarted {
                restarted_at: "2024-03-01T12:00:00Z".to_string()
            }
        );
        let patches = cluster.patches();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].namespace, "default");
        assert_eq!(patches[0].name, "web");
        assert_eq!(patches[0].key, RESTARTED_AT_ANNOTATION);
        assert_eq!(patches[0].value, "2024-03-01T12:00:00Z");
        assert_eq!(RestartGuard::marker(&web), Some("2024-03-01T12:00:00Z"));
    }

    #[tokio::test]
    async fn test_remediate_twice_writes_once() {
        let cluster = MockCluster::default();
        let mut web = deployment("default", "web", 1, &[("app", "web")]);
        let restarter = RolloutRestarter::default();

        restarter.remediate(&cluster, &mut web).await.unwrap();
        let second = restarter.remediate(&cluster, &mut web).await.unwrap();

        assert!(matches!(
            second,
            RemediationOutcome::AlreadyRestarting { .. }
        ));
        assert_eq!(cluster.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_marker_skips_patch() {
        let cluster = MockCluster::default();
        let mut web = with_restart_marker(
            deployment("default", "web", 1, &[("app", "web")]),
            "2020-01-01T00:00:00Z",
        );

        let outcome = RolloutRestarter::default()
            .remediate(&cluster, &mut web)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RemediationOutcome::AlreadyRestarting {
                marker: "2020-01-01T00:00:00Z".to_string()
            }
        );
        assert!(cluster.patches().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_does_not_patch() {
        let cluster = MockCluster::default();
        let mut web = deployment("default", "web", 1, &[("app", "web")]);
        let restarter = RolloutRestarter::new(RestartGuard::default(), true);

        let outcome = restarter
            .remediate_at(&cluster, &mut web, at(8, 30))
            .await
            .unwrap();

        assert!(matches!(outcome, RemediationOutcome::DryRun { .. }));
        assert!(cluster.patches().is_empty());
        assert_eq!(RestartGuard::marker(&web), None);
    }

    #[tokio::test]
    async fn test_patch_failure_leaves_object_unmarked() {
        let cluster = MockCluster::default().failing_patches();
        let mut web = deployment("default", "web", 1, &[("app", "web")]);

        let result = RolloutRestarter::default()
            .remediate(&cluster, &mut web)
            .await;

        assert!(result.is_err());
        assert_eq!(RestartGuard::marker(&web), None);
    }

    #[test]
    fn test_guard_without_ttl_never_expires() {
        let web = with_restart_marker(
            deployment("default", "web", 1, &[("app", "web")]),
            "2020-01-01T00:00:00Z",
        );

        assert!(RestartGuard::default().in_flight(&web, at(12, 0)));
    }

    #[test]
    fn test_guard_with_ttl_expires_old_markers() {
        let guard = RestartGuard::new(Some(Duration::from_secs(600)));
        let web = with_restart_marker(
            deployment("default", "web", 1, &[("app", "web")]),
            "2024-03-01T12:00:00Z",
        );

        assert!(guard.in_flight(&web, at(12, 5)));
        assert!(!guard.in_flight(&web, at(12, 10)));
        assert!(!guard.in_flight(&web, at(13, 0)));
    }

    #[test]
    fn test_guard_with_ttl_keeps_unparseable_markers() {
        let guard = RestartGuard::new(Some(Duration::from_secs(60)));
        let web = with_restart_marker(
            deployment("default", "web", 1, &[("app", "web")]),
            "yesterday",
        );

        assert!(guard.in_flight(&web, at(12, 0)));
    }

    #[test]
    fn test_guard_ignores_unmarked_templates() {
        let web = deployment("default", "web", 1, &[("app", "web")]);

        assert!(!RestartGuard::default().in_flight(&web, at(12, 0)));
    }

    #[tokio::test]
    async fn test_stale_marker_is_restarted_again() {
        let cluster = MockCluster::default();
        let mut web = with_restart_marker(
            deployment("default", "web", 1, &[("app", "web")]),
            "2024-03-01T06:00:00Z",
        );
        let restarter =
            RolloutRestarter::new(RestartGuard::new(Some(Duration::from_secs(3600))), false);

        let outcome = restarter
            .remediate_at(&cluster, &mut web, at(12, 0))
            .await
            .unwrap();

        assert!(matches!(outcome, RemediationOutcome::Restarted { .. }));
        assert_eq!(RestartGuard::marker(&web), Some("2024-03-01T12:00:00Z"));
    }
}

//! Idempotent status construction for Sessions
//!
//! All status mutations go through [`StatusBuilder`]: it clones the persisted
//! status, applies the changes a step wants, and yields a patch only when the
//! result actually differs. Re-running a pass against an already-updated
//! Session therefore produces no write, which is what keeps the controller
//! level-triggered rather than edge-triggered.

use chrono::{DateTime, Utc};

use crate::crd::{condition_reasons, condition_types};
use crate::crd::{Condition, ConditionStatus, Session, SessionStatus};

/// Builder over a Session's persisted status.
///
/// Conditions are merged by content: when the new condition matches the
/// existing one except for the timestamp, the existing entry (and its
/// `lastTransitionTime`) is kept untouched.
pub struct StatusBuilder {
    status: SessionStatus,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
    changed: bool,
}

impl StatusBuilder {
    /// Start from the session's current status (or an empty one).
    pub fn new(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            status: session.status.clone().unwrap_or_default(),
            observed_generation: session.metadata.generation,
            now,
            changed: false,
        }
    }

    /// Set the expiration timestamp. Write-once: a status that already has
    /// `expiresAt` is never changed, whatever value is passed.
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        if self.status.expires_at.is_none() {
            self.status.expires_at = Some(expires_at);
            self.changed = true;
        }
        self
    }

    /// Set the credential secret reference.
    pub fn with_credentials_secret_ref(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if self.status.credentials_secret_ref.as_deref() != Some(name.as_str()) {
            self.status.credentials_secret_ref = Some(name);
            self.changed = true;
        }
        self
    }

    /// Set the backing API server URL.
    pub fn with_backend_kas_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if self.status.backend_kas_url.as_deref() != Some(url.as_str()) {
            self.status.backend_kas_url = Some(url);
            self.changed = true;
        }
        self
    }

    /// Set the externally reachable session endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        if self.status.endpoint.as_deref() != Some(endpoint.as_str()) {
            self.status.endpoint = Some(endpoint);
            self.changed = true;
        }
        self
    }

    /// Merge a condition into the status.
    ///
    /// An existing condition with equal content keeps its transition time; a
    /// differing or missing one is replaced/appended with `now`.
    pub fn with_condition(
        mut self,
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) -> Self {
        let candidate = Condition::new(
            type_,
            status,
            reason,
            message,
            self.observed_generation,
            self.now,
        );
        match self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.type_ == type_)
        {
            Some(existing) if existing.content_equal(&candidate) => {}
            Some(existing) => {
                *existing = candidate;
                self.changed = true;
            }
            None => {
                self.status.conditions.push(candidate);
                self.changed = true;
            }
        }
        self
    }

    /// Mark the session not ready. Used alongside every failure condition so
    /// the top-level Ready condition always reflects reality.
    pub fn not_ready(self) -> Self {
        self.with_condition(
            condition_types::READY,
            ConditionStatus::False,
            condition_reasons::NOT_READY,
            "Session is not ready",
        )
    }

    /// Returns the new status if it differs from the starting one.
    pub fn build(self) -> Option<SessionStatus> {
        self.changed.then_some(self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AccessLevel, HostedControlPlaneRef, ManagementClusterRef, Owner, SessionSpec,
    };
    use chrono::Duration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn fixed_time() -> DateTime<Utc> {
        "2025-01-07T12:00:00Z".parse().expect("valid timestamp")
    }

    fn sample_session() -> Session {
        let mut session = Session::new(
            "test-session",
            SessionSpec {
                ttl_seconds: 24 * 3600,
                owner: Owner {
                    name: "user@example.com".to_string(),
                    claim_type: "email".to_string(),
                },
                access_level: AccessLevel {
                    group: "break-glass".to_string(),
                },
                hosted_control_plane: HostedControlPlaneRef {
                    namespace: "clusters-test-hcp".to_string(),
                    resource_id: "/subscriptions/abc/hostedclusters/test-hcp".to_string(),
                },
                management_cluster: ManagementClusterRef {
                    resource_id: "/subscriptions/abc/managedclusters/mc-1".to_string(),
                },
            },
        );
        session.metadata.namespace = Some("team-sre".to_string());
        session.metadata.creation_timestamp = Some(Time(fixed_time()));
        session.metadata.generation = Some(1);
        session
    }

    #[test]
    fn unchanged_status_builds_to_none() {
        let session = sample_session();
        assert!(StatusBuilder::new(&session, fixed_time()).build().is_none());
    }

    #[test]
    fn expires_at_is_write_once() {
        let mut session = sample_session();
        let first = fixed_time() + Duration::hours(24);

        let status = StatusBuilder::new(&session, fixed_time())
            .with_expires_at(first)
            .build()
            .expect("changed");
        assert_eq!(status.expires_at, Some(first));

        session.status = Some(status);
        // A later pass with a different value produces no update.
        assert!(StatusBuilder::new(&session, fixed_time())
            .with_expires_at(first + Duration::hours(1))
            .build()
            .is_none());
    }

    #[test]
    fn equal_condition_content_preserves_transition_time() {
        let mut session = sample_session();
        let status = StatusBuilder::new(&session, fixed_time())
            .with_condition(
                condition_types::READY,
                ConditionStatus::False,
                condition_reasons::NOT_READY,
                "Session is not ready",
            )
            .build()
            .expect("changed");
        session.status = Some(status);

        let later = fixed_time() + Duration::minutes(10);
        // Same content: no update at all.
        assert!(StatusBuilder::new(&session, later)
            .with_condition(
                condition_types::READY,
                ConditionStatus::False,
                condition_reasons::NOT_READY,
                "Session is not ready",
            )
            .build()
            .is_none());

        // Different content: replaced, with the new timestamp.
        let status = StatusBuilder::new(&session, later)
            .with_condition(
                condition_types::READY,
                ConditionStatus::True,
                condition_reasons::SESSION_READY,
                "Session is ready",
            )
            .build()
            .expect("changed");
        let ready = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::READY)
            .expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.last_transition_time, later);
    }

    #[test]
    fn not_ready_sets_ready_false() {
        let session = sample_session();
        let status = StatusBuilder::new(&session, fixed_time())
            .with_condition(
                condition_types::HOSTED_CONTROL_PLANE_AVAILABLE,
                ConditionStatus::False,
                condition_reasons::HOSTED_CONTROL_PLANE_NOT_FOUND,
                "HostedControlPlane not found on management cluster",
            )
            .not_ready()
            .build()
            .expect("changed");
        assert_eq!(status.conditions.len(), 2);
        let ready = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::READY)
            .expect("ready condition");
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, condition_reasons::NOT_READY);
    }

    #[test]
    fn scalar_fields_only_mark_changed_on_difference() {
        let mut session = sample_session();
        let status = StatusBuilder::new(&session, fixed_time())
            .with_backend_kas_url("https://api.test-hcp.example.com")
            .with_credentials_secret_ref("breakglass-abc12345")
            .build()
            .expect("changed");
        session.status = Some(status);

        assert!(StatusBuilder::new(&session, fixed_time())
            .with_backend_kas_url("https://api.test-hcp.example.com")
            .with_credentials_secret_ref("breakglass-abc12345")
            .build()
            .is_none());
    }
}

//! Session Custom Resource Definition
//!
//! A Session represents one time-boxed break-glass access grant against a
//! HostedControlPlane on a remote management cluster. The spec is immutable
//! once created; all progress is recorded in the status, which doubles as the
//! persisted state machine: every reconcile pass re-derives where it left off
//! from the status fields alone.

use chrono::{DateTime, Duration, Utc};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition_types;
use crate::deterministic_suffix;

/// Specification for a Session
///
/// All fields are set at creation time by the admin API and never change.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "breakglass.openshift.io",
    version = "v1alpha1",
    kind = "Session",
    plural = "sessions",
    namespaced,
    status = "SessionStatus",
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Expires","type":"date","jsonPath":".status.expiresAt"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    /// Session lifetime in seconds, relative to the creation timestamp
    pub ttl_seconds: i64,

    /// Principal the session is granted to; becomes the certificate CN
    pub owner: Owner,

    /// RBAC access level embedded in the certificate
    pub access_level: AccessLevel,

    /// The hosted control plane this session targets
    pub hosted_control_plane: HostedControlPlaneRef,

    /// The management cluster hosting the control plane
    pub management_cluster: ManagementClusterRef,
}

/// Principal identity for a session
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    /// Principal name, used as the certificate Common Name and audit subject
    pub name: String,

    /// Claim type the name was taken from (e.g. "email", "oid")
    pub claim_type: String,
}

/// RBAC access level for a session
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessLevel {
    /// Group embedded as the certificate Organization; RBAC bindings on the
    /// hosted cluster key off this group
    pub group: String,
}

/// Reference to the targeted HostedControlPlane
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostedControlPlaneRef {
    /// Namespace of the HostedControlPlane on the management cluster; also
    /// determines the CSR signer name
    pub namespace: String,

    /// Cloud resource ID of the hosted cluster
    pub resource_id: String,
}

/// Reference to the management cluster hosting the control plane
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManagementClusterRef {
    /// Cloud resource ID; key into the provider registry
    pub resource_id: String,
}

/// Status for a Session, written exclusively by the controller via
/// server-side apply.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Expiration timestamp; set once on the first reconcile, immutable after
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Name of the credential secret in the session namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_ref: Option<String>,

    /// URL of the backing Kubernetes API server
    #[serde(default, rename = "backendKASURL", skip_serializing_if = "Option::is_none")]
    pub backend_kas_url: Option<String>,

    /// Externally reachable proxy URL for this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Conditions representing session state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Status of a condition (True, False, Unknown)
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for session status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g. Ready, CredentialsAvailable)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Generation of the Session the condition was computed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the condition content changed
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the given transition timestamp.
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation,
            last_transition_time: now,
        }
    }

    /// Content-only equality, ignoring the transition timestamp.
    ///
    /// Determines both whether a status update is needed and whether the
    /// existing timestamp should be preserved.
    pub fn content_equal(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Session phase derived from persisted status at the start of a pass.
///
/// The phase is recomputed from status fields every reconcile, so a crash mid
/// pass is safely re-derived on the next one. It drives logging and tests;
/// the step chain itself dispatches on the same underlying fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    /// TTL elapsed; the session is being torn down
    Expired,
    /// First reconcile; expiresAt not yet persisted
    PendingExpiry,
    /// Waiting for the HostedControlPlane to report Available
    AwaitingControlPlane,
    /// Credential sub-machine in progress
    IssuingCredentials,
    /// Credentials done; backend URL not yet discovered
    AwaitingNetworkPath,
    /// Network path done; endpoint not yet published
    AwaitingEndpoint,
    /// Fully provisioned
    Ready,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Expired => "Expired",
            Self::PendingExpiry => "PendingExpiry",
            Self::AwaitingControlPlane => "AwaitingControlPlane",
            Self::IssuingCredentials => "IssuingCredentials",
            Self::AwaitingNetworkPath => "AwaitingNetworkPath",
            Self::AwaitingEndpoint => "AwaitingEndpoint",
            Self::Ready => "Ready",
        };
        write!(f, "{s}")
    }
}

impl Session {
    /// The session TTL as a duration.
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.spec.ttl_seconds)
    }

    /// Expiration instant: creation timestamp plus TTL.
    ///
    /// Returns None when the API server has not stamped a creation time yet
    /// (only in synthetic objects).
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.meta()
            .creation_timestamp
            .as_ref()
            .map(|t| t.0 + self.ttl())
    }

    /// Returns true once the TTL has elapsed relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry().is_some_and(|e| now > e)
    }

    /// Look up a condition by type.
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// Returns true if the condition of the given type exists with status True.
    pub fn condition_is_true(&self, type_: &str) -> bool {
        self.condition(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    /// Deterministic name shared by the credential secret (session namespace)
    /// and the CSR (management cluster).
    pub fn credential_name(&self) -> String {
        format!(
            "breakglass-{}",
            deterministic_suffix(&self.namespace().unwrap_or_default(), &self.name_any())
        )
    }

    /// Compute the phase from persisted status.
    pub fn phase(&self, now: DateTime<Utc>) -> SessionPhase {
        if self.is_expired(now) {
            return SessionPhase::Expired;
        }
        let status = match self.status.as_ref() {
            Some(s) => s,
            None => return SessionPhase::PendingExpiry,
        };
        if status.expires_at.is_none() {
            return SessionPhase::PendingExpiry;
        }
        if !self.condition_is_true(condition_types::HOSTED_CONTROL_PLANE_AVAILABLE) {
            return SessionPhase::AwaitingControlPlane;
        }
        if !self.condition_is_true(condition_types::CREDENTIALS_AVAILABLE) {
            return SessionPhase::IssuingCredentials;
        }
        if status.backend_kas_url.is_none() {
            return SessionPhase::AwaitingNetworkPath;
        }
        if status.endpoint.is_none() {
            return SessionPhase::AwaitingEndpoint;
        }
        SessionPhase::Ready
    }
}

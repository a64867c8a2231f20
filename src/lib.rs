//! Breakglass - Kubernetes operator for time-boxed break-glass access to hosted control planes
//!
//! A Session custom resource represents one break-glass access grant against a
//! HostedControlPlane running on a remote management cluster. The operator
//! drives each Session through credential issuance (private key, CSR on the
//! management cluster, approval, signed certificate), network path discovery,
//! and automatic teardown when the session TTL elapses.
//!
//! # Architecture
//!
//! - The session controller runs an ordered step chain per reconcile pass and
//!   applies at most one mutating action per pass via server-side apply.
//! - Remote management clusters are connected on demand: a provider with
//!   watchers for CSRs, approvals, and HostedControlPlanes is registered when
//!   the first Session references a cluster and torn down when the last one
//!   is gone. Registration runs on a dedicated single-writer task.
//! - A secondary data plane controller registers ready sessions with a local
//!   proxy registry so traffic can be forwarded to the backing API server.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Session) and foreign hypershift types
//! - [`controller`] - Session reconciliation engine and action discipline
//! - [`mc`] - Management cluster provider registry and remote queriers
//! - [`dataplane`] - Data plane controller and proxy registry
//! - [`pki`] - RSA key handling, CSR building and validation
//! - [`endpoints`] - Session endpoint derivation
//! - [`events`] - Kubernetes Event publishing
//! - [`leader_election`] - Lease-based leader election
//! - [`error`] - Error types and severity classification

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod dataplane;
pub mod endpoints;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod mc;
pub mod pki;

pub use error::{Error, Severity};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared Constants
// =============================================================================
// The operator is the sole field manager for every resource it writes, so all
// server-side applies use FIELD_MANAGER with force.

/// Field manager name used for all server-side apply operations
pub const FIELD_MANAGER: &str = "breakglass-operator";

/// Label applied to every resource the operator creates
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Annotation carrying the `<namespace>/<name>` of the owning Session.
///
/// CSRs and approvals live on the management cluster where Kubernetes owner
/// references cannot point back at the Session, so ownership is recorded as
/// an annotation instead.
pub const ANNOTATION_SESSION: &str = "breakglass.openshift.io/session";

/// Label key marking CSR approvals as break-glass credentials
pub const LABEL_CREDENTIAL_TYPE: &str = "api.openshift.com/type";

/// Label value for [`LABEL_CREDENTIAL_TYPE`]
pub const LABEL_CREDENTIAL_TYPE_VALUE: &str = "break-glass-credential";

/// Key of the PEM-encoded private key in the credential secret
pub const SECRET_KEY_PRIVATE_KEY: &str = "privateKey";

/// Key of the PEM-encoded certificate in the credential secret
pub const SECRET_KEY_CERTIFICATE: &str = "certificate";

/// Minimum CSR lifetime the platform will accept, in seconds.
///
/// Session access is bounded by session expiration, not certificate
/// expiration, so short TTLs are padded up to this floor.
pub const MIN_CSR_EXPIRATION_SECONDS: i32 = 600;

/// Returns the managed-by label selector string used for watches and lists.
pub fn managed_by_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, FIELD_MANAGER)
}

/// FNV-1a 32-bit hash, used for deterministic resource name suffixes.
///
/// The hash algorithm is an implementation detail, not a contract; it only
/// needs to be stable within one deployment and injective in practice.
pub fn fnv1a32(data: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for b in data.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

/// Deterministic hex suffix for per-session resource names (secret, CSR).
pub fn deterministic_suffix(namespace: &str, name: &str) -> String {
    format!("{:08x}", fnv1a32(&format!("{namespace}-{name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_matches_reference_vectors() {
        // Reference values for the 32-bit FNV-1a offset basis and prime.
        assert_eq!(fnv1a32(""), 0x811c9dc5);
        assert_eq!(fnv1a32("a"), 0xe40c292c);
        assert_eq!(fnv1a32("foobar"), 0xbf9cf968);
    }

    #[test]
    fn deterministic_suffix_is_stable_and_distinct() {
        let a = deterministic_suffix("team-a", "session-1");
        let b = deterministic_suffix("team-a", "session-1");
        let c = deterministic_suffix("team-b", "session-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn managed_by_selector_format() {
        assert_eq!(
            managed_by_selector(),
            "app.kubernetes.io/managed-by=breakglass-operator"
        );
    }
}

//! Action set produced by a reconcile pass
//!
//! Each pass results in at most ONE mutating action against the clusters, so
//! every write is observed (and its effects re-read) before the next one is
//! decided. [`Actions::validate`] enforces this at the boundary between
//! deciding and applying; violating it is a bug in the step chain, not a
//! runtime condition, hence the panic.

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::Secret;

use crate::crd::{CertificateSigningRequestApproval, SessionStatus};

/// A Kubernetes Event to publish alongside the pass outcome.
///
/// All events publish as Normal; failures surface through conditions, not
/// the event type.
#[derive(Clone, Debug)]
pub struct EventInfo {
    /// Machine-readable reason (see [`crate::events::reasons`])
    pub reason: &'static str,
    /// Action label (see [`crate::events::actions`])
    pub action: &'static str,
    /// Human-readable note
    pub note: String,
}

/// The mutations a reconcile pass wants applied.
///
/// At most one of the primary actions may be set; the optional event rides
/// along with whichever action produced it.
#[derive(Debug, Default)]
pub struct Actions {
    /// Server-side apply of the Session status subresource
    pub status: Option<SessionStatus>,

    /// Server-side apply of the credential secret (session namespace)
    pub secret: Option<Secret>,

    /// Server-side apply of the CSR on the management cluster
    pub csr: Option<CertificateSigningRequest>,

    /// Delete the session's CSR on the management cluster
    pub delete_csr: bool,

    /// Server-side apply of the CSR approval on the management cluster
    pub csr_approval: Option<CertificateSigningRequestApproval>,

    /// Delete the Session itself (expiration)
    pub delete_session: bool,

    /// Event to publish after the action is applied
    pub event: Option<EventInfo>,
}

impl Actions {
    /// A status-only update.
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// A credential secret apply.
    pub fn secret(secret: Secret) -> Self {
        Self {
            secret: Some(secret),
            ..Default::default()
        }
    }

    /// A CSR apply on the management cluster.
    pub fn csr(csr: CertificateSigningRequest) -> Self {
        Self {
            csr: Some(csr),
            ..Default::default()
        }
    }

    /// Deletion of the session's CSR on the management cluster.
    pub fn delete_csr() -> Self {
        Self {
            delete_csr: true,
            ..Default::default()
        }
    }

    /// A CSR approval apply on the management cluster.
    pub fn csr_approval(approval: CertificateSigningRequestApproval) -> Self {
        Self {
            csr_approval: Some(approval),
            ..Default::default()
        }
    }

    /// Deletion of the Session.
    pub fn delete_session() -> Self {
        Self {
            delete_session: true,
            ..Default::default()
        }
    }

    /// Attach an event to this action set.
    pub fn with_event(mut self, reason: &'static str, action: &'static str, note: String) -> Self {
        self.event = Some(EventInfo {
            reason,
            action,
            note,
        });
        self
    }

    /// Number of primary actions set.
    fn primary_count(&self) -> usize {
        usize::from(self.status.is_some())
            + usize::from(self.secret.is_some())
            + usize::from(self.csr.is_some())
            + usize::from(self.delete_csr)
            + usize::from(self.csr_approval.is_some())
            + usize::from(self.delete_session)
    }

    /// Panics if more than one primary action is set.
    ///
    /// A multi-action set means a step combined writes that must be separate
    /// passes; this is a programming error, not an input condition.
    pub fn validate(&self) {
        let count = self.primary_count();
        assert!(
            count <= 1,
            "reconcile pass produced {count} primary actions, expected at most one: {self:?}"
        );
    }
}

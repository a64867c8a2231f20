//! Custom Resource Definitions for the breakglass operator
//!
//! [`Session`] is owned by this operator. The hypershift types are foreign
//! resources read (and in the approval case, written) on management clusters.

mod hypershift;
mod session;

pub use hypershift::{
    CertificateSigningRequestApproval, CertificateSigningRequestApprovalSpec, HcpCondition,
    HostedControlPlane, HostedControlPlaneSpec, HostedControlPlaneStatus,
};
pub use session::{
    AccessLevel, Condition, ConditionStatus, HostedControlPlaneRef, ManagementClusterRef, Owner,
    Session, SessionPhase, SessionSpec, SessionStatus,
};

/// Well-known Session condition types.
pub mod condition_types {
    /// The targeted HostedControlPlane exists and reports Available
    pub const HOSTED_CONTROL_PLANE_AVAILABLE: &str = "HostedControlPlaneAvailable";
    /// The credential secret holds a signed client certificate
    pub const CREDENTIALS_AVAILABLE: &str = "CredentialsAvailable";
    /// A network path to the backing API server has been established
    pub const NETWORK_PATH_AVAILABLE: &str = "NetworkPathAvailable";
    /// The session is fully provisioned
    pub const READY: &str = "Ready";
}

/// Well-known Session condition reasons.
pub mod condition_reasons {
    /// Catch-all for a session that has not reached Ready yet
    pub const NOT_READY: &str = "NotReady";
    /// The HostedControlPlane is available
    pub const HOSTED_CONTROL_PLANE_AVAILABLE: &str = "HostedControlPlaneAvailable";
    /// No HostedControlPlane exists in the referenced namespace
    pub const HOSTED_CONTROL_PLANE_NOT_FOUND: &str = "HostedControlPlaneNotFound";
    /// The HostedControlPlane could not be read
    pub const HOSTED_CONTROL_PLANE_ACCESS_ERROR: &str = "HostedControlPlaneAccessError";
    /// The HostedControlPlane exists but does not report Available
    pub const HOSTED_CONTROL_PLANE_NOT_READY: &str = "HostedControlPlaneNotReady";
    /// The signed certificate is stored in the credential secret
    pub const CREDENTIALS_AVAILABLE: &str = "CredentialsAvailable";
    /// The credential secret could not be read
    pub const CREDENTIALS_SECRET_ACCESS_ERROR: &str = "CredentialsSecretAccessError";
    /// The CSR could not be read from the management cluster
    pub const CSR_ACCESS_ERROR: &str = "CertificateSigningRequestAccessError";
    /// The CSR exists and is waiting for approval
    pub const CSR_PENDING: &str = "CertificateSigningRequestPending";
    /// The CSR request body could not be built
    pub const CSR_CREATION_FAILED: &str = "CertificateSigningRequestCreationFailed";
    /// A private key exists but no CSR has been created yet
    pub const PRIVATE_KEY_CREATED: &str = "PrivateKeyCreated";
    /// Key generation failed
    pub const PRIVATE_KEY_GENERATION_FAILED: &str = "PrivateKeyGenerationFailed";
    /// A network path to the backing API server exists
    pub const NETWORK_PATH_AVAILABLE: &str = "NetworkPathAvailable";
    /// The session is ready for use
    pub const SESSION_READY: &str = "SessionReady";
}

//! Error types for the breakglass operator

use thiserror::Error;

use crate::pki::PkiError;

/// Main error type for breakglass operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// PKI error (key handling, CSR building)
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Management cluster provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Severity of an error encountered while talking to a cluster.
///
/// Each severity produces different controller behavior:
///
/// - `Transient`: return the error for a rate-limited requeue, without
///   touching status. Brief outages must not flip Ready conditions.
/// - `Permanent`: record the failure in a status condition and stop; a retry
///   will not help, the watch relist picks up a future fix.
/// - `Retryable`: record the condition and also return the error, producing
///   both a watch-driven wake and a backoff-driven retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Timeouts, service-unavailable, too-many-requests
    Transient,
    /// Not-found for must-exist objects, forbidden, unauthorized
    Permanent,
    /// Everything else
    Retryable,
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a synthetic not-found API error for the given resource.
    ///
    /// Used where a read surfaces as a list with zero results but callers
    /// need regular not-found semantics.
    pub fn not_found(resource: &str, name: &str) -> Self {
        Self::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{resource} \"{name}\" not found"),
            reason: "NotFound".to_string(),
            code: 404,
        }))
    }

    /// Returns true if this wraps a 404 from the API server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Classify this error into the three-way severity taxonomy.
    ///
    /// Classification is by HTTP status code for API errors; anything that is
    /// not an API error (PKI failures, serialization) is retryable.
    pub fn severity(&self) -> Severity {
        match self {
            Error::Kube(kube::Error::Api(ae)) => match ae.code {
                408 | 429 | 503 | 504 => Severity::Transient,
                401 | 403 | 404 => Severity::Permanent,
                _ => Severity::Retryable,
            },
            _ => Severity::Retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn timeouts_and_throttling_are_transient() {
        for code in [408, 429, 503, 504] {
            assert_eq!(
                api_error(code).severity(),
                Severity::Transient,
                "code {code}"
            );
        }
    }

    #[test]
    fn access_and_not_found_are_permanent() {
        for code in [401, 403, 404] {
            assert_eq!(
                api_error(code).severity(),
                Severity::Permanent,
                "code {code}"
            );
        }
    }

    #[test]
    fn everything_else_is_retryable() {
        for code in [409, 422, 500, 502] {
            assert_eq!(
                api_error(code).severity(),
                Severity::Retryable,
                "code {code}"
            );
        }
        assert_eq!(
            Error::validation("bad spec").severity(),
            Severity::Retryable
        );
        assert_eq!(
            Error::provider("kubeconfig secret missing").severity(),
            Severity::Retryable
        );
    }

    #[test]
    fn synthetic_not_found_roundtrips() {
        let err = Error::not_found("hostedcontrolplanes", "clusters-test-hcp");
        assert!(err.is_not_found());
        assert_eq!(err.severity(), Severity::Permanent);
        assert!(err.to_string().contains("clusters-test-hcp"));
    }

    #[test]
    fn error_construction_accepts_str_and_string() {
        let err = Error::validation(format!("session {} has no TTL", "demo"));
        assert!(err.to_string().contains("demo"));
        let err = Error::serialization("bad yaml");
        assert!(err.to_string().contains("serialization error"));
    }
}

//! Session endpoint derivation
//!
//! The endpoint is the externally reachable URL users point kubectl at. It is
//! a pure function of the operator's ingress base URL and the session
//! identity; the proxy serving it is deployed separately.

#[cfg(test)]
use mockall::automock;

/// Derives the externally reachable endpoint for a session.
#[cfg_attr(test, automock)]
pub trait EndpointProvider: Send + Sync {
    /// Endpoint URL for the session in `namespace` with `name`.
    fn session_endpoint(&self, namespace: &str, name: &str) -> String;
}

/// Endpoint provider backed by the operator's ingress base URL.
pub struct IngressEndpointProvider {
    base_url: String,
}

impl IngressEndpointProvider {
    /// Create a provider from the configured base URL. A trailing slash on
    /// the base is tolerated.
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url }
    }
}

impl EndpointProvider for IngressEndpointProvider {
    fn session_endpoint(&self, namespace: &str, name: &str) -> String {
        format!("{}/sessions/{namespace}/{name}/kas", self.base_url)
    }
}

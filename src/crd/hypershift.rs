//! Foreign hypershift resource types read on management clusters
//!
//! Only the fields the operator consumes are modeled; unknown fields are
//! dropped on deserialization. These CRDs are installed by hypershift on the
//! management clusters, never by this operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Spec subset of a hypershift HostedControlPlane
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hypershift.openshift.io",
    version = "v1beta1",
    kind = "HostedControlPlane",
    plural = "hostedcontrolplanes",
    namespaced,
    status = "HostedControlPlaneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HostedControlPlaneSpec {
    /// DNS name of the hosted cluster's API server
    #[serde(default, rename = "kubeAPIServerDNSName")]
    pub kube_api_server_dns_name: String,
}

/// Status subset of a HostedControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostedControlPlaneStatus {
    /// Standard conditions; the operator only looks at `Available`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HcpCondition>,
}

/// Condition on a HostedControlPlane (metav1.Condition shape)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HcpCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status ("True", "False", "Unknown")
    pub status: String,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

impl HostedControlPlane {
    /// Returns true if the `Available` condition exists with status True.
    pub fn is_available(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Available" && c.status == "True")
    }
}

/// Hypershift CSR approval object.
///
/// Presence authorizes the hypershift CSR approver to approve the CSR of the
/// same name; the content never matters.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certificates.hypershift.openshift.io",
    version = "v1alpha1",
    kind = "CertificateSigningRequestApproval",
    plural = "certificatesigningrequestapprovals",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSigningRequestApprovalSpec {}

#[cfg(test)]
mod tests {
    use super::*;

    fn hcp_with_condition(type_: &str, status: &str) -> HostedControlPlane {
        let mut hcp = HostedControlPlane::new("test-hcp", HostedControlPlaneSpec::default());
        hcp.status = Some(HostedControlPlaneStatus {
            conditions: vec![HcpCondition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: String::new(),
                message: String::new(),
            }],
        });
        hcp
    }

    #[test]
    fn available_requires_true_status() {
        assert!(hcp_with_condition("Available", "True").is_available());
        assert!(!hcp_with_condition("Available", "False").is_available());
        assert!(!hcp_with_condition("Available", "Unknown").is_available());
        assert!(!hcp_with_condition("Degraded", "True").is_available());
    }

    #[test]
    fn missing_status_is_not_available() {
        let hcp = HostedControlPlane::new("bare", HostedControlPlaneSpec::default());
        assert!(!hcp.is_available());
    }

    #[test]
    fn unknown_fields_are_tolerated() {
        // Hypershift objects carry far more fields than this operator models.
        let yaml = r#"
apiVersion: hypershift.openshift.io/v1beta1
kind: HostedControlPlane
metadata:
  name: test-hcp
  namespace: clusters-test-hcp
spec:
  kubeAPIServerDNSName: api.test-hcp.example.com
  infraID: abc123
status:
  conditions:
    - type: Available
      status: "True"
      reason: AsExpected
      message: ""
  version: 4.17.0
"#;
        let hcp: HostedControlPlane = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(hcp.spec.kube_api_server_dns_name, "api.test-hcp.example.com");
        assert!(hcp.is_available());
    }
}

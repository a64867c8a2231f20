//! Builders for the Kubernetes objects the session controller applies
//!
//! Every object is built in full on every pass and server-side applied with
//! force, so the builders here define the complete owned shape of each
//! resource. Secrets live in the session namespace; CSRs are cluster-scoped
//! on the management cluster; approvals are namespaced in the
//! HostedControlPlane namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};

use crate::crd::{CertificateSigningRequestApproval, CertificateSigningRequestApprovalSpec, Session};
use crate::pki::csr;
use crate::{
    ANNOTATION_SESSION, FIELD_MANAGER, LABEL_CREDENTIAL_TYPE, LABEL_CREDENTIAL_TYPE_VALUE,
    LABEL_MANAGED_BY, MIN_CSR_EXPIRATION_SECONDS, SECRET_KEY_CERTIFICATE, SECRET_KEY_PRIVATE_KEY,
};

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_MANAGED_BY.to_string(), FIELD_MANAGER.to_string())])
}

fn session_annotation(session: &Session) -> BTreeMap<String, String> {
    BTreeMap::from([(
        ANNOTATION_SESSION.to_string(),
        format!("{}/{}", session.namespace().unwrap_or_default(), session.name_any()),
    )])
}

/// Build the credential secret holding the private key and, once signed, the
/// client certificate.
///
/// The Session owns the secret via an owner reference: deleting the Session
/// garbage-collects the credentials, and secret changes wake the owning
/// Session through the controller's `owns` watch.
pub fn build_credential_secret(
    session: &Session,
    private_key_pem: &str,
    certificate_pem: Option<&[u8]>,
) -> Secret {
    let mut data = BTreeMap::from([(
        SECRET_KEY_PRIVATE_KEY.to_string(),
        ByteString(private_key_pem.as_bytes().to_vec()),
    )]);
    if let Some(cert) = certificate_pem {
        data.insert(
            SECRET_KEY_CERTIFICATE.to_string(),
            ByteString(cert.to_vec()),
        );
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(session.credential_name()),
            namespace: session.namespace(),
            labels: Some(managed_labels()),
            annotations: Some(session_annotation(session)),
            owner_references: session.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    }
}

/// Build the CertificateSigningRequest applied on the management cluster.
///
/// The signer name is namespace-scoped so the hypershift CSR controller in
/// the targeted HostedControlPlane namespace picks it up. Certificate
/// lifetime tracks the session TTL but never goes below the platform floor.
pub fn build_csr(session: &Session, request_pem: &str) -> CertificateSigningRequest {
    let ttl = session.spec.ttl_seconds;
    let expiration_seconds =
        i32::try_from(ttl).unwrap_or(i32::MAX).max(MIN_CSR_EXPIRATION_SECONDS);

    CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(session.credential_name()),
            labels: Some(managed_labels()),
            annotations: Some(session_annotation(session)),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(request_pem.as_bytes().to_vec()),
            signer_name: csr::signer_name(&session.spec.hosted_control_plane.namespace),
            expiration_seconds: Some(expiration_seconds),
            usages: Some(vec![
                "digital signature".to_string(),
                "client auth".to_string(),
            ]),
            ..Default::default()
        },
        status: None,
    }
}

/// Build the CSR approval applied on the management cluster.
///
/// Same name as the CSR, in the HostedControlPlane namespace. Its presence
/// authorizes the hypershift CSR approver to approve the CSR.
pub fn build_csr_approval(session: &Session) -> CertificateSigningRequestApproval {
    let mut approval = CertificateSigningRequestApproval::new(
        &session.credential_name(),
        CertificateSigningRequestApprovalSpec::default(),
    );
    approval.metadata.namespace = Some(session.spec.hosted_control_plane.namespace.clone());
    let mut labels = managed_labels();
    labels.insert(
        LABEL_CREDENTIAL_TYPE.to_string(),
        LABEL_CREDENTIAL_TYPE_VALUE.to_string(),
    );
    approval.metadata.labels = Some(labels);
    approval.metadata.annotations = Some(session_annotation(session));
    approval
}

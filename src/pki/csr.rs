//! CSR building and validation for break-glass credentials
//!
//! The request body is deterministic for a given key and subject: PKCS#1 v1.5
//! signatures carry no randomness, so rebuilding the same CSR yields the same
//! bytes. Validation is strict the other way around: any CSR on the
//! management cluster that does not match the stored key and expected subject
//! is treated as corrupt and deleted, never trusted.

use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use rsa::RsaPrivateKey;
use tracing::warn;
use x509_parser::prelude::{FromDer, X509CertificationRequest};

use super::{private_key_pkcs8_pem, public_key_matches, PkiError, Result};

/// Returns the signer name for break-glass CSRs in the given HCP namespace.
///
/// Must match the signer the hypershift CSR approver acts on.
pub fn signer_name(hcp_namespace: &str) -> String {
    format!("hypershift.openshift.io/{hcp_namespace}.sre-break-glass")
}

/// Certificate Common Name for a session owner.
pub fn common_name(user: &str) -> String {
    format!("system:sre-break-glass:{user}")
}

/// Build a PEM-encoded certificate request with the session subject, signed
/// by the session private key.
pub fn build_request_pem(key: &RsaPrivateKey, user: &str, organization: &str) -> Result<String> {
    let pkcs8 = private_key_pkcs8_pem(key)?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8, &rcgen::PKCS_RSA_SHA256)
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to load key pair: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name(user)));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to build request: {e}")))?;
    csr.pem()
        .map_err(|e| PkiError::CsrGenerationFailed(format!("failed to serialize request: {e}")))
}

/// Validate a PEM-encoded certificate request against the stored private key
/// and the expected subject.
///
/// Returns false instead of an error: an invalid CSR is corrupt, not erroring;
/// the caller deletes it and lets the next pass regenerate.
pub fn validate_request(
    request_pem: &[u8],
    key: &RsaPrivateKey,
    user: &str,
    organization: &str,
) -> bool {
    let block = match ::pem::parse(request_pem) {
        Ok(block) => block,
        Err(e) => {
            warn!(error = %e, "CSR is not valid PEM");
            return false;
        }
    };
    if block.tag() != "CERTIFICATE REQUEST" {
        warn!(tag = block.tag(), "CSR PEM block has unexpected tag");
        return false;
    }

    let (_, csr) = match X509CertificationRequest::from_der(block.contents()) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "failed to parse certificate request");
            return false;
        }
    };

    if let Err(e) = csr.verify_signature() {
        warn!(error = %e, "CSR signature verification failed");
        return false;
    }

    let info = &csr.certification_request_info;
    if !public_key_matches(key, &info.subject_pki.subject_public_key.data) {
        warn!("CSR public key does not match session private key");
        return false;
    }

    let expected_cn = common_name(user);
    let cn = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok());
    if cn != Some(expected_cn.as_str()) {
        warn!(expected = %expected_cn, actual = ?cn, "CSR common name mismatch");
        return false;
    }

    let orgs: Vec<&str> = info
        .subject
        .iter_organization()
        .filter_map(|attr| attr.as_str().ok())
        .collect();
    if orgs != [organization] {
        warn!(expected = %organization, actual = ?orgs, "CSR organization mismatch");
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::test_keys;

    const USER: &str = "user@example.com";
    const GROUP: &str = "break-glass";

    #[test]
    fn signer_name_is_pure_function_of_namespace() {
        assert_eq!(
            signer_name("clusters-test-hcp"),
            "hypershift.openshift.io/clusters-test-hcp.sre-break-glass"
        );
        assert_eq!(
            signer_name("other"),
            "hypershift.openshift.io/other.sre-break-glass"
        );
    }

    #[test]
    fn common_name_embeds_user() {
        assert_eq!(
            common_name("user@example.com"),
            "system:sre-break-glass:user@example.com"
        );
    }

    #[test]
    fn request_bytes_are_deterministic() {
        let key = test_keys::key_a();
        let first = build_request_pem(key, USER, GROUP).expect("builds");
        let second = build_request_pem(key, USER, GROUP).expect("builds");
        assert_eq!(first, second);
        assert!(first.contains("BEGIN CERTIFICATE REQUEST"));
    }

    #[test]
    fn built_request_validates() {
        let key = test_keys::key_a();
        let pem = build_request_pem(key, USER, GROUP).expect("builds");
        assert!(validate_request(pem.as_bytes(), key, USER, GROUP));
    }

    #[test]
    fn swapped_key_is_rejected() {
        let pem = build_request_pem(test_keys::key_a(), USER, GROUP).expect("builds");
        assert!(!validate_request(
            pem.as_bytes(),
            test_keys::key_b(),
            USER,
            GROUP
        ));
    }

    #[test]
    fn subject_mismatch_is_rejected() {
        let key = test_keys::key_a();
        let pem = build_request_pem(key, USER, GROUP).expect("builds");
        assert!(!validate_request(
            pem.as_bytes(),
            key,
            "someone-else@example.com",
            GROUP
        ));
        assert!(!validate_request(pem.as_bytes(), key, USER, "other-group"));
    }

    #[test]
    fn garbage_is_rejected_without_error() {
        let key = test_keys::key_a();
        assert!(!validate_request(b"not a csr", key, USER, GROUP));
        assert!(!validate_request(
            b"-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----",
            key,
            USER,
            GROUP
        ));
    }
}

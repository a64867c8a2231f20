//! Credential issuance sub-machine
//!
//! Walks the session from nothing to a signed client certificate in the
//! credential secret, one action per pass:
//!
//! 1. record the credential secret name in status
//! 2. generate the private key into the secret
//! 3. create the CSR on the management cluster (recording the
//!    `PrivateKeyCreated` condition on the pass before)
//! 4. create the approval, then wait for the signer
//! 5. copy the signed certificate back into the secret
//!
//! The current stage is re-derived from the secret and the CSR on every pass;
//! a CSR that does not match the stored key is deleted and regenerated rather
//! than trusted.

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::ResourceExt;
use rsa::RsaPrivateKey;

use crate::controller::actions::Actions;
use crate::controller::resources;
use crate::controller::status::StatusBuilder;
use crate::crd::{condition_reasons, condition_types, ConditionStatus};
use crate::events::{actions, reasons};
use crate::pki::{self, csr};
use crate::{Result, SECRET_KEY_CERTIFICATE, SECRET_KEY_PRIVATE_KEY};

use super::{classified_outcome, ErrorConditions, StepInput, StepOutcome};

fn csr_is_approved(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Approved" && c.status == "True")
        })
}

fn csr_certificate(csr: &CertificateSigningRequest) -> Option<&[u8]> {
    csr.status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .map(|c| c.0.as_slice())
        .filter(|c| !c.is_empty())
}

pub(super) async fn generate_credentials(input: &StepInput<'_>) -> Result<StepOutcome> {
    let session = input.session;
    let namespace = session.namespace().unwrap_or_default();
    let credential_name = session.credential_name();

    let secret = match input.secrets.get_secret(&namespace, &credential_name).await {
        Ok(secret) => secret,
        Err(err) => {
            return classified_outcome(
                session,
                input.now,
                err,
                &ErrorConditions {
                    condition_type: condition_types::CREDENTIALS_AVAILABLE,
                    not_found: (
                        condition_reasons::CREDENTIALS_SECRET_ACCESS_ERROR,
                        "Credentials secret not found",
                    ),
                    access_denied: (
                        condition_reasons::CREDENTIALS_SECRET_ACCESS_ERROR,
                        "Access denied to credentials secret",
                    ),
                    retryable: (
                        condition_reasons::CREDENTIALS_SECRET_ACCESS_ERROR,
                        "Unable to read credentials secret",
                    ),
                },
            );
        }
    };

    let secret_data =
        |key: &str| secret.as_ref().and_then(|s| s.data.as_ref()).and_then(|d| d.get(key));

    // Signed certificate already stored: credential issuance is complete.
    if secret_data(SECRET_KEY_CERTIFICATE).is_some() {
        return match StatusBuilder::new(session, input.now)
            .with_condition(
                condition_types::CREDENTIALS_AVAILABLE,
                ConditionStatus::True,
                condition_reasons::CREDENTIALS_AVAILABLE,
                "Credentials available",
            )
            .build()
        {
            Some(status) => Ok(StepOutcome::Done(Actions::status(status))),
            None => Ok(StepOutcome::Continue),
        };
    }

    // Stored private key, kept as (pem, parsed) so the PEM can be written
    // back verbatim when the certificate lands. An unparseable key is
    // treated as absent and regenerated.
    let key: Option<(String, RsaPrivateKey)> = secret_data(SECRET_KEY_PRIVATE_KEY)
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
        .and_then(|pem| {
            pki::decode_private_key_pem(&pem)
                .ok()
                .map(|parsed| (pem, parsed))
        });

    let existing_csr = match input.querier.get_csr(&credential_name).await {
        Ok(csr) => csr,
        Err(err) => {
            return classified_outcome(
                session,
                input.now,
                err,
                &ErrorConditions {
                    condition_type: condition_types::CREDENTIALS_AVAILABLE,
                    not_found: (
                        condition_reasons::CSR_ACCESS_ERROR,
                        "CertificateSigningRequest not found on management cluster",
                    ),
                    access_denied: (
                        condition_reasons::CSR_ACCESS_ERROR,
                        "Access denied to CertificateSigningRequest",
                    ),
                    retryable: (
                        condition_reasons::CSR_ACCESS_ERROR,
                        "Unable to read CertificateSigningRequest on management cluster",
                    ),
                },
            );
        }
    };

    if let Some(remote_csr) = existing_csr {
        return handle_existing_csr(input, &remote_csr, key.as_ref(), &credential_name).await;
    }

    if let Some((_, parsed_key)) = key.as_ref() {
        return create_csr(input, parsed_key, &credential_name);
    }

    let has_secret_ref = session
        .status
        .as_ref()
        .and_then(|s| s.credentials_secret_ref.as_deref())
        .is_some();
    if has_secret_ref {
        return generate_key(input, &credential_name);
    }

    // First credential pass: publish the secret name before anything is
    // created, so operators can find the secret even mid issuance.
    let status = StatusBuilder::new(session, input.now)
        .with_credentials_secret_ref(&credential_name)
        .build();
    Ok(StepOutcome::Done(
        status.map(Actions::status).unwrap_or_default(),
    ))
}

async fn handle_existing_csr(
    input: &StepInput<'_>,
    remote_csr: &CertificateSigningRequest,
    key: Option<&(String, RsaPrivateKey)>,
    credential_name: &str,
) -> Result<StepOutcome> {
    let session = input.session;

    let valid = key.is_some_and(|(_, parsed)| {
        csr::validate_request(
            &remote_csr.spec.request.0,
            parsed,
            &session.spec.owner.name,
            &session.spec.access_level.group,
        )
    });
    if !valid {
        let note = format!(
            "CertificateSigningRequest {credential_name} does not match the session key, deleting."
        );
        return Ok(StepOutcome::Done(Actions::delete_csr().with_event(
            reasons::CSR_INVALID,
            actions::ISSUE_CREDENTIALS,
            note,
        )));
    }

    // `valid` implies the key is present.
    if let (Some(cert), Some((key_pem, _))) = (csr_certificate(remote_csr), key) {
        let secret = resources::build_credential_secret(session, key_pem, Some(cert));
        return Ok(StepOutcome::Done(Actions::secret(secret)));
    }

    if csr_is_approved(remote_csr) {
        // Approved but not signed yet; the signer's write arrives as a watch
        // event on the CSR.
        return Ok(StepOutcome::Done(Actions::default()));
    }

    if let Some(status) = StatusBuilder::new(session, input.now)
        .with_condition(
            condition_types::CREDENTIALS_AVAILABLE,
            ConditionStatus::False,
            condition_reasons::CSR_PENDING,
            "CertificateSigningRequest is pending approval",
        )
        .not_ready()
        .build()
    {
        return Ok(StepOutcome::Done(Actions::status(status)));
    }

    let approval = match input
        .querier
        .get_csr_approval(&session.spec.hosted_control_plane.namespace, credential_name)
        .await
    {
        Ok(approval) => approval,
        Err(err) => {
            return classified_outcome(
                session,
                input.now,
                err,
                &ErrorConditions {
                    condition_type: condition_types::CREDENTIALS_AVAILABLE,
                    not_found: (
                        condition_reasons::CSR_ACCESS_ERROR,
                        "CertificateSigningRequestApproval not found",
                    ),
                    access_denied: (
                        condition_reasons::CSR_ACCESS_ERROR,
                        "Access denied to CertificateSigningRequestApproval",
                    ),
                    retryable: (
                        condition_reasons::CSR_ACCESS_ERROR,
                        "Unable to read CertificateSigningRequestApproval on management cluster",
                    ),
                },
            );
        }
    };

    match approval {
        // Approval exists; waiting on the approver and signer.
        Some(_) => Ok(StepOutcome::Done(Actions::default())),
        None => Ok(StepOutcome::Done(Actions::csr_approval(
            resources::build_csr_approval(session),
        ))),
    }
}

fn create_csr(
    input: &StepInput<'_>,
    key: &RsaPrivateKey,
    credential_name: &str,
) -> Result<StepOutcome> {
    let session = input.session;

    // Record that the key exists before creating the CSR, so a crash between
    // the two writes leaves an accurate trail. Ready stays False for pollers
    // throughout issuance.
    if let Some(status) = StatusBuilder::new(session, input.now)
        .with_condition(
            condition_types::CREDENTIALS_AVAILABLE,
            ConditionStatus::False,
            condition_reasons::PRIVATE_KEY_CREATED,
            "Private key created, certificate request pending",
        )
        .not_ready()
        .build()
    {
        return Ok(StepOutcome::Done(Actions::status(status)));
    }

    let request_pem = match csr::build_request_pem(
        key,
        &session.spec.owner.name,
        &session.spec.access_level.group,
    ) {
        Ok(pem) => pem,
        Err(err) => {
            // Building the request is deterministic over the stored key and
            // spec; a failure will not resolve on retry.
            tracing::error!(error = %err, session = %session.name_any(), "failed to build certificate request");
            let status = StatusBuilder::new(session, input.now)
                .with_condition(
                    condition_types::CREDENTIALS_AVAILABLE,
                    ConditionStatus::False,
                    condition_reasons::CSR_CREATION_FAILED,
                    "Failed to build certificate signing request",
                )
                .not_ready()
                .build();
            return Ok(StepOutcome::Done(
                status.map(Actions::status).unwrap_or_default(),
            ));
        }
    };

    let note = format!("Creating certificate signing request {credential_name}.");
    Ok(StepOutcome::Done(
        Actions::csr(resources::build_csr(session, &request_pem)).with_event(
            reasons::CSR_GENERATION,
            actions::ISSUE_CREDENTIALS,
            note,
        ),
    ))
}

fn generate_key(input: &StepInput<'_>, credential_name: &str) -> Result<StepOutcome> {
    let session = input.session;

    let key_pem = pki::generate_private_key().and_then(|key| pki::encode_private_key_pem(&key));
    match key_pem {
        Ok(pem) => {
            let note = format!("Generating private key into secret {credential_name}.");
            Ok(StepOutcome::Done(
                Actions::secret(resources::build_credential_secret(session, &pem, None))
                    .with_event(reasons::PRIVATE_KEY_GENERATION, actions::ISSUE_CREDENTIALS, note),
            ))
        }
        Err(err) => classified_outcome(
            session,
            input.now,
            err.into(),
            &ErrorConditions {
                condition_type: condition_types::CREDENTIALS_AVAILABLE,
                not_found: (
                    condition_reasons::PRIVATE_KEY_GENERATION_FAILED,
                    "Failed to generate private key",
                ),
                access_denied: (
                    condition_reasons::PRIVATE_KEY_GENERATION_FAILED,
                    "Failed to generate private key",
                ),
                retryable: (
                    condition_reasons::PRIVATE_KEY_GENERATION_FAILED,
                    "Failed to generate private key",
                ),
            },
        ),
    }
}

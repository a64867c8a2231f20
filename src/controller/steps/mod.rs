//! Ordered reconciliation steps for Sessions
//!
//! A pass runs the steps in a fixed order; the first step that produces an
//! outcome ends the pass. Steps never write to the clusters themselves: they
//! return the single action the pass should apply, and the controller applies
//! it. Everything is re-derived from the Session status on the next pass, so
//! no in-memory state survives between passes.
//!
//! Error discipline, by severity:
//! - Transient (timeouts, throttling, unavailability): propagated as `Err`,
//!   no status change; the controller's error policy requeues.
//! - Permanent (not found, access denied): recorded as a False condition plus
//!   `Ready=False`; the pass ends without a requeue. Only an external change
//!   (a watch event) revives the session.
//! - Retryable (everything else): recorded as a condition when that changes
//!   the status, otherwise propagated as `Err` so the requeue backoff drives
//!   another attempt.

use chrono::{DateTime, Utc};

use crate::crd::{ConditionStatus, Session};
use crate::endpoints::EndpointProvider;
use crate::error::Severity;
use crate::mc::ManagementClusterQuerier;
use crate::{Error, Result};

use super::actions::Actions;
use super::status::StatusBuilder;
use super::SecretReader;

mod control_plane;
mod credentials;
mod expiration;
mod finalize;
mod network_path;

/// Result of one step.
#[derive(Debug)]
pub enum StepOutcome {
    /// Step has nothing to do; run the next step in this pass.
    Continue,
    /// Step decided the pass. An empty action set means "wait for a watch
    /// event", e.g. an approved CSR that has not been signed yet.
    Done(Actions),
}

/// Everything a step may consult. Steps treat all of it as read-only.
pub struct StepInput<'a> {
    /// The Session under reconciliation
    pub session: &'a Session,
    /// Wall clock for this pass; fixed once so all timestamps in one pass agree
    pub now: DateTime<Utc>,
    /// Querier against the session's management cluster
    pub querier: &'a dyn ManagementClusterQuerier,
    /// Reader for secrets in the session namespace
    pub secrets: &'a dyn SecretReader,
    /// Endpoint derivation
    pub endpoints: &'a dyn EndpointProvider,
}

/// Condition content to record per error severity at one call site.
struct ErrorConditions<'a> {
    condition_type: &'a str,
    /// Reason and message when the referenced object does not exist
    not_found: (&'a str, &'a str),
    /// Reason and message on 401/403
    access_denied: (&'a str, &'a str),
    /// Reason and message for retryable failures
    retryable: (&'a str, &'a str),
}

/// Map a classified error to a step outcome per the severity discipline.
fn classified_outcome(
    session: &Session,
    now: DateTime<Utc>,
    err: Error,
    conditions: &ErrorConditions<'_>,
) -> Result<StepOutcome> {
    match err.severity() {
        Severity::Transient => Err(err),
        Severity::Permanent => {
            let (reason, message) = if err.is_not_found() {
                conditions.not_found
            } else {
                conditions.access_denied
            };
            let status = StatusBuilder::new(session, now)
                .with_condition(
                    conditions.condition_type,
                    ConditionStatus::False,
                    reason,
                    message,
                )
                .not_ready()
                .build();
            // No requeue either way: permanent errors only resolve through an
            // external change, which arrives as a watch event.
            Ok(StepOutcome::Done(
                status.map(Actions::status).unwrap_or_default(),
            ))
        }
        Severity::Retryable => {
            let (reason, message) = conditions.retryable;
            let status = StatusBuilder::new(session, now)
                .with_condition(
                    conditions.condition_type,
                    ConditionStatus::False,
                    reason,
                    message,
                )
                .not_ready()
                .build();
            match status {
                Some(status) => Ok(StepOutcome::Done(Actions::status(status))),
                None => Err(err),
            }
        }
    }
}

/// Run the step chain for one pass and return the single action set to apply.
pub async fn process_session(input: &StepInput<'_>) -> Result<Actions> {
    if let StepOutcome::Done(actions) = expiration::handle_expiration(input)? {
        actions.validate();
        return Ok(actions);
    }
    if let StepOutcome::Done(actions) = control_plane::verify_control_plane_ready(input).await? {
        actions.validate();
        return Ok(actions);
    }
    if let StepOutcome::Done(actions) = credentials::generate_credentials(input).await? {
        actions.validate();
        return Ok(actions);
    }
    if let StepOutcome::Done(actions) = network_path::ensure_network_path(input).await? {
        actions.validate();
        return Ok(actions);
    }
    if let StepOutcome::Done(actions) = finalize::finalize_session(input)? {
        actions.validate();
        return Ok(actions);
    }
    Ok(Actions::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testutil::{fixed_time, ready_session, sample_session};
    use crate::controller::MockSecretReader;
    use crate::endpoints::MockEndpointProvider;
    use crate::mc::MockManagementClusterQuerier;

    fn idle_mocks() -> (
        MockManagementClusterQuerier,
        MockSecretReader,
        MockEndpointProvider,
    ) {
        (
            MockManagementClusterQuerier::new(),
            MockSecretReader::new(),
            MockEndpointProvider::new(),
        )
    }

    #[tokio::test]
    async fn first_pass_persists_expiry_without_touching_remote_cluster() {
        // Mocks have no expectations: any remote call would panic the test.
        let (querier, secrets, endpoints) = idle_mocks();
        let session = sample_session();
        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        let actions = process_session(&input).await.expect("pass succeeds");
        let status = actions.status.expect("status update");
        assert!(status.expires_at.is_some());
        assert!(!actions.delete_session);
    }

    #[tokio::test]
    async fn fully_ready_session_is_a_no_op_pass() {
        let (mut querier, mut secrets, mut endpoints) = idle_mocks();
        let session = ready_session();

        // The chain still consults the control plane, the secret, and the
        // endpoint, but nothing changes, so no action comes out.
        querier
            .expect_get_hosted_control_plane()
            .returning(|_| Ok(crate::controller::testutil::available_hcp()));
        secrets.expect_get_secret().returning(|_, _| {
            Ok(Some(crate::controller::testutil::credential_secret(
                true,
            )))
        });
        endpoints
            .expect_session_endpoint()
            .returning(|ns, name| format!("https://breakglass.example.com/sessions/{ns}/{name}/kas"));

        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        let actions = process_session(&input).await.expect("pass succeeds");
        assert!(actions.status.is_none());
        assert!(actions.secret.is_none());
        assert!(actions.csr.is_none());
        assert!(!actions.delete_session);
    }
}

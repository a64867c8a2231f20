//! Backend network path discovery
//!
//! Resolves the URL of the backing Kubernetes API server from the
//! HostedControlPlane's public DNS name. Once `backendKASURL` is persisted
//! the step never runs the lookup again.

use crate::controller::actions::Actions;
use crate::controller::status::StatusBuilder;
use crate::crd::{condition_reasons, condition_types, ConditionStatus};
use crate::events::{actions, reasons};
use crate::Result;

use super::{StepInput, StepOutcome};

pub(super) async fn ensure_network_path(input: &StepInput<'_>) -> Result<StepOutcome> {
    let session = input.session;

    if session
        .status
        .as_ref()
        .and_then(|s| s.backend_kas_url.as_deref())
        .is_some()
    {
        return Ok(StepOutcome::Continue);
    }

    // Errors are propagated raw here; the control plane step classified the
    // same fetch earlier in this pass, so reaching this point with an error
    // means the failure is fresh and the next pass will classify it.
    let hcp = input
        .querier
        .get_hosted_control_plane(&session.spec.hosted_control_plane.namespace)
        .await?;

    let url = format!("https://{}", hcp.spec.kube_api_server_dns_name);
    match StatusBuilder::new(session, input.now)
        .with_backend_kas_url(&url)
        .with_condition(
            condition_types::NETWORK_PATH_AVAILABLE,
            ConditionStatus::True,
            condition_reasons::NETWORK_PATH_AVAILABLE,
            "Network path available via public endpoint",
        )
        .build()
    {
        Some(status) => {
            let note = format!("Network path available at {url}.");
            Ok(StepOutcome::Done(Actions::status(status).with_event(
                reasons::NETWORK_PATH_AVAILABLE,
                actions::RECONCILE,
                note,
            )))
        }
        None => Ok(StepOutcome::Continue),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testutil::{
        available_hcp, fixed_time, sample_session, session_with_secret_ref, step_input_parts,
    };

    #[tokio::test]
    async fn discovers_backend_url_from_hcp_dns_name() {
        let (mut querier, secrets, endpoints) = step_input_parts();
        querier
            .expect_get_hosted_control_plane()
            .returning(|_| Ok(available_hcp()));

        let session = session_with_secret_ref();
        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        let StepOutcome::Done(actions) = ensure_network_path(&input).await.expect("no error")
        else {
            panic!("expected Done");
        };
        let status = actions.status.expect("status");
        assert_eq!(
            status.backend_kas_url.as_deref(),
            Some("https://api.test-hcp.example.com")
        );
        assert_eq!(
            actions.event.expect("event").reason,
            reasons::NETWORK_PATH_AVAILABLE
        );
    }

    #[tokio::test]
    async fn persisted_url_skips_the_lookup() {
        let (querier, secrets, endpoints) = step_input_parts();
        let mut session = sample_session();
        session.status = Some(crate::crd::SessionStatus {
            backend_kas_url: Some("https://api.test-hcp.example.com".to_string()),
            ..Default::default()
        });
        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        // The querier mock has no expectations; a lookup would panic.
        assert!(matches!(
            ensure_network_path(&input).await.expect("no error"),
            StepOutcome::Continue
        ));
    }

    #[tokio::test]
    async fn fetch_error_propagates_raw() {
        let (mut querier, secrets, endpoints) = step_input_parts();
        querier
            .expect_get_hosted_control_plane()
            .returning(|_| Err(crate::controller::testutil::api_error(500)));

        let session = session_with_secret_ref();
        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        assert!(ensure_network_path(&input).await.is_err());
    }
}

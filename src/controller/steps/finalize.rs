//! Endpoint publication and the Ready condition
//!
//! Last step in the chain: everything upstream is in place, so publish the
//! externally reachable endpoint and flip Ready to True.

use kube::ResourceExt;

use crate::controller::actions::Actions;
use crate::controller::status::StatusBuilder;
use crate::crd::{condition_reasons, condition_types, ConditionStatus};
use crate::events::{actions, reasons};
use crate::Result;

use super::{StepInput, StepOutcome};

pub(super) fn finalize_session(input: &StepInput<'_>) -> Result<StepOutcome> {
    let session = input.session;
    let endpoint = input.endpoints.session_endpoint(
        &session.namespace().unwrap_or_default(),
        &session.name_any(),
    );

    match StatusBuilder::new(session, input.now)
        .with_endpoint(&endpoint)
        .with_condition(
            condition_types::READY,
            ConditionStatus::True,
            condition_reasons::SESSION_READY,
            "Session is ready",
        )
        .build()
    {
        Some(status) => {
            let note = format!("Session is ready at {endpoint}.");
            Ok(StepOutcome::Done(Actions::status(status).with_event(
                reasons::SESSION_FINALIZATION,
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
    use crate::controller::testutil::{fixed_time, ready_session, sample_session, step_input_parts};

    #[test]
    fn publishes_endpoint_and_ready_condition() {
        let (querier, secrets, mut endpoints) = step_input_parts();
        endpoints
            .expect_session_endpoint()
            .returning(|ns, name| format!("https://breakglass.example.com/sessions/{ns}/{name}/kas"));

        let session = sample_session();
        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        let StepOutcome::Done(actions) = finalize_session(&input).expect("no error") else {
            panic!("expected Done");
        };
        let status = actions.status.expect("status");
        assert_eq!(
            status.endpoint.as_deref(),
            Some("https://breakglass.example.com/sessions/team-sre/test-session/kas")
        );
        assert!(status
            .conditions
            .iter()
            .any(|c| c.type_ == condition_types::READY && c.status == ConditionStatus::True));
        assert_eq!(
            actions.event.expect("event").reason,
            reasons::SESSION_FINALIZATION
        );
    }

    #[test]
    fn ready_session_falls_through() {
        let (querier, secrets, mut endpoints) = step_input_parts();
        endpoints
            .expect_session_endpoint()
            .returning(|ns, name| format!("https://breakglass.example.com/sessions/{ns}/{name}/kas"));

        let session = ready_session();
        let input = StepInput {
            session: &session,
            now: fixed_time(),
            querier: &querier,
            secrets: &secrets,
            endpoints: &endpoints,
        };

        assert!(matches!(
            finalize_session(&input).expect("no error"),
            StepOutcome::Continue
        ));
    }
}

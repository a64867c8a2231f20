//! HostedControlPlane readiness gate
//!
//! No credential work happens until the targeted HostedControlPlane exists on
//! the management cluster and reports Available.

use crate::controller::actions::Actions;
use crate::controller::status::StatusBuilder;
use crate::crd::{condition_reasons, condition_types, ConditionStatus};
use crate::Result;

use super::{classified_outcome, ErrorConditions, StepInput, StepOutcome};

pub(super) async fn verify_control_plane_ready(input: &StepInput<'_>) -> Result<StepOutcome> {
    let session = input.session;
    let namespace = &session.spec.hosted_control_plane.namespace;

    let hcp = match input.querier.get_hosted_control_plane(namespace).await {
        Ok(hcp) => hcp,
        Err(err) => {
            return classified_outcome(
                session,
                input.now,
                err,
                &ErrorConditions {
                    condition_type: condition_types::HOSTED_CONTROL_PLANE_AVAILABLE,
                    not_found: (
                        condition_reasons::HOSTED_CONTROL_PLANE_NOT_FOUND,
                        "HostedControlPlane not found on management cluster",
                    ),
                    access_denied: (
                        condition_reasons::HOSTED_CONTROL_PLANE_ACCESS_ERROR,
                        "Access denied to HostedControlPlane",
                    ),
                    retryable: (
                        condition_reasons::HOSTED_CONTROL_PLANE_ACCESS_ERROR,
                        "Unable to access HostedControlPlane in management cluster",
                    ),
                },
            );
        }
    };

    if !hcp.is_available() {
        // Not an error: the control plane is provisioning. The Available
        // transition arrives as a watch event, so no requeue is needed.
        let status = StatusBuilder::new(session, input.now)
            .with_condition(
                condition_types::HOSTED_CONTROL_PLANE_AVAILABLE,
                ConditionStatus::False,
                condition_reasons::HOSTED_CONTROL_PLANE_NOT_READY,
                "HostedControlPlane exists but is not ready",
            )
            .not_ready()
            .build();
        return Ok(StepOutcome::Done(
            status.map(Actions::status).unwrap_or_default(),
        ));
    }

    match StatusBuilder::new(session, input.now)
        .with_condition(
            condition_types::HOSTED_CONTROL_PLANE_AVAILABLE,
            ConditionStatus::True,
            condition_reasons::HOSTED_CONTROL_PLANE_AVAILABLE,
            "HostedControlPlane is available",
        )
        .build()
    {
        Some(status) => Ok(StepOutcome::Done(Actions::status(status))),
        None => Ok(StepOutcome::Continue),
    }
}

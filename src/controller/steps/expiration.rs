//! TTL enforcement
//!
//! Runs first in every pass so an expired session is torn down before any
//! remote call is made, even when the management cluster is unreachable.

use kube::ResourceExt;

use crate::controller::actions::Actions;
use crate::controller::status::StatusBuilder;
use crate::events::{actions, reasons};
use crate::Result;

use super::{StepInput, StepOutcome};

pub(super) fn handle_expiration(input: &StepInput<'_>) -> Result<StepOutcome> {
    let session = input.session;

    if session.is_expired(input.now) {
        let note = format!(
            "Session has expired, deleting {}/{}.",
            session.namespace().unwrap_or_default(),
            session.name_any()
        );
        return Ok(StepOutcome::Done(Actions::delete_session().with_event(
            reasons::SESSION_EXPIRATION,
            actions::EXPIRE,
            note,
        )));
    }

    if let Some(expiry) = session.expiry() {
        if let Some(status) = StatusBuilder::new(session, input.now)
            .with_expires_at(expiry)
            .build()
        {
            return Ok(StepOutcome::Done(Actions::status(status)));
        }
    }

    Ok(StepOutcome::Continue)
}

#![forbid(unsafe_code)]

//! Closing a session on CDMs that may never acknowledge the close.
//!
//! The native close is raced against a fallback: after a grace period an
//! innocuous `update` probes the session (an "invalid state" rejection proves
//! it is closed), then the session's own closed notification is awaited for a
//! bounded time. When nothing answers, the session is assumed closed.

use std::time::Duration;

use bytes::Bytes;
use derivative::Derivative;
use derive_setters::Setters;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace, warn};

use crate::{cdm::SessionHandle, error::CdmError};

/// Timing budget of the close fallback.
#[derive(Clone, Debug, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
pub struct CloseTimings {
    /// How long the native close may take before probing, and the probe's own limit.
    #[derivative(Default(value = "Duration::from_secs(1)"))]
    pub grace_period: Duration,
    /// How long to wait for the closed notification once the probe was inconclusive.
    #[derivative(Default(value = "Duration::from_secs(1)"))]
    pub closed_notification_timeout: Duration,
}

impl CloseTimings {
    /// Upper bound of a [`close_session`] call.
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.grace_period * 2 + self.closed_notification_timeout
    }
}

/// Which signal resolved the close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The CDM acknowledged the close.
    Acknowledged,
    /// The probe update was rejected with an invalid-state error.
    ProbeRejected,
    /// The session reported itself closed.
    ClosedNotification,
    /// Nothing answered within the budget.
    Assumed,
}

const PROBE_PAYLOAD: &[u8] = &[0];

/// Close `session`, never waiting longer than [`CloseTimings::budget`].
///
/// # Errors
///
/// Returns the CDM error when the native close fails before any fallback resolved.
pub async fn close_session(
    session: SessionHandle,
    timings: &CloseTimings,
) -> Result<CloseOutcome, CdmError> {
    let session_id = session.session_id();
    trace!(%session_id, "closing session");

    let outcome = tokio::select! {
        biased;
        result = session.close() => result.map(|()| CloseOutcome::Acknowledged),
        outcome = fallback(&session, timings) => Ok(outcome),
    };

    match &outcome {
        Ok(CloseOutcome::Assumed) => {
            warn!(%session_id, "session did not confirm close, assuming closed");
        }
        Ok(how) => debug!(%session_id, ?how, "session closed"),
        Err(e) => debug!(%session_id, %e, "session close failed"),
    }
    outcome
}

async fn fallback(session: &SessionHandle, timings: &CloseTimings) -> CloseOutcome {
    sleep(timings.grace_period).await;
    trace!("close not acknowledged within grace period, probing session");

    match timeout(
        timings.grace_period,
        session.update(Bytes::from_static(PROBE_PAYLOAD)),
    )
    .await
    {
        Ok(Err(e)) if e.is_invalid_state() => return CloseOutcome::ProbeRejected,
        Ok(Err(e)) => trace!(%e, "probe failed without proving closure"),
        Ok(Ok(())) => trace!("probe accepted, session still open"),
        Err(_) => trace!("probe did not answer"),
    }

    tokio::select! {
        biased;
        () = session.closed() => CloseOutcome::ClosedNotification,
        () = sleep(timings.closed_notification_timeout) => CloseOutcome::Assumed,
    }
}

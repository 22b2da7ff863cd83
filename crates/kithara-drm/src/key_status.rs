#![forbid(unsafe_code)]

use derivative::Derivative;
use derive_setters::Setters;

use crate::{
    cdm::{KeyStatus, MediaKeySession},
    error::DrmError,
    init_data::KeyId,
};

/// Whether a session can serve content.
///
/// Needs a session id, at least one key status, and no expired or
/// internal-error key.
#[must_use]
pub fn is_session_usable(session: &dyn MediaKeySession) -> bool {
    if session.session_id().is_empty() {
        return false;
    }
    let statuses = session.key_statuses();
    !statuses.is_empty()
        && statuses
            .iter()
            .all(|(_, s)| !matches!(s, KeyStatus::Expired | KeyStatus::InternalError))
}

/// Whether an open session may serve compatible initialization data again.
///
/// Looser than [`is_session_usable`]: a session still waiting for its
/// license, or left unlicensed on purpose, qualifies. Only an expired or
/// internal-error key disqualifies it.
#[must_use]
pub fn is_session_reusable(session: &dyn MediaKeySession) -> bool {
    !session
        .key_statuses()
        .iter()
        .any(|(_, s)| matches!(s, KeyStatus::Expired | KeyStatus::InternalError))
}

/// Reaction to a problematic key status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatusAction {
    /// Fail the session with `KEY_STATUS_CHANGE_ERROR`.
    Error,
    /// Blacklist the affected key ids; the session stays.
    Fallback,
    /// Ignore.
    Continue,
}

/// Configured reactions per status.
#[derive(Clone, Debug, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_")]
pub struct KeyStatusPolicy {
    #[derivative(Default(value = "KeyStatusAction::Error"))]
    pub on_expiration: KeyStatusAction,
    #[derivative(Default(value = "KeyStatusAction::Error"))]
    pub on_internal_error: KeyStatusAction,
    #[derivative(Default(value = "KeyStatusAction::Fallback"))]
    pub on_output_restricted: KeyStatusAction,
}

impl KeyStatusPolicy {
    fn action_for(&self, status: KeyStatus) -> KeyStatusAction {
        match status {
            KeyStatus::Expired => self.on_expiration,
            KeyStatus::InternalError => self.on_internal_error,
            KeyStatus::OutputRestricted => self.on_output_restricted,
            _ => KeyStatusAction::Continue,
        }
    }
}

/// Result of [`evaluate_key_statuses`].
#[derive(Clone, Debug, Default)]
pub struct KeyStatusReport {
    /// Key ids to avoid, from `Fallback` reactions.
    pub blacklisted: Vec<KeyId>,
    /// First `Error` reaction, if any.
    pub error: Option<DrmError>,
}

/// Apply `policy` to every key status.
#[must_use]
pub fn evaluate_key_statuses(
    statuses: &[(KeyId, KeyStatus)],
    policy: &KeyStatusPolicy,
) -> KeyStatusReport {
    let mut report = KeyStatusReport::default();
    for (key_id, status) in statuses {
        match policy.action_for(*status) {
            KeyStatusAction::Continue => {}
            KeyStatusAction::Fallback => {
                if !report.blacklisted.contains(key_id) {
                    report.blacklisted.push(key_id.clone());
                }
            }
            KeyStatusAction::Error => {
                if report.error.is_none() {
                    report.error = Some(DrmError::KeyStatusChange(format!(
                        "key {key_id} is {status:?}"
                    )));
                }
            }
        }
    }
    report
}

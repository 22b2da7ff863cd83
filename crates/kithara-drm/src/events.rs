#![forbid(unsafe_code)]

use tokio::sync::broadcast;

use crate::{
    error::{DrmError, DrmErrorCode},
    init_data::KeyId,
    orchestrator::SessionOutcome,
};

/// Lifecycle of a [`ContentDecryptor`](crate::ContentDecryptor).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DecryptorState {
    /// Key system negotiation in progress.
    Uninitialized,
    /// Negotiated; waiting for a media sink.
    WaitingForAttachment,
    Attaching,
    ReadyForContent,
    /// A fatal error stopped the decryptor.
    Error,
    Disposed,
}

impl DecryptorState {
    /// Terminal states absorb every later transition.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Disposed)
    }
}

/// Error or warning as published on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrmIssue {
    pub code: DrmErrorCode,
    pub message: String,
    pub fatal: bool,
}

impl From<&DrmError> for DrmIssue {
    fn from(error: &DrmError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
            fatal: error.is_fatal(),
        }
    }
}

/// Events published by the decryptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrmEvent {
    StateChange(DecryptorState),
    /// Fatal for the decryptor when `fatal` is set, otherwise scoped to one
    /// initialization data or session.
    Error(DrmIssue),
    /// Recoverable problem; playback continues.
    Warning(DrmIssue),
    /// A session is ready to decrypt the content it was created for.
    SessionReady {
        session_id: String,
        outcome: SessionOutcome,
    },
    /// Keys that should no longer be used (e.g. output restricted).
    KeysBlacklisted { key_ids: Vec<KeyId> },
}

/// Broadcast bus for [`DrmEvent`]s.
///
/// `publish()` never blocks and drops events when nobody listens. Slow
/// subscribers get `RecvError::Lagged(n)`.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<DrmEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: DrmEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn error(&self, error: &DrmError) {
        self.publish(DrmEvent::Error(error.into()));
    }

    pub(crate) fn warning(&self, error: &DrmError) {
        self.publish(DrmEvent::Warning(error.into()));
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DrmEvent> {
        self.tx.subscribe()
    }
}

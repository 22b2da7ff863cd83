#![forbid(unsafe_code)]

//! Per-initialization-data decision: reuse, load a persisted session, or create.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    cdm::{MediaKeySession, SessionEvent, SessionHandle, SessionType},
    error::{DrmError, DrmResult},
    events::EventBus,
    key_status::{is_session_reusable, is_session_usable},
    loaded::{LoadedSessionsStore, StoredSession},
    persistent::PersistentSessionsStore,
    record::KeySessionRecord,
};

/// How the session handed back was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionOutcome {
    /// A usable session was already open for compatible initialization data.
    LoadedOpenSession,
    /// A persisted session was loaded and is usable.
    LoadedPersistentSession,
    /// A fresh session was created; it still needs a license.
    Created,
}

/// Both session stores of an attached CDM.
#[derive(Clone, Debug)]
pub struct SessionStores {
    pub loaded: LoadedSessionsStore,
    /// Present when persistent licenses are enabled and backed by storage.
    pub persistent: Option<Arc<PersistentSessionsStore>>,
}

/// Bounds applied while obtaining a session.
#[derive(Clone, Copy, Debug)]
pub struct SessionLimits {
    /// Live session cap, `None` for unbounded.
    pub max_sessions: Option<usize>,
    /// How long a loaded session may take to report key statuses.
    pub key_status_wait: Duration,
}

#[derive(Clone, Debug)]
pub struct OrchestratedSession {
    pub outcome: SessionOutcome,
    pub stored: StoredSession,
}

impl OrchestratedSession {
    fn new(outcome: SessionOutcome, stored: StoredSession) -> Self {
        Self { outcome, stored }
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> DrmResult<()> {
    if cancel.is_cancelled() {
        return Err(DrmError::Cancelled);
    }
    Ok(())
}

async fn cancellable<T, F>(cancel: &CancellationToken, future: F) -> DrmResult<T>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DrmError::Cancelled),
        value = future => Ok(value),
    }
}

fn report<T>(bus: &EventBus, result: DrmResult<T>) {
    if let Err(e) = result {
        warn!(%e, "persistent session store");
        bus.warning(&e);
    }
}

/// Drop a session from the loaded store.
///
/// Handles that never obtained a session id are only forgotten; closing them
/// is undefined on some CDMs.
pub(crate) async fn discard_session(loaded: &LoadedSessionsStore, session: &SessionHandle) {
    if session.session_id().is_empty() {
        loaded.remove_session_without_closing(session);
        return;
    }
    if let Err(e) = loaded.close_session(session).await {
        warn!(%e, "failed to close discarded session");
    }
}

/// Obtain a session for `record`.
///
/// `active` lists records whose sessions are mid-negotiation and must not
/// be evicted. Storage failures are published on `bus` as warnings.
///
/// An open session is reused unless one of its keys failed; one still
/// waiting for a license is handed back as is. Closes started here always
/// run to completion, cancellation is observed once they are done.
///
/// # Errors
///
/// - [`DrmError::NoCapacity`] when eviction cannot make room.
/// - [`DrmError::DuplicateSession`] when a compatible session appeared concurrently.
/// - [`DrmError::Cdm`] when the CDM refuses to create a session.
/// - [`DrmError::Cancelled`]; no entry is left behind in either store.
pub async fn create_or_load_session(
    stores: &SessionStores,
    record: &KeySessionRecord,
    session_type: SessionType,
    limits: &SessionLimits,
    active: &[KeySessionRecord],
    bus: &EventBus,
    cancel: &CancellationToken,
) -> DrmResult<OrchestratedSession> {
    ensure_not_cancelled(cancel)?;

    if let Some(previous) = stores.loaded.reuse_record(record) {
        if is_session_reusable(previous.session.as_ref()) {
            trace!(session_id = %previous.session.session_id(), "reusing open session");
            return Ok(OrchestratedSession::new(
                SessionOutcome::LoadedOpenSession,
                previous,
            ));
        }

        let session_id = previous.session.session_id();
        debug!(%session_id, "open session is unusable, replacing it");
        if let Some(persistent) = &stores.persistent
            && !session_id.is_empty()
        {
            report(bus, persistent.delete(&session_id));
        }
        // Not raced against `cancel`: `close_session` drops the entry before awaiting.
        if let Err(e) = stores.loaded.close_session(&previous.session).await {
            warn!(%session_id, %e, "failed to close unusable session");
        }
        ensure_not_cancelled(cancel)?;
    }

    if let Some(max) = limits.max_sessions {
        stores
            .loaded
            .evict_to_limit(max.saturating_sub(1), active)
            .await?;
        ensure_not_cancelled(cancel)?;
    }

    let stored = stores
        .loaded
        .create_session_for_record(record.clone(), session_type)?;
    if session_type == SessionType::Temporary {
        return Ok(OrchestratedSession::new(SessionOutcome::Created, stored));
    }
    let Some(persistent) = &stores.persistent else {
        return Ok(OrchestratedSession::new(SessionOutcome::Created, stored));
    };
    let Some(entry) = persistent.get_and_reuse_record(record) else {
        return Ok(OrchestratedSession::new(SessionOutcome::Created, stored));
    };

    let session_id = entry.session_id;
    let mut events = stored.session.subscribe();
    let loaded = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            discard_session(&stores.loaded, &stored.session).await;
            return Err(DrmError::Cancelled);
        }
        loaded = stored.session.load(&session_id) => loaded,
    };

    match loaded {
        Ok(false) => {
            info!(%session_id, "persisted session unknown to the CDM, creating a new one");
            report(bus, persistent.delete(&session_id));
            stores.loaded.remove_session_without_closing(&stored.session);
            let fresh = stores
                .loaded
                .create_session_for_record(record.clone(), session_type)?;
            return Ok(OrchestratedSession::new(SessionOutcome::Created, fresh));
        }
        Ok(true) => {
            if cancellable(
                cancel,
                wait_for_key_statuses(stored.session.as_ref(), &mut events, limits.key_status_wait),
            )
            .await
            .is_err()
            {
                discard_session(&stores.loaded, &stored.session).await;
                return Err(DrmError::Cancelled);
            }
            if is_session_usable(stored.session.as_ref()) {
                let key_ids: Vec<_> = stored
                    .session
                    .key_statuses()
                    .into_iter()
                    .map(|(key_id, _)| key_id)
                    .collect();
                report(bus, persistent.add(record, &key_ids, stored.session.as_ref()));
                debug!(%session_id, "persisted session loaded");
                return Ok(OrchestratedSession::new(
                    SessionOutcome::LoadedPersistentSession,
                    stored,
                ));
            }
            info!(%session_id, "loaded persisted session is unusable, recreating");
        }
        Err(e) => {
            warn!(%session_id, %e, "failed to load persisted session, recreating");
        }
    }

    report(bus, persistent.delete(&session_id));
    let obtained_id = !stored.session.session_id().is_empty();
    match stores.loaded.close_session(&stored.session).await {
        Ok(_) => {}
        Err(e) if !obtained_id => trace!(%e, "close of a session without id failed"),
        Err(e) => return Err(e),
    }
    let fresh = stores
        .loaded
        .create_session_for_record(record.clone(), session_type)?;
    Ok(OrchestratedSession::new(SessionOutcome::Created, fresh))
}

async fn wait_for_key_statuses(
    session: &dyn MediaKeySession,
    events: &mut broadcast::Receiver<SessionEvent>,
    wait: Duration,
) {
    if !session.key_statuses().is_empty() {
        return;
    }
    let waited = timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::KeyStatusesChange) | Err(RecvError::Lagged(_)) => {
                    if !session.key_statuses().is_empty() {
                        return;
                    }
                }
                Ok(SessionEvent::Message { .. }) => {}
                Err(RecvError::Closed) => return,
            }
        }
    })
    .await;
    if waited.is_err() {
        trace!(?wait, "no key statuses reported by loaded session");
    }
}

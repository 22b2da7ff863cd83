#![forbid(unsafe_code)]

//! Top-level decryption controller.
//!
//! ## Normative
//!
//! - Negotiation starts on construction. `attach()` waits for it.
//! - Initialization data received before `ReadyForContent` is queued and
//!   processed in arrival order once attached.
//! - Initialization data compatible with a record still being handled is
//!   ignored; compatible data arriving later reuses the open session.
//! - Fatal errors move the decryptor to `Error`; `Error` and `Disposed`
//!   absorb every later transition except `Error -> Disposed`.
//! - `dispose()` stops all work, then closes every open session.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    oneshot, watch,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cdm::{KeySystemPlatform, MediaKeys, MediaSink, SessionEvent, SessionType},
    config::{DecryptorConfig, KeySystemOption},
    error::{DrmError, DrmResult},
    events::{DecryptorState, DrmEvent, EventBus},
    init_data::{InitData, KeyId},
    key_status::{evaluate_key_statuses, is_session_usable},
    key_system::{NegotiatedKeySystem, negotiate},
    license::{LicenseOutcome, LicenseRequest, acquire_license},
    loaded::{LoadedSessionsStore, StoredSession},
    orchestrator::{
        SessionLimits, SessionOutcome, SessionStores, create_or_load_session, discard_session,
    },
    persistent::PersistentSessionsStore,
    record::KeySessionRecord,
};

/// Everything that exists once media keys are attached.
struct Attached {
    option: KeySystemOption,
    session_type: SessionType,
    stores: SessionStores,
    limits: SessionLimits,
}

#[derive(Default)]
struct Attachment {
    attached: Option<Arc<Attached>>,
    pending: Vec<InitData>,
}

struct Inner {
    config: DecryptorConfig,
    platform: Arc<dyn KeySystemPlatform>,
    bus: EventBus,
    state: watch::Sender<DecryptorState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    negotiated: Mutex<Option<NegotiatedKeySystem>>,
    attachment: Mutex<Attachment>,
    in_flight: Mutex<Vec<KeySessionRecord>>,
}

impl Inner {
    fn state(&self) -> DecryptorState {
        *self.state.borrow()
    }

    /// Move to `to` when `allowed` accepts the current state.
    fn transition_if<F>(&self, to: DecryptorState, allowed: F) -> bool
    where
        F: Fn(DecryptorState) -> bool,
    {
        let changed = self.state.send_if_modified(|state| {
            if *state == to || !allowed(*state) {
                return false;
            }
            *state = to;
            true
        });
        if changed {
            info!(state = ?to, "decryptor state changed");
            self.bus.publish(DrmEvent::StateChange(to));
        }
        changed
    }

    fn transition(&self, to: DecryptorState) -> bool {
        self.transition_if(to, |state| !state.is_terminal())
    }

    fn fail(&self, e: &DrmError) {
        error!(%e, "fatal DRM error");
        self.bus.error(e);
        self.transition(DecryptorState::Error);
        self.cancel.cancel();
    }

    async fn run_negotiation(&self) {
        match negotiate(self.platform.as_ref(), &self.config.key_systems, &self.cancel).await {
            Ok(negotiated) => {
                *self.negotiated.lock() = Some(negotiated);
                self.transition_if(DecryptorState::WaitingForAttachment, |state| {
                    state == DecryptorState::Uninitialized
                });
            }
            Err(DrmError::Cancelled) => trace!("negotiation cancelled"),
            Err(e) => self.fail(&e),
        }
    }

    fn release_in_flight(&self, record: &KeySessionRecord) {
        self.in_flight
            .lock()
            .retain(|r| !r.is_compatible_with(record));
    }

    /// Records other than `record` whose handling is still in progress.
    fn active_records(&self, record: &KeySessionRecord) -> Vec<KeySessionRecord> {
        self.in_flight
            .lock()
            .iter()
            .filter(|r| !r.is_compatible_with(record))
            .cloned()
            .collect()
    }
}

/// Drives key system negotiation, session management and license exchange
/// for one piece of content.
///
/// Must be created within a tokio runtime.
#[derive(Clone)]
pub struct ContentDecryptor {
    inner: Arc<Inner>,
}

impl ContentDecryptor {
    pub fn new(config: DecryptorConfig, platform: Arc<dyn KeySystemPlatform>) -> Self {
        let bus = config
            .bus
            .clone()
            .unwrap_or_else(|| EventBus::new(config.event_channel_capacity));
        let cancel = config
            .cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        let (state, _) = watch::channel(DecryptorState::Uninitialized);

        let inner = Arc::new(Inner {
            config,
            platform,
            bus,
            state,
            cancel,
            tracker: TaskTracker::new(),
            negotiated: Mutex::new(None),
            attachment: Mutex::new(Attachment::default()),
            in_flight: Mutex::new(Vec::new()),
        });

        let task = Arc::clone(&inner);
        inner
            .tracker
            .spawn(async move { task.run_negotiation().await });
        Self { inner }
    }

    #[must_use]
    pub fn state(&self) -> DecryptorState {
        self.inner.state()
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<DecryptorState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DrmEvent> {
        self.inner.bus.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Concrete key system chosen by negotiation.
    #[must_use]
    pub fn key_system(&self) -> Option<String> {
        self.inner
            .negotiated
            .lock()
            .as_ref()
            .map(|n| n.key_system.clone())
    }

    /// Open sessions, least recently used first. Empty before attachment.
    #[must_use]
    pub fn sessions(&self) -> Vec<StoredSession> {
        self.inner
            .attachment
            .lock()
            .attached
            .as_ref()
            .map(|a| a.stores.loaded.get_all())
            .unwrap_or_default()
    }

    /// Persistent session store, when persistent licenses are in use.
    #[must_use]
    pub fn persistent_sessions(&self) -> Option<Arc<PersistentSessionsStore>> {
        self.inner
            .attachment
            .lock()
            .attached
            .as_ref()
            .and_then(|a| a.stores.persistent.clone())
    }

    /// Create the CDM instance and attach it to `sink`.
    ///
    /// Waits for negotiation first. Queued initialization data is processed
    /// once this returns `Ok`.
    ///
    /// # Errors
    ///
    /// - [`DrmError::CreateMediaKeys`] / [`DrmError::AttachMediaKeys`]; both are fatal.
    /// - [`DrmError::InvalidState`] when not waiting for attachment, e.g. a second call.
    /// - [`DrmError::Disposed`] when disposed meanwhile.
    pub async fn attach(&self, sink: Arc<dyn MediaSink>) -> DrmResult<()> {
        let inner = &self.inner;
        let mut state_rx = inner.state.subscribe();
        let state = tokio::select! {
            biased;
            state = state_rx.wait_for(|s| *s != DecryptorState::Uninitialized) => {
                state.map(|s| *s).map_err(|_| DrmError::Disposed)?
            }
            () = inner.cancel.cancelled() => return Err(DrmError::Disposed),
        };
        if state == DecryptorState::Disposed {
            return Err(DrmError::Disposed);
        }
        if !inner.transition_if(DecryptorState::Attaching, |s| {
            s == DecryptorState::WaitingForAttachment
        }) {
            return Err(DrmError::InvalidState(inner.state()));
        }

        let negotiated = inner
            .negotiated
            .lock()
            .clone()
            .ok_or(DrmError::InvalidState(DecryptorState::Uninitialized))?;
        let option = inner
            .config
            .key_systems
            .get(negotiated.option_index)
            .cloned()
            .ok_or(DrmError::InvalidState(DecryptorState::Attaching))?;

        let media_keys = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return Err(DrmError::Disposed),
            media_keys = negotiated.access.create_media_keys() => media_keys,
        };
        let media_keys = match media_keys {
            Ok(media_keys) => media_keys,
            Err(e) => {
                let e = DrmError::CreateMediaKeys(e);
                inner.fail(&e);
                return Err(e);
            }
        };

        let attached = tokio::select! {
            biased;
            () = inner.cancel.cancelled() => return Err(DrmError::Disposed),
            attached = sink.set_media_keys(Some(Arc::clone(&media_keys))) => attached,
        };
        if let Err(e) = attached {
            let e = DrmError::AttachMediaKeys(e);
            inner.fail(&e);
            return Err(e);
        }
        debug!(key_system = %negotiated.key_system, "media keys attached");

        if let Some(certificate) = &option.server_certificate {
            apply_server_certificate(inner, media_keys.as_ref(), certificate.clone()).await;
        }

        let persistent = match (&option.persistent_storage, option.persistent_license) {
            (Some(storage), true) => Some(Arc::new(PersistentSessionsStore::new(
                Arc::clone(storage),
                option.max_persistent_sessions,
            ))),
            (None, true) => {
                warn!("persistent licenses enabled without storage, sessions will not be reloaded");
                None
            }
            (_, false) => None,
        };
        let attached = Arc::new(Attached {
            session_type: option.session_type(),
            option,
            stores: SessionStores {
                loaded: LoadedSessionsStore::new(media_keys, inner.config.close.clone()),
                persistent,
            },
            limits: SessionLimits {
                max_sessions: inner.config.max_simultaneous_sessions,
                key_status_wait: inner.config.key_status_wait,
            },
        });

        let pending = {
            let mut attachment = inner.attachment.lock();
            if !inner.transition_if(DecryptorState::ReadyForContent, |s| {
                s == DecryptorState::Attaching
            }) {
                return Err(DrmError::Disposed);
            }
            attachment.attached = Some(Arc::clone(&attached));
            std::mem::take(&mut attachment.pending)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "processing queued initialization data");
        }
        for init_data in pending {
            self.handle(Arc::clone(&attached), init_data);
        }
        Ok(())
    }

    /// Feed initialization data found in the content.
    ///
    /// # Errors
    ///
    /// [`DrmError::Disposed`] or [`DrmError::InvalidState`] in a terminal state.
    pub fn on_initialization_data(&self, init_data: InitData) -> DrmResult<()> {
        let attached = {
            let mut attachment = self.inner.attachment.lock();
            match self.inner.state() {
                DecryptorState::Disposed => return Err(DrmError::Disposed),
                DecryptorState::Error => {
                    return Err(DrmError::InvalidState(DecryptorState::Error));
                }
                _ if self.inner.cancel.is_cancelled() => return Err(DrmError::Disposed),
                _ => {}
            }
            match &attachment.attached {
                Some(attached) => Arc::clone(attached),
                None => {
                    trace!(init_data_type = %init_data.init_data_type, "queueing initialization data");
                    attachment.pending.push(init_data);
                    return Ok(());
                }
            }
        };
        self.handle(attached, init_data);
        Ok(())
    }

    fn handle(&self, attached: Arc<Attached>, init_data: InitData) {
        let record = KeySessionRecord::new(&init_data);
        {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.iter().find(|r| r.is_compatible_with(&record)) {
                if let Some(key_ids) = &init_data.key_ids {
                    existing.associate_key_ids(key_ids.iter().cloned());
                }
                trace!("initialization data already being handled");
                return;
            }
            in_flight.push(record.clone());
        }

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(async move {
            let result = process_init_data(&inner, &attached, &record).await;
            inner.release_in_flight(&record);
            match result {
                Ok(()) | Err(DrmError::Cancelled | DrmError::Disposed) => {}
                Err(e) if e.is_recoverable() => {
                    warn!(%e, "initialization data not processed");
                    inner.bus.warning(&e);
                }
                Err(e) => {
                    warn!(%e, "initialization data failed");
                    inner.bus.error(&e);
                }
            }
        });
    }

    /// Stop all work and close every session. Idempotent.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        inner.cancel.cancel();
        inner.tracker.close();
        inner.tracker.wait().await;

        let attached = {
            let mut attachment = inner.attachment.lock();
            attachment.pending.clear();
            attachment.attached.take()
        };
        if let Some(attached) = attached {
            attached.stores.loaded.close_all().await;
        }
        inner.in_flight.lock().clear();
        inner.transition_if(DecryptorState::Disposed, |s| s != DecryptorState::Disposed);
    }
}

async fn apply_server_certificate(inner: &Inner, media_keys: &dyn MediaKeys, certificate: Bytes) {
    let result = tokio::select! {
        biased;
        () = inner.cancel.cancelled() => return,
        result = media_keys.set_server_certificate(certificate) => result,
    };
    match result {
        Ok(true) => debug!("server certificate applied"),
        Ok(false) => debug!("server certificate not supported by the CDM"),
        Err(e) => {
            let e = DrmError::ServerCertificate(e);
            warn!(%e, "server certificate rejected");
            inner.bus.warning(&e);
        }
    }
}

async fn process_init_data(
    inner: &Arc<Inner>,
    attached: &Arc<Attached>,
    record: &KeySessionRecord,
) -> DrmResult<()> {
    let cancel = inner.cancel.child_token();
    let active = inner.active_records(record);
    let orchestrated = create_or_load_session(
        &attached.stores,
        record,
        attached.session_type,
        &attached.limits,
        &active,
        &inner.bus,
        &cancel,
    )
    .await?;
    let stored = orchestrated.stored;

    match orchestrated.outcome {
        SessionOutcome::LoadedOpenSession => {
            publish_ready(inner, &stored, SessionOutcome::LoadedOpenSession);
            return Ok(());
        }
        SessionOutcome::LoadedPersistentSession => {
            let events = stored.session.subscribe();
            if !apply_key_statuses(inner, attached, &stored).await {
                return Ok(());
            }
            spawn_session_loop(inner, attached, stored.clone(), events, None);
            publish_ready(inner, &stored, SessionOutcome::LoadedPersistentSession);
            return Ok(());
        }
        SessionOutcome::Created => {}
    }

    let events = stored.session.subscribe();
    let (first_tx, first_rx) = oneshot::channel();
    spawn_session_loop(inner, attached, stored.clone(), events, Some(first_tx));

    let generated = tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DrmError::Cancelled),
        generated = stored
            .session
            .generate_request(record.init_data_type(), record.request_data()) => {
            generated.map_err(DrmError::KeyGenerateRequest)
        }
    };
    if let Err(e) = generated {
        discard_session(&attached.stores.loaded, &stored.session).await;
        return Err(e);
    }
    debug!(session_id = %stored.session.session_id(), "license request generated");

    let first = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(DrmError::Cancelled),
        first = first_rx => first,
    };
    match first {
        Ok(Ok(LicenseOutcome::Updated)) => {
            publish_ready(inner, &stored, SessionOutcome::Created);
            Ok(())
        }
        Ok(Ok(LicenseOutcome::Ignored)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            debug!("session ended before its first license");
            Ok(())
        }
    }
}

fn publish_ready(inner: &Inner, stored: &StoredSession, outcome: SessionOutcome) {
    let session_id = stored.session.session_id();
    info!(%session_id, ?outcome, "session ready");
    inner.bus.publish(DrmEvent::SessionReady {
        session_id,
        outcome,
    });
}

fn spawn_session_loop(
    inner: &Arc<Inner>,
    attached: &Arc<Attached>,
    stored: StoredSession,
    events: broadcast::Receiver<SessionEvent>,
    first: Option<oneshot::Sender<DrmResult<LicenseOutcome>>>,
) {
    let inner_task = Arc::clone(inner);
    let attached = Arc::clone(attached);
    inner.tracker.spawn(async move {
        run_session(&inner_task, &attached, &stored, events, first).await;
    });
}

/// Serve license messages and key status changes of one session until it
/// closes, fails, or the decryptor is disposed.
async fn run_session(
    inner: &Inner,
    attached: &Attached,
    stored: &StoredSession,
    mut events: broadcast::Receiver<SessionEvent>,
    mut first: Option<oneshot::Sender<DrmResult<LicenseOutcome>>>,
) {
    let cancel = inner.cancel.child_token();
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = stored.session.closed() => {
                debug!(session_id = %stored.session.session_id(), "session closed");
                break;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::Message {
                message_type,
                message,
            }) => {
                let request = LicenseRequest {
                    challenge: message,
                    message_type,
                };
                let result = acquire_license(
                    stored.session.as_ref(),
                    &request,
                    &attached.option.get_license,
                    &attached.option.license,
                    &cancel,
                    |e, failures| {
                        debug!(failures, "license retry");
                        inner.bus.warning(e);
                    },
                )
                .await;
                match result {
                    Ok(outcome) => {
                        if outcome == LicenseOutcome::Updated {
                            on_license_applied(inner, attached, stored);
                        }
                        if let Some(tx) = first.take() {
                            let _ = tx.send(Ok(outcome));
                        }
                    }
                    Err(DrmError::Cancelled) => break,
                    Err(e) => {
                        match first.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(e));
                            }
                            None => inner.bus.error(&e),
                        }
                        discard_session(&attached.stores.loaded, &stored.session).await;
                        break;
                    }
                }
            }
            Ok(SessionEvent::KeyStatusesChange) => {
                if !apply_key_statuses(inner, attached, stored).await {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn on_license_applied(inner: &Inner, attached: &Attached, stored: &StoredSession) {
    let key_ids: Vec<KeyId> = stored
        .session
        .key_statuses()
        .into_iter()
        .map(|(key_id, _)| key_id)
        .collect();
    stored.record.associate_key_ids(key_ids.iter().cloned());

    if stored.session_type != SessionType::PersistentLicense {
        return;
    }
    if let Some(persistent) = &attached.stores.persistent
        && is_session_usable(stored.session.as_ref())
        && let Err(e) = persistent.add(&stored.record, &key_ids, stored.session.as_ref())
    {
        warn!(%e, "failed to persist session");
        inner.bus.warning(&e);
    }
}

/// React to the current key statuses. Returns `false` when the session was
/// closed because of them.
async fn apply_key_statuses(inner: &Inner, attached: &Attached, stored: &StoredSession) -> bool {
    let statuses = stored.session.key_statuses();
    let report = evaluate_key_statuses(&statuses, &attached.option.key_status);
    if !report.blacklisted.is_empty() {
        info!(count = report.blacklisted.len(), "blacklisting keys");
        inner.bus.publish(DrmEvent::KeysBlacklisted {
            key_ids: report.blacklisted,
        });
    }
    let Some(e) = report.error else {
        return true;
    };
    warn!(%e, session_id = %stored.session.session_id(), "closing session");
    inner.bus.error(&e);
    discard_session(&attached.stores.loaded, &stored.session).await;
    false
}

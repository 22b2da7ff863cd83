#![forbid(unsafe_code)]

//! In-memory CDM used by tests.
//!
//! [`FakeCdm`] owns the state shared by every object it hands out: the
//! sessions created so far, the sessions the "CDM" remembers across loads,
//! and the scripted [`FakeBehavior`].
//!
//! Licenses are interpreted naively: updating a session with payload `P`
//! gives it one usable key whose id is `P`.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::{
    cdm::{
        KeyStatus, KeySystemAccess, KeySystemConfiguration, KeySystemPlatform, MediaKeySession,
        MediaKeys, MediaSink, MessageType, SessionEvent, SessionHandle, SessionType,
    },
    error::CdmError,
    init_data::KeyId,
};

/// How a fake session answers `close()`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseBehavior {
    #[default]
    Resolve,
    /// The session closes but the call never resolves.
    HangAfterClosing,
    /// Nothing happens and the call never resolves.
    HangWithoutClosing,
    Fail,
}

/// Scripted answers of the fake CDM.
#[derive(Clone, Debug, Default)]
pub struct FakeBehavior {
    pub close: CloseBehavior,
    pub create_session_error: Option<CdmError>,
    pub generate_request_error: Option<CdmError>,
    pub load_error: Option<CdmError>,
    pub update_error: Option<CdmError>,
    pub create_media_keys_error: Option<CdmError>,
    pub server_certificate_error: Option<CdmError>,
    /// Statuses a session gets on update instead of one usable key.
    pub update_statuses: Option<Vec<KeyStatus>>,
    /// Time `load` takes to answer.
    pub load_delay: Option<Duration>,
    /// Time a resolving `close` takes before the session closes.
    pub close_delay: Option<Duration>,
}

/// A call observed by a [`FakeSession`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionCall {
    GenerateRequest { init_data_type: String, data: Bytes },
    Load(String),
    Update(Bytes),
    Close,
}

#[derive(Default)]
struct CdmShared {
    next_id: AtomicU64,
    behavior: Mutex<FakeBehavior>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    persisted: Mutex<HashMap<String, Vec<(KeyId, KeyStatus)>>>,
    certificates: Mutex<Vec<Bytes>>,
}

/// Handle on the fake CDM state.
#[derive(Clone, Default)]
pub struct FakeCdm {
    shared: Arc<CdmShared>,
}

impl FakeCdm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure<F: FnOnce(&mut FakeBehavior)>(&self, f: F) {
        f(&mut self.shared.behavior.lock());
    }

    #[must_use]
    pub fn media_keys(&self) -> Arc<FakeMediaKeys> {
        Arc::new(FakeMediaKeys {
            shared: Arc::clone(&self.shared),
        })
    }

    /// Every session created so far, in creation order.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.shared.sessions.lock().clone()
    }

    /// Make the CDM remember a persisted session.
    pub fn persist_session<S: Into<String>>(&self, session_id: S, statuses: Vec<(KeyId, KeyStatus)>) {
        self.shared.persisted.lock().insert(session_id.into(), statuses);
    }

    /// Make the CDM forget a persisted session.
    pub fn forget_session(&self, session_id: &str) {
        self.shared.persisted.lock().remove(session_id);
    }

    #[must_use]
    pub fn persisted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.persisted.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn certificates(&self) -> Vec<Bytes> {
        self.shared.certificates.lock().clone()
    }

    fn behavior(&self) -> FakeBehavior {
        self.shared.behavior.lock().clone()
    }
}

/// A fake decryption session.
pub struct FakeSession {
    session_type: SessionType,
    shared: Arc<CdmShared>,
    id: Mutex<String>,
    statuses: Mutex<Vec<(KeyId, KeyStatus)>>,
    events: broadcast::Sender<SessionEvent>,
    closed: CancellationToken,
    calls: Mutex<Vec<SessionCall>>,
}

impl FakeSession {
    fn new(session_type: SessionType, shared: Arc<CdmShared>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            session_type,
            shared,
            id: Mutex::new(String::new()),
            statuses: Mutex::new(Vec::new()),
            events,
            closed: CancellationToken::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    #[must_use]
    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    /// Number of `update` calls, probes included.
    #[must_use]
    pub fn update_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SessionCall::Update(_)))
            .count()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SessionCall::Close))
            .count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close from the CDM side, as when a license expires for good.
    pub fn force_close(&self) {
        self.closed.cancel();
    }

    /// Replace key statuses and notify subscribers.
    pub fn set_key_statuses(&self, statuses: Vec<(KeyId, KeyStatus)>) {
        *self.statuses.lock() = statuses;
        let _ = self.events.send(SessionEvent::KeyStatusesChange);
    }

    /// Emit a challenge, e.g. a renewal.
    pub fn emit_message(&self, message_type: MessageType, message: Bytes) {
        let _ = self.events.send(SessionEvent::Message {
            message_type,
            message,
        });
    }

    fn record(&self, call: SessionCall) {
        self.calls.lock().push(call);
    }

    fn behavior(&self) -> FakeBehavior {
        self.shared.behavior.lock().clone()
    }

    fn assign_id(&self) -> String {
        let n = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("fake-session-{n}");
        *self.id.lock() = id.clone();
        id
    }
}

#[async_trait]
impl MediaKeySession for FakeSession {
    fn session_id(&self) -> String {
        self.id.lock().clone()
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        self.statuses.lock().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn generate_request(&self, init_data_type: &str, data: Bytes) -> Result<(), CdmError> {
        self.record(SessionCall::GenerateRequest {
            init_data_type: init_data_type.to_string(),
            data: data.clone(),
        });
        if self.is_closed() {
            return Err(CdmError::invalid_state("session closed"));
        }
        if let Some(e) = self.behavior().generate_request_error {
            return Err(e);
        }
        self.assign_id();
        self.emit_message(MessageType::LicenseRequest, data);
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<bool, CdmError> {
        self.record(SessionCall::Load(session_id.to_string()));
        let behavior = self.behavior();
        if let Some(delay) = behavior.load_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = behavior.load_error {
            return Err(e);
        }
        let known = self.shared.persisted.lock().get(session_id).cloned();
        let Some(statuses) = known else {
            return Ok(false);
        };
        *self.id.lock() = session_id.to_string();
        if !statuses.is_empty() {
            self.set_key_statuses(statuses);
        }
        Ok(true)
    }

    async fn update(&self, response: Bytes) -> Result<(), CdmError> {
        self.record(SessionCall::Update(response.clone()));
        if self.is_closed() {
            return Err(CdmError::invalid_state("session closed"));
        }
        let behavior = self.behavior();
        if let Some(e) = behavior.update_error {
            return Err(e);
        }
        let key_id = KeyId::new(response);
        let statuses: Vec<(KeyId, KeyStatus)> = match behavior.update_statuses {
            Some(list) => list.into_iter().map(|s| (key_id.clone(), s)).collect(),
            None => vec![(key_id, KeyStatus::Usable)],
        };
        let session_id = self.session_id();
        if self.session_type == SessionType::PersistentLicense && !session_id.is_empty() {
            self.shared
                .persisted
                .lock()
                .insert(session_id, statuses.clone());
        }
        self.set_key_statuses(statuses);
        Ok(())
    }

    async fn close(&self) -> Result<(), CdmError> {
        self.record(SessionCall::Close);
        let behavior = self.behavior();
        match behavior.close {
            CloseBehavior::Resolve => {
                if let Some(delay) = behavior.close_delay {
                    tokio::time::sleep(delay).await;
                }
                self.closed.cancel();
                Ok(())
            }
            CloseBehavior::HangAfterClosing => {
                self.closed.cancel();
                std::future::pending().await
            }
            CloseBehavior::HangWithoutClosing => std::future::pending().await,
            CloseBehavior::Fail => Err(CdmError::other("close failed")),
        }
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

/// Fake CDM instance.
pub struct FakeMediaKeys {
    shared: Arc<CdmShared>,
}

#[async_trait]
impl MediaKeys for FakeMediaKeys {
    fn create_session(&self, session_type: SessionType) -> Result<SessionHandle, CdmError> {
        if let Some(e) = self.shared.behavior.lock().create_session_error.clone() {
            return Err(e);
        }
        let session = Arc::new(FakeSession::new(session_type, Arc::clone(&self.shared)));
        self.shared.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }

    async fn set_server_certificate(&self, certificate: Bytes) -> Result<bool, CdmError> {
        if let Some(e) = self.shared.behavior.lock().server_certificate_error.clone() {
            return Err(e);
        }
        self.shared.certificates.lock().push(certificate);
        Ok(true)
    }
}

/// Negotiation result handed out by [`FakePlatform`].
pub struct FakeAccess {
    key_system: String,
    configuration: KeySystemConfiguration,
    cdm: FakeCdm,
}

#[async_trait]
impl KeySystemAccess for FakeAccess {
    fn key_system(&self) -> String {
        self.key_system.clone()
    }

    fn configuration(&self) -> KeySystemConfiguration {
        self.configuration.clone()
    }

    async fn create_media_keys(&self) -> Result<Arc<dyn MediaKeys>, CdmError> {
        if let Some(e) = self.cdm.behavior().create_media_keys_error {
            return Err(e);
        }
        Ok(self.cdm.media_keys())
    }
}

/// Fake negotiation capability supporting a fixed set of concrete key systems.
pub struct FakePlatform {
    cdm: FakeCdm,
    supported: Vec<String>,
    negotiation_delay: Option<Duration>,
    requests: Mutex<Vec<(String, Vec<KeySystemConfiguration>)>>,
}

impl FakePlatform {
    pub fn new<I, S>(cdm: FakeCdm, supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cdm,
            supported: supported.into_iter().map(Into::into).collect(),
            negotiation_delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_negotiation_delay(mut self, delay: Duration) -> Self {
        self.negotiation_delay = Some(delay);
        self
    }

    /// Concrete key systems requested so far, in order.
    #[must_use]
    pub fn requested(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Configurations offered for `key_system` on its last request.
    #[must_use]
    pub fn offered_configurations(&self, key_system: &str) -> Vec<KeySystemConfiguration> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key_system)
            .map(|(_, c)| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KeySystemPlatform for FakePlatform {
    async fn request_key_system_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> Result<Arc<dyn KeySystemAccess>, CdmError> {
        self.requests
            .lock()
            .push((key_system.to_string(), configurations.to_vec()));
        if let Some(delay) = self.negotiation_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.supported.iter().any(|k| k == key_system) {
            return Err(CdmError::not_supported(format!("{key_system} unsupported")));
        }
        let Some(configuration) = configurations.first() else {
            return Err(CdmError::not_supported("no configuration offered"));
        };
        Ok(Arc::new(FakeAccess {
            key_system: key_system.to_string(),
            configuration: configuration.clone(),
            cdm: self.cdm.clone(),
        }))
    }
}

/// Fake media element.
#[derive(Default)]
pub struct FakeMediaSink {
    error: Option<CdmError>,
    attachments: Mutex<Vec<bool>>,
}

impl FakeMediaSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing(error: CdmError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    /// For each `set_media_keys` call, whether keys were set (`true`) or cleared.
    #[must_use]
    pub fn attachments(&self) -> Vec<bool> {
        self.attachments.lock().clone()
    }
}

#[async_trait]
impl MediaSink for FakeMediaSink {
    async fn set_media_keys(&self, media_keys: Option<Arc<dyn MediaKeys>>) -> Result<(), CdmError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        self.attachments.lock().push(media_keys.is_some());
        Ok(())
    }
}

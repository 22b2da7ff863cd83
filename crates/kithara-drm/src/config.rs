#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use derivative::Derivative;
use derive_setters::Setters;
use tokio_util::sync::CancellationToken;

use crate::{
    cdm::{MessageType, SessionType},
    close::CloseTimings,
    events::EventBus,
    key_status::KeyStatusPolicy,
    license::{LicenseCallback, LicensePolicy, LicenseResponse},
    storage::PersistentStorage,
};

/// One key system candidate, in priority order within [`DecryptorConfig`].
///
/// ```ignore
/// let option = KeySystemOption::new("widevine", |challenge, _| fetch(challenge))
///     .with_persistent_license(true)
///     .with_persistent_storage(Arc::new(JsonFileStorage::new(path)));
/// ```
#[derive(Clone, Derivative, Setters)]
#[derivative(Debug)]
#[setters(prefix = "with_", strip_option)]
pub struct KeySystemOption {
    /// Logical name ("widevine", "playready", "clearkey", "fairplay") or a
    /// concrete key system identifier.
    #[setters(skip)]
    pub key_system: String,
    #[derivative(Debug = "ignore")]
    #[setters(skip)]
    pub get_license: LicenseCallback,
    pub license: LicensePolicy,
    /// Applied once to the CDM before any session is created.
    pub server_certificate: Option<Bytes>,
    /// Use `persistent-license` sessions and reload them across restarts.
    pub persistent_license: bool,
    /// Required for persistent licenses to survive the process.
    #[derivative(Debug = "ignore")]
    pub persistent_storage: Option<Arc<dyn PersistentStorage>>,
    /// Default: 1000.
    pub max_persistent_sessions: Option<usize>,
    pub distinctive_identifier_required: bool,
    /// Robustness ladder for video, strongest first. `None` uses the key system's defaults.
    pub video_robustnesses: Option<Vec<String>>,
    pub audio_robustnesses: Option<Vec<String>>,
    /// Reactions to expired, internal-error and output-restricted keys.
    pub key_status: KeyStatusPolicy,
}

const DEFAULT_MAX_PERSISTENT_SESSIONS: usize = 1000;

impl KeySystemOption {
    pub fn new<S, F>(key_system: S, get_license: F) -> Self
    where
        S: Into<String>,
        F: Fn(Bytes, MessageType) -> LicenseResponse + Send + Sync + 'static,
    {
        Self {
            key_system: key_system.into(),
            get_license: Arc::new(get_license),
            license: LicensePolicy::default(),
            server_certificate: None,
            persistent_license: false,
            persistent_storage: None,
            max_persistent_sessions: Some(DEFAULT_MAX_PERSISTENT_SESSIONS),
            distinctive_identifier_required: false,
            video_robustnesses: None,
            audio_robustnesses: None,
            key_status: KeyStatusPolicy::default(),
        }
    }

    /// Session category wanted for new sessions.
    #[must_use]
    pub fn session_type(&self) -> SessionType {
        if self.persistent_license {
            SessionType::PersistentLicense
        } else {
            SessionType::Temporary
        }
    }
}

/// Configuration of a [`ContentDecryptor`](crate::ContentDecryptor).
#[derive(Clone, Debug, Derivative, Setters)]
#[derivative(Default)]
#[setters(prefix = "with_", strip_option)]
pub struct DecryptorConfig {
    /// Candidates in priority order. The first one negotiated wins.
    pub key_systems: Vec<KeySystemOption>,
    /// Live session cap. `None` disables eviction. Default: 15.
    #[derivative(Default(value = "Some(15)"))]
    pub max_simultaneous_sessions: Option<usize>,
    pub close: CloseTimings,
    /// How long a loaded persistent session may take to report key statuses. Default: 100ms.
    #[derivative(Default(value = "Duration::from_millis(100)"))]
    pub key_status_wait: Duration,
    /// Capacity of the event bus created when `bus` is `None`. Default: 32.
    #[derivative(Default(value = "32"))]
    pub event_channel_capacity: usize,
    /// Publish to an existing bus instead of a fresh one.
    #[setters(rename = "with_events")]
    pub bus: Option<EventBus>,
    /// Parent cancellation token; cancelling it disposes the decryptor's work.
    pub cancel: Option<CancellationToken>,
}

impl DecryptorConfig {
    #[must_use]
    pub fn with_key_system(mut self, option: KeySystemOption) -> Self {
        self.key_systems.push(option);
        self
    }
}

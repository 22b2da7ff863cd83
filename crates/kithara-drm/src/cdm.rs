#![forbid(unsafe_code)]

//! Capability interface over the platform Content Decryption Module.
//!
//! Each platform variant provides one adapter implementing these traits.
//! Orchestration code only ever sees `Arc<dyn …>` handles.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::{error::CdmError, init_data::KeyId};

/// Session category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SessionType {
    /// In-memory only; the license is gone once the session closes.
    #[default]
    Temporary,
    /// Survives restarts through a stored session id.
    PersistentLicense,
}

impl SessionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::PersistentLicense => "persistent-license",
        }
    }
}

/// Kind of challenge emitted by a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LicenseRequest => "license-request",
            Self::LicenseRenewal => "license-renewal",
            Self::LicenseRelease => "license-release",
            Self::IndividualizationRequest => "individualization-request",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one key inside a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    OutputRestricted,
    OutputDownscaled,
    StatusPending,
    InternalError,
    UsableInFuture,
}

/// Notification emitted by a live session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// A challenge that must be forwarded to the license server.
    Message {
        message_type: MessageType,
        message: Bytes,
    },
    /// Key statuses changed; read them through [`MediaKeySession::key_statuses`].
    KeyStatusesChange,
}

/// One decryption session of the CDM.
#[async_trait]
pub trait MediaKeySession: Send + Sync {
    /// CDM-assigned identifier. Empty until a request was generated or a load succeeded.
    fn session_id(&self) -> String;

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)>;

    /// Subscribe to messages and key status changes.
    ///
    /// Events emitted before subscription are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    async fn generate_request(&self, init_data_type: &str, data: Bytes) -> Result<(), CdmError>;

    /// Load a persisted session. `Ok(false)` means the CDM has no such session.
    async fn load(&self, session_id: &str) -> Result<bool, CdmError>;

    async fn update(&self, response: Bytes) -> Result<(), CdmError>;

    /// Ask the CDM to close. Some CDMs never resolve this.
    async fn close(&self) -> Result<(), CdmError>;

    /// Resolves once the session is closed, whoever closed it.
    async fn closed(&self);
}

pub type SessionHandle = Arc<dyn MediaKeySession>;

/// A CDM instance.
#[async_trait]
pub trait MediaKeys: Send + Sync {
    fn create_session(&self, session_type: SessionType) -> Result<SessionHandle, CdmError>;

    /// `Ok(false)` when the CDM does not use server certificates.
    async fn set_server_certificate(&self, certificate: Bytes) -> Result<bool, CdmError>;
}

/// Requirement level for an optional CDM feature.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Requirement {
    Required,
    #[default]
    Optional,
    NotAllowed,
}

/// Content type and robustness requested for one media kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaCapability {
    pub content_type: String,
    /// Empty string means "any robustness".
    pub robustness: String,
}

impl MediaCapability {
    pub fn new<C: Into<String>, R: Into<String>>(content_type: C, robustness: R) -> Self {
        Self {
            content_type: content_type.into(),
            robustness: robustness.into(),
        }
    }
}

/// One candidate configuration offered during negotiation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySystemConfiguration {
    pub init_data_types: Vec<String>,
    pub session_types: Vec<SessionType>,
    pub persistent_state: Requirement,
    pub distinctive_identifier: Requirement,
    pub video_capabilities: Vec<MediaCapability>,
    pub audio_capabilities: Vec<MediaCapability>,
}

/// Successful negotiation result for one concrete key system.
#[async_trait]
pub trait KeySystemAccess: Send + Sync {
    fn key_system(&self) -> String;

    /// The configuration the platform accepted.
    fn configuration(&self) -> KeySystemConfiguration;

    async fn create_media_keys(&self) -> Result<Arc<dyn MediaKeys>, CdmError>;
}

/// Negotiation capability of the platform.
#[async_trait]
pub trait KeySystemPlatform: Send + Sync {
    async fn request_key_system_access(
        &self,
        key_system: &str,
        configurations: &[KeySystemConfiguration],
    ) -> Result<Arc<dyn KeySystemAccess>, CdmError>;
}

/// The media pipeline element a CDM is attached to.
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn set_media_keys(&self, media_keys: Option<Arc<dyn MediaKeys>>) -> Result<(), CdmError>;
}

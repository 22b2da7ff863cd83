#![forbid(unsafe_code)]

use std::{fmt, time::Duration};

use thiserror::Error;

use crate::events::DecryptorState;

/// Error classification surfaced to the rest of the player.
///
/// Every [`DrmError`] maps to exactly one code through [`DrmError::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum DrmErrorCode {
    IncompatibleKeySystems,
    CreateMediaKeysError,
    MediaKeysAttachmentError,
    KeyLoadError,
    KeyLoadTimeout,
    KeyGenerateRequestError,
    KeyUpdateError,
    KeyStatusChangeError,
    LicenseServerCertificateError,
    MultipleSessionsSameInitData,
    NoSessionCapacity,
    PersistentStorageError,
    CdmError,
    InvalidState,
    Cancelled,
    Disposed,
}

impl DrmErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IncompatibleKeySystems => "INCOMPATIBLE_KEYSYSTEMS",
            Self::CreateMediaKeysError => "CREATE_MEDIA_KEYS_ERROR",
            Self::MediaKeysAttachmentError => "MEDIA_KEYS_ATTACHMENT_ERROR",
            Self::KeyLoadError => "KEY_LOAD_ERROR",
            Self::KeyLoadTimeout => "KEY_LOAD_TIMEOUT",
            Self::KeyGenerateRequestError => "KEY_GENERATE_REQUEST_ERROR",
            Self::KeyUpdateError => "KEY_UPDATE_ERROR",
            Self::KeyStatusChangeError => "KEY_STATUS_CHANGE_ERROR",
            Self::LicenseServerCertificateError => "LICENSE_SERVER_CERTIFICATE_ERROR",
            Self::MultipleSessionsSameInitData => "MULTIPLE_SESSIONS_SAME_INIT_DATA",
            Self::NoSessionCapacity => "NO_SESSION_CAPACITY",
            Self::PersistentStorageError => "PERSISTENT_STORAGE_ERROR",
            Self::CdmError => "CDM_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Cancelled => "CANCELLED",
            Self::Disposed => "DISPOSED",
        }
    }
}

impl fmt::Display for DrmErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of failure reported by a CDM call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CdmErrorKind {
    /// The object is not in a state allowing the call (e.g. session already closed).
    InvalidState,
    NotSupported,
    QuotaExceeded,
    InvalidAccess,
    Other,
}

/// Error raised by the platform Content Decryption Module.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct CdmError {
    pub kind: CdmErrorKind,
    pub message: String,
}

impl CdmError {
    pub fn new<S: Into<String>>(kind: CdmErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::new(CdmErrorKind::InvalidState, message)
    }

    pub fn not_supported<S: Into<String>>(message: S) -> Self {
        Self::new(CdmErrorKind::NotSupported, message)
    }

    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::new(CdmErrorKind::Other, message)
    }

    /// Whether this is the "already closed" signal of a session.
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        self.kind == CdmErrorKind::InvalidState
    }
}

/// Failure returned by a license callback.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct LicenseError {
    pub message: String,
    /// Do not retry this request, even if retries remain.
    pub no_retry: bool,
    /// The attempt exceeded the configured per-attempt timeout.
    pub timed_out: bool,
}

impl LicenseError {
    pub fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            no_retry: false,
            timed_out: false,
        }
    }

    /// A failure that must not be retried.
    pub fn no_retry<S: Into<String>>(message: S) -> Self {
        Self {
            no_retry: true,
            ..Self::new(message)
        }
    }

    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self {
            timed_out: true,
            ..Self::new(format!("license request timed out after {limit:?}"))
        }
    }
}

/// Persistent storage backing errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StorageError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Crate-wide error.
#[derive(Clone, Debug, Error)]
pub enum DrmError {
    #[error("no key system could be negotiated (tried: {})", .tried.join(", "))]
    IncompatibleKeySystems { tried: Vec<String> },

    #[error("failed to create media keys: {0}")]
    CreateMediaKeys(CdmError),

    #[error("failed to attach media keys: {0}")]
    AttachMediaKeys(CdmError),

    /// License acquisition failed; `message` is the last callback failure verbatim.
    #[error("{message}")]
    KeyLoad { message: String, timed_out: bool },

    #[error("failed to generate license request: {0}")]
    KeyGenerateRequest(CdmError),

    #[error("failed to update session with license: {0}")]
    KeyUpdate(CdmError),

    #[error("key status change: {0}")]
    KeyStatusChange(String),

    #[error("server certificate rejected: {0}")]
    ServerCertificate(CdmError),

    #[error("a session already exists for compatible initialization data")]
    DuplicateSession,

    #[error("no session capacity: {unremovable} session(s) could not be evicted")]
    NoCapacity { unremovable: usize },

    #[error("persistent storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("CDM error: {0}")]
    Cdm(#[from] CdmError),

    #[error("operation not allowed in state {0:?}")]
    InvalidState(DecryptorState),

    #[error("operation cancelled")]
    Cancelled,

    #[error("decryptor disposed")]
    Disposed,
}

impl DrmError {
    #[must_use]
    pub fn code(&self) -> DrmErrorCode {
        match self {
            Self::IncompatibleKeySystems { .. } => DrmErrorCode::IncompatibleKeySystems,
            Self::CreateMediaKeys(_) => DrmErrorCode::CreateMediaKeysError,
            Self::AttachMediaKeys(_) => DrmErrorCode::MediaKeysAttachmentError,
            Self::KeyLoad {
                timed_out: true, ..
            } => DrmErrorCode::KeyLoadTimeout,
            Self::KeyLoad { .. } => DrmErrorCode::KeyLoadError,
            Self::KeyGenerateRequest(_) => DrmErrorCode::KeyGenerateRequestError,
            Self::KeyUpdate(_) => DrmErrorCode::KeyUpdateError,
            Self::KeyStatusChange(_) => DrmErrorCode::KeyStatusChangeError,
            Self::ServerCertificate(_) => DrmErrorCode::LicenseServerCertificateError,
            Self::DuplicateSession => DrmErrorCode::MultipleSessionsSameInitData,
            Self::NoCapacity { .. } => DrmErrorCode::NoSessionCapacity,
            Self::Storage(_) => DrmErrorCode::PersistentStorageError,
            Self::Cdm(_) => DrmErrorCode::CdmError,
            Self::InvalidState(_) => DrmErrorCode::InvalidState,
            Self::Cancelled => DrmErrorCode::Cancelled,
            Self::Disposed => DrmErrorCode::Disposed,
        }
    }

    /// Fatal errors stop the whole decryptor; everything else is scoped to
    /// one initialization data or one session.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::IncompatibleKeySystems { .. } | Self::CreateMediaKeys(_) | Self::AttachMediaKeys(_)
        )
    }

    /// Conditions that block work without being errors of the content.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity { .. } | Self::ServerCertificate(_) | Self::Storage(_)
        )
    }
}

pub type DrmResult<T> = Result<T, DrmError>;

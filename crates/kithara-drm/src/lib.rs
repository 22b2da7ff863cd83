#![forbid(unsafe_code)]

//! Content decryption orchestration for kithara.
//!
//! Drives a platform Content Decryption Module (CDM): negotiates a key
//! system, attaches the CDM to a media sink, turns initialization data
//! found in the content into key sessions, and exchanges license
//! challenges with a caller-supplied license callback.
//!
//! The CDM itself is abstracted behind the traits of [`cdm`], so the
//! orchestration runs unchanged on any platform binding (and on the
//! in-memory fake of `mock` in tests).
//!
//! # Sessions
//!
//! Sessions are keyed by [`KeySessionRecord`]: initialization data that
//! carries the same values, in any order, maps to the same session.
//! Open sessions live in a [`LoadedSessionsStore`] bounded by
//! [`DecryptorConfig::max_simultaneous_sessions`]; persistent-license
//! sessions are also recorded in a [`PersistentSessionsStore`] so they can
//! be reloaded on a later run.
//!
//! # Example
//!
//! ```ignore
//! let decryptor = ContentDecryptor::new(
//!     DecryptorConfig::default().with_key_system(KeySystemOption::new(
//!         "widevine",
//!         |challenge, _| LicenseResponse::pending(fetch_license(challenge)),
//!     )),
//!     platform,
//! );
//! decryptor.attach(sink).await?;
//! decryptor.on_initialization_data(init_data)?;
//! ```

pub mod cdm;
mod close;
mod config;
mod decryptor;
mod error;
mod events;
mod init_data;
mod key_status;
mod key_system;
mod license;
mod loaded;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
mod orchestrator;
mod persistent;
mod record;
mod storage;

pub use cdm::{
    KeyStatus, KeySystemAccess, KeySystemConfiguration, KeySystemPlatform, MediaKeySession,
    MediaKeys, MediaSink, MessageType, SessionEvent, SessionHandle, SessionType,
};
pub use close::{CloseOutcome, CloseTimings, close_session};
pub use config::{DecryptorConfig, KeySystemOption};
pub use decryptor::ContentDecryptor;
pub use error::{
    CdmError, CdmErrorKind, DrmError, DrmErrorCode, DrmResult, LicenseError, StorageError,
};
pub use events::{DecryptorState, DrmEvent, DrmIssue, EventBus};
pub use init_data::{InitData, InitDataValue, KeyId};
pub use key_status::{
    KeyStatusAction, KeyStatusPolicy, KeyStatusReport, evaluate_key_statuses, is_session_reusable,
    is_session_usable,
};
pub use key_system::{NegotiatedKeySystem, build_configurations, concrete_key_systems, negotiate};
pub use license::{
    LicenseCallback, LicenseOutcome, LicensePolicy, LicenseRequest, LicenseResponse,
    LicenseResult, RetryLimit, acquire_license,
};
pub use loaded::{LoadedSessionsStore, StoredSession};
pub use orchestrator::{
    OrchestratedSession, SessionLimits, SessionOutcome, SessionStores, create_or_load_session,
};
pub use persistent::{PersistentRecord, PersistentSessionsStore};
pub use record::{KeySessionRecord, hash_init_data};
pub use storage::{
    JsonFileStorage, MemoryStorage, PersistedSession, PersistedValue, PersistentStorage,
};

#![forbid(unsafe_code)]

//! Backing collaborators for [`PersistentSessionsStore`](crate::PersistentSessionsStore).

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StorageError;

/// One initialization data value as written to storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,
    /// Content hash of the decoded `data`; checked on load.
    pub hash: u64,
    /// Hex-encoded payload.
    pub data: String,
}

/// A persisted session as written to storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub session_id: String,
    pub init_data_type: String,
    pub values: Vec<PersistedValue>,
    /// Hex-encoded key ids.
    #[serde(default)]
    pub key_ids: Vec<String>,
    /// Unix time in milliseconds.
    #[serde(default)]
    pub creation_time: u64,
}

/// Durable backing of persistent sessions.
///
/// The whole list is read and written at once.
#[cfg_attr(test, unimock::unimock(api = PersistentStorageMock))]
pub trait PersistentStorage: Send + Sync {
    fn load(&self) -> Result<Vec<PersistedSession>, StorageError>;

    fn save(&self, sessions: &[PersistedSession]) -> Result<(), StorageError>;
}

/// Process-local storage. Useful for tests and for sharing between decryptor instances.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: Mutex<Vec<PersistedSession>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sessions(sessions: Vec<PersistedSession>) -> Self {
        Self {
            sessions: Mutex::new(sessions),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<PersistedSession> {
        self.sessions.lock().clone()
    }
}

impl PersistentStorage for MemoryStorage {
    fn load(&self) -> Result<Vec<PersistedSession>, StorageError> {
        Ok(self.sessions.lock().clone())
    }

    fn save(&self, sessions: &[PersistedSession]) -> Result<(), StorageError> {
        *self.sessions.lock() = sessions.to_vec();
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    version: u32,
    sessions: Vec<PersistedSession>,
}

const FILE_VERSION: u32 = 1;

/// Versioned JSON file, rewritten atomically on every save.
///
/// Missing or empty files load as an empty list. Unreadable content is
/// logged and treated as empty, so a corrupted file never blocks playback.
#[derive(Clone, Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentStorage for JsonFileStorage {
    fn load(&self) -> Result<Vec<PersistedSession>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(Vec::new());
        }

        let file: SessionsFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %self.path.display(), %e, "invalid persisted sessions file, ignoring");
                return Ok(Vec::new());
            }
        };
        if file.version != FILE_VERSION {
            warn!(
                path = %self.path.display(),
                version = file.version,
                "unsupported persisted sessions version, ignoring"
            );
            return Ok(Vec::new());
        }
        Ok(file.sessions)
    }

    fn save(&self, sessions: &[PersistedSession]) -> Result<(), StorageError> {
        let file = SessionsFile {
            version: FILE_VERSION,
            sessions: sessions.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, bytes)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

#![forbid(unsafe_code)]

use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    cdm::MediaKeySession,
    error::DrmResult,
    init_data::{InitData, InitDataValue, KeyId},
    record::{KeySessionRecord, hash_init_data},
    storage::{PersistedSession, PersistedValue, PersistentStorage},
};

/// A persisted session as held in memory.
#[derive(Clone, Debug)]
pub struct PersistentRecord {
    pub record: KeySessionRecord,
    pub session_id: String,
    /// Unix time in milliseconds.
    pub creation_time: u64,
}

impl PersistentRecord {
    fn from_persisted(persisted: PersistedSession) -> Option<Self> {
        let mut values = Vec::with_capacity(persisted.values.len());
        for value in persisted.values {
            let Ok(data) = hex::decode(&value.data) else {
                warn!(session_id = %persisted.session_id, "persisted value is not hex, skipping session");
                return None;
            };
            if hash_init_data(&data) != value.hash {
                warn!(session_id = %persisted.session_id, "persisted value hash mismatch, skipping session");
                return None;
            }
            values.push(InitDataValue {
                system_id: value.system_id,
                data: Bytes::from(data),
            });
        }
        let key_ids: Vec<KeyId> = persisted
            .key_ids
            .iter()
            .filter_map(|k| KeyId::from_hex(k))
            .collect();

        let init_data = InitData::new(persisted.init_data_type, values).with_key_ids(key_ids);
        Some(Self {
            record: KeySessionRecord::new(&init_data),
            session_id: persisted.session_id,
            creation_time: persisted.creation_time,
        })
    }

    fn to_persisted(&self) -> PersistedSession {
        PersistedSession {
            session_id: self.session_id.clone(),
            init_data_type: self.record.init_data_type().to_string(),
            values: self
                .record
                .values()
                .iter()
                .map(|v| PersistedValue {
                    system_id: v.system_id.clone(),
                    hash: hash_init_data(&v.data),
                    data: hex::encode(&v.data),
                })
                .collect(),
            key_ids: self.record.key_ids().iter().map(KeyId::to_hex).collect(),
            creation_time: self.creation_time,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Durable mapping from initialization data to persisted session ids.
///
/// ## Normative
/// - Entries are ordered least recently used first; `get_and_reuse` and
///   `add` move an entry to the back.
/// - Every mutation writes the whole list to storage. Storage failures are
///   returned but the in-memory state is kept.
/// - Only licensed sessions are added; callers check usability first.
pub struct PersistentSessionsStore {
    storage: Arc<dyn PersistentStorage>,
    entries: Mutex<Vec<PersistentRecord>>,
    max_sessions: Option<usize>,
}

impl PersistentSessionsStore {
    /// Open the store, loading what `storage` holds.
    ///
    /// Unreadable storage and malformed entries are skipped with a warning.
    pub fn new(storage: Arc<dyn PersistentStorage>, max_sessions: Option<usize>) -> Self {
        let entries = match storage.load() {
            Ok(sessions) => sessions
                .into_iter()
                .filter_map(PersistentRecord::from_persisted)
                .collect(),
            Err(e) => {
                warn!(%e, "failed to load persisted sessions, starting empty");
                Vec::new()
            }
        };
        Self {
            storage,
            entries: Mutex::new(entries),
            max_sessions,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<PersistentRecord> {
        self.entries.lock().clone()
    }

    /// Compatible entry, without touching its recency.
    #[must_use]
    pub fn get(&self, init_data: &InitData) -> Option<PersistentRecord> {
        let record = KeySessionRecord::new(init_data);
        self.entries
            .lock()
            .iter()
            .find(|e| e.record.is_compatible_with(&record))
            .cloned()
    }

    /// Compatible entry, marked as most recently used.
    #[must_use]
    pub fn get_and_reuse(&self, init_data: &InitData) -> Option<PersistentRecord> {
        self.get_and_reuse_record(&KeySessionRecord::new(init_data))
    }

    pub(crate) fn get_and_reuse_record(
        &self,
        record: &KeySessionRecord,
    ) -> Option<PersistentRecord> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .position(|e| e.record.is_compatible_with(record))?;
        let entry = entries.remove(pos);
        entries.push(entry.clone());
        if let Err(e) = self.save(&entries) {
            warn!(%e, "failed to persist session order");
        }
        Some(entry)
    }

    #[must_use]
    pub fn get_by_key_id(&self, key_id: &KeyId) -> Option<PersistentRecord> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.record.is_associated_with_key_id(key_id))
            .cloned()
    }

    /// Persist `session` for `record` once it holds a license.
    ///
    /// Replaces any entry for a compatible record or for the same session id.
    /// A session without id is ignored.
    ///
    /// # Errors
    ///
    /// [`DrmError::Storage`](crate::DrmError::Storage) when writing fails.
    pub fn add(
        &self,
        record: &KeySessionRecord,
        key_ids: &[KeyId],
        session: &dyn MediaKeySession,
    ) -> DrmResult<()> {
        let session_id = session.session_id();
        if session_id.is_empty() {
            warn!("refusing to persist a session without id");
            return Ok(());
        }
        record.associate_key_ids(key_ids.iter().cloned());

        let mut entries = self.entries.lock();
        entries.retain(|e| e.session_id != session_id && !e.record.is_compatible_with(record));
        entries.push(PersistentRecord {
            record: record.clone(),
            session_id: session_id.clone(),
            creation_time: now_millis(),
        });
        if let Some(max) = self.max_sessions
            && entries.len() > max
        {
            let excess = entries.len() - max;
            debug!(excess, max, "dropping least recently used persisted sessions");
            entries.drain(..excess);
        }
        trace!(%session_id, len = entries.len(), "session persisted");
        self.save(&entries)
    }

    /// Remove the entry for `session_id`.
    ///
    /// # Errors
    ///
    /// [`DrmError::Storage`](crate::DrmError::Storage) when writing fails.
    pub fn delete(&self, session_id: &str) -> DrmResult<bool> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.session_id != session_id);
        if entries.len() == before {
            return Ok(false);
        }
        debug!(%session_id, "persisted session deleted");
        self.save(&entries)?;
        Ok(true)
    }

    /// Remove the `count` least recently used entries.
    ///
    /// # Errors
    ///
    /// [`DrmError::Storage`](crate::DrmError::Storage) when writing fails.
    pub fn delete_old_sessions(&self, count: usize) -> DrmResult<()> {
        let mut entries = self.entries.lock();
        let count = count.min(entries.len());
        if count == 0 {
            return Ok(());
        }
        entries.drain(..count);
        self.save(&entries)
    }

    fn save(&self, entries: &[PersistentRecord]) -> DrmResult<()> {
        let sessions: Vec<PersistedSession> =
            entries.iter().map(PersistentRecord::to_persisted).collect();
        self.storage.save(&sessions)?;
        Ok(())
    }
}

impl fmt::Debug for PersistentSessionsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentSessionsStore")
            .field("len", &self.len())
            .field("max_sessions", &self.max_sessions)
            .finish_non_exhaustive()
    }
}

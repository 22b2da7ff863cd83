#![forbid(unsafe_code)]

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Instant,
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    cdm::{MediaKeys, SessionHandle, SessionType},
    close::{self, CloseTimings},
    error::{DrmError, DrmResult},
    init_data::InitData,
    record::KeySessionRecord,
};

/// A live session together with the record it was created for.
#[derive(Clone)]
pub struct StoredSession {
    pub record: KeySessionRecord,
    pub session: SessionHandle,
    pub session_type: SessionType,
    pub created_at: Instant,
}

impl fmt::Debug for StoredSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSession")
            .field("record", &self.record)
            .field("session_id", &self.session.session_id())
            .field("session_type", &self.session_type)
            .finish_non_exhaustive()
    }
}

struct Entry {
    stored: StoredSession,
    /// Logical clock value of the last creation or reuse.
    last_touch: u64,
    /// Stops the closed-notification watcher once the entry leaves the store.
    watcher: CancellationToken,
}

#[derive(Default)]
struct StoreState {
    clock: u64,
    entries: Vec<Entry>,
}

impl StoreState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position_of(&self, session: &SessionHandle) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| Arc::ptr_eq(&e.stored.session, session))
    }

    fn remove(&mut self, session: &SessionHandle) -> Option<Entry> {
        let pos = self.position_of(session)?;
        let entry = self.entries.remove(pos);
        entry.watcher.cancel();
        Some(entry)
    }
}

/// Bounded in-memory cache of live sessions.
///
/// ## Normative
/// - At most one entry per compatible [`KeySessionRecord`].
/// - A session closed by the CDM leaves the store on its own.
/// - Eviction picks the least recently created-or-reused entries and never
///   touches entries whose record is active.
/// - The lock is never held across an await.
#[derive(Clone)]
pub struct LoadedSessionsStore {
    media_keys: Arc<dyn MediaKeys>,
    state: Arc<Mutex<StoreState>>,
    close: CloseTimings,
}

impl LoadedSessionsStore {
    #[must_use]
    pub fn new(media_keys: Arc<dyn MediaKeys>, close: CloseTimings) -> Self {
        Self {
            media_keys,
            state: Arc::new(Mutex::new(StoreState::default())),
            close,
        }
    }

    /// Create a session for `init_data` and register it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`DrmError::DuplicateSession`] if a compatible record already has a
    /// session, [`DrmError::Cdm`] if the CDM refuses to create one.
    pub fn create_session(
        &self,
        init_data: &InitData,
        session_type: SessionType,
    ) -> DrmResult<StoredSession> {
        self.create_session_for_record(KeySessionRecord::new(init_data), session_type)
    }

    pub(crate) fn create_session_for_record(
        &self,
        record: KeySessionRecord,
        session_type: SessionType,
    ) -> DrmResult<StoredSession> {
        let mut state = self.state.lock();
        if state
            .entries
            .iter()
            .any(|e| e.stored.record.is_compatible_with(&record))
        {
            return Err(DrmError::DuplicateSession);
        }

        let session = self.media_keys.create_session(session_type)?;
        let stored = StoredSession {
            record,
            session,
            session_type,
            created_at: Instant::now(),
        };
        let watcher = CancellationToken::new();
        let last_touch = state.tick();
        state.entries.push(Entry {
            stored: stored.clone(),
            last_touch,
            watcher: watcher.clone(),
        });
        let len = state.entries.len();
        drop(state);

        trace!(session_type = session_type.as_str(), len, "session created");
        self.spawn_closed_watcher(Arc::clone(&stored.session), watcher);
        Ok(stored)
    }

    fn spawn_closed_watcher(&self, session: SessionHandle, watcher: CancellationToken) {
        let state: Weak<Mutex<StoreState>> = Arc::downgrade(&self.state);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = watcher.cancelled() => {}
                () = session.closed() => {
                    let Some(state) = state.upgrade() else {
                        return;
                    };
                    let removed = state.lock().remove(&session);
                    if removed.is_some() {
                        debug!(session_id = %session.session_id(), "session closed by the CDM, entry removed");
                    }
                }
            }
        });
    }

    /// Entry whose record is compatible with `init_data`, marked as recently used.
    #[must_use]
    pub fn reuse(&self, init_data: &InitData) -> Option<StoredSession> {
        self.reuse_record(&KeySessionRecord::new(init_data))
    }

    pub(crate) fn reuse_record(&self, record: &KeySessionRecord) -> Option<StoredSession> {
        let mut state = self.state.lock();
        let tick = state.tick();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.stored.record.is_compatible_with(record))?;
        entry.last_touch = tick;
        Some(entry.stored.clone())
    }

    #[must_use]
    pub fn get_entry_for_session(&self, session: &SessionHandle) -> Option<StoredSession> {
        let state = self.state.lock();
        state
            .position_of(session)
            .map(|pos| state.entries[pos].stored.clone())
    }

    /// Forget a session without closing it.
    ///
    /// Used for handles that never started a real CDM session.
    pub fn remove_session_without_closing(&self, session: &SessionHandle) -> bool {
        self.state.lock().remove(session).is_some()
    }

    /// Remove the session, then close it.
    ///
    /// Idempotent: returns `Ok(false)` when the session is not in the store.
    ///
    /// # Errors
    ///
    /// The CDM error when closing fails. The entry is removed regardless.
    pub async fn close_session(&self, session: &SessionHandle) -> DrmResult<bool> {
        let removed = self.state.lock().remove(session);
        let Some(entry) = removed else {
            trace!(session_id = %session.session_id(), "close requested for unknown session");
            return Ok(false);
        };
        close::close_session(entry.stored.session, &self.close).await?;
        Ok(true)
    }

    /// Close least recently used sessions until at most `limit` remain.
    ///
    /// Entries whose record is compatible with one of `active` are skipped.
    ///
    /// # Errors
    ///
    /// [`DrmError::NoCapacity`] when skipped entries keep the store over the
    /// limit. Removable entries are still closed in that case.
    pub async fn evict_to_limit(&self, limit: usize, active: &[KeySessionRecord]) -> DrmResult<()> {
        let (victims, unremovable) = {
            let mut state = self.state.lock();
            let len = state.entries.len();
            if len <= limit {
                return Ok(());
            }
            let excess = len - limit;

            let mut candidates: Vec<(u64, usize)> = state
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !active.iter().any(|a| e.stored.record.is_compatible_with(a)))
                .map(|(i, e)| (e.last_touch, i))
                .collect();
            candidates.sort_unstable();
            candidates.truncate(excess);

            let mut indices: Vec<usize> = candidates.into_iter().map(|(_, i)| i).collect();
            indices.sort_unstable_by(|a, b| b.cmp(a));
            let victims: Vec<Entry> = indices
                .into_iter()
                .map(|i| {
                    let entry = state.entries.remove(i);
                    entry.watcher.cancel();
                    entry
                })
                .collect();
            let unremovable = excess - victims.len();
            (victims, unremovable)
        };

        if !victims.is_empty() {
            debug!(count = victims.len(), limit, "evicting sessions");
        }
        self.close_entries(victims).await;

        if unremovable > 0 {
            warn!(unremovable, limit, "cannot evict active sessions");
            return Err(DrmError::NoCapacity { unremovable });
        }
        Ok(())
    }

    /// Close every session in the store.
    pub async fn close_all(&self) {
        let entries: Vec<Entry> = {
            let mut state = self.state.lock();
            state.entries.drain(..).collect()
        };
        for entry in &entries {
            entry.watcher.cancel();
        }
        self.close_entries(entries).await;
    }

    async fn close_entries(&self, entries: Vec<Entry>) {
        let closes = entries.into_iter().map(|entry| {
            let timings = self.close.clone();
            async move {
                let session_id = entry.stored.session.session_id();
                if let Err(e) = close::close_session(entry.stored.session, &timings).await {
                    warn!(%session_id, %e, "failed to close session");
                }
            }
        });
        join_all(closes).await;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry, least recently used first.
    #[must_use]
    pub fn get_all(&self) -> Vec<StoredSession> {
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state.entries.iter().collect();
        entries.sort_by_key(|e| e.last_touch);
        entries.into_iter().map(|e| e.stored.clone()).collect()
    }
}

impl fmt::Debug for LoadedSessionsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedSessionsStore")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

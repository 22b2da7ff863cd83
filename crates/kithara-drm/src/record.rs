#![forbid(unsafe_code)]

//! Identity of a piece of initialization data.

use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::init_data::{InitData, InitDataValue, KeyId};

/// Content hash of an initialization data payload.
///
/// First 8 bytes of the SHA-256 digest, big endian. Stable across processes,
/// which matters because it is persisted.
#[must_use]
pub fn hash_init_data(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// A value after normalization: hashed, ready for ordered comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct NormalizedValue {
    pub(crate) system_id: Option<String>,
    pub(crate) hash: u64,
    pub(crate) data: Bytes,
}

fn normalize(values: &[InitDataValue]) -> Vec<NormalizedValue> {
    let mut out: Vec<NormalizedValue> = values
        .iter()
        .map(|v| NormalizedValue {
            system_id: v.system_id.clone(),
            hash: hash_init_data(&v.data),
            data: v.data.clone(),
        })
        .collect();
    out.sort_by(|a, b| {
        a.system_id
            .cmp(&b.system_id)
            .then(a.hash.cmp(&b.hash))
            .then_with(|| a.data.cmp(&b.data))
    });
    out
}

struct RecordInner {
    init_data_type: String,
    values: Vec<InitDataValue>,
    normalized: OnceLock<Vec<NormalizedValue>>,
    key_ids: Mutex<Vec<KeyId>>,
}

/// Value-type identity for a piece of initialization data.
///
/// Cloning is cheap and clones share key-id associations. Records are
/// compared with [`is_compatible_with`](Self::is_compatible_with), never by
/// reference.
///
/// The normalized form (values sorted by system id, content hashed) is
/// computed on first comparison and cached: most records are never compared.
#[derive(Clone)]
pub struct KeySessionRecord {
    inner: Arc<RecordInner>,
}

impl KeySessionRecord {
    #[must_use]
    pub fn new(init_data: &InitData) -> Self {
        let record = Self {
            inner: Arc::new(RecordInner {
                init_data_type: init_data.init_data_type.clone(),
                values: init_data.values.clone(),
                normalized: OnceLock::new(),
                key_ids: Mutex::new(Vec::new()),
            }),
        };
        if let Some(key_ids) = &init_data.key_ids {
            record.associate_key_ids(key_ids.iter().cloned());
        }
        record
    }

    #[must_use]
    pub fn init_data_type(&self) -> &str {
        &self.inner.init_data_type
    }

    /// Values in arrival order.
    #[must_use]
    pub fn values(&self) -> &[InitDataValue] {
        &self.inner.values
    }

    pub(crate) fn normalized(&self) -> &[NormalizedValue] {
        self.inner.normalized.get_or_init(|| normalize(&self.inner.values))
    }

    /// Whether both records would make the CDM generate the same request.
    ///
    /// Same number of values, and each value pairs with one of equal system
    /// id and equal hash. Bytes are only compared when hashes match.
    #[must_use]
    pub fn is_compatible_with(&self, other: &KeySessionRecord) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        if self.inner.values.len() != other.inner.values.len() {
            return false;
        }
        self.normalized()
            .iter()
            .zip(other.normalized())
            .all(|(a, b)| a.system_id == b.system_id && a.hash == b.hash && a.data == b.data)
    }

    /// Convenience over [`is_compatible_with`](Self::is_compatible_with) for raw init data.
    #[must_use]
    pub fn is_compatible_with_init_data(&self, init_data: &InitData) -> bool {
        self.is_compatible_with(&KeySessionRecord::new(init_data))
    }

    /// Payload handed to `generateRequest`: normalized values concatenated.
    #[must_use]
    pub fn request_data(&self) -> Bytes {
        let normalized = self.normalized();
        if let [single] = normalized {
            return single.data.clone();
        }
        let mut buf = BytesMut::with_capacity(normalized.iter().map(|v| v.data.len()).sum());
        for value in normalized {
            buf.extend_from_slice(&value.data);
        }
        buf.freeze()
    }

    /// Remember key ids this record's session is known to carry.
    pub fn associate_key_ids<I: IntoIterator<Item = KeyId>>(&self, key_ids: I) {
        let mut known = self.inner.key_ids.lock();
        for id in key_ids {
            if !known.contains(&id) {
                known.push(id);
            }
        }
    }

    #[must_use]
    pub fn is_associated_with_key_id(&self, key_id: &KeyId) -> bool {
        self.inner.key_ids.lock().contains(key_id)
    }

    #[must_use]
    pub fn key_ids(&self) -> Vec<KeyId> {
        self.inner.key_ids.lock().clone()
    }
}

impl fmt::Debug for KeySessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySessionRecord")
            .field("init_data_type", &self.inner.init_data_type)
            .field("values", &self.inner.values.len())
            .field("key_ids", &self.inner.key_ids.lock().len())
            .finish()
    }
}

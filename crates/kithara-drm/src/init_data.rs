#![forbid(unsafe_code)]

use std::fmt;

use bytes::Bytes;

/// Identifier of a decryption key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Bytes);

impl KeyId {
    pub fn new<B: Into<Bytes>>(bytes: B) -> Self {
        Self(bytes.into())
    }

    /// Parse a hex-encoded key id. Returns `None` on invalid hex.
    #[must_use]
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str).ok().map(|b| Self(Bytes::from(b)))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

/// One initialization data payload, optionally tied to a protection system.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitDataValue {
    /// Protection system identifier (e.g. a PSSH system id), when known.
    pub system_id: Option<String>,
    pub data: Bytes,
}

impl InitDataValue {
    /// A value not tied to a specific system.
    pub fn new<B: Into<Bytes>>(data: B) -> Self {
        Self {
            system_id: None,
            data: data.into(),
        }
    }

    pub fn with_system_id<S: Into<String>, B: Into<Bytes>>(system_id: S, data: B) -> Self {
        Self {
            system_id: Some(system_id.into()),
            data: data.into(),
        }
    }
}

/// Initialization data observed in the content.
///
/// `values` may arrive in any order; identity is computed over the
/// normalized set (see [`KeySessionRecord`](crate::KeySessionRecord)).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitData {
    /// Format of the payloads, as understood by `generateRequest` ("cenc", "keyids", "webm").
    pub init_data_type: String,
    pub values: Vec<InitDataValue>,
    /// Key ids announced alongside the data (e.g. from the manifest), if any.
    pub key_ids: Option<Vec<KeyId>>,
}

impl InitData {
    pub fn new<S: Into<String>>(init_data_type: S, values: Vec<InitDataValue>) -> Self {
        Self {
            init_data_type: init_data_type.into(),
            values,
            key_ids: None,
        }
    }

    /// Shorthand for a single `cenc` payload with a system id.
    pub fn cenc<S: Into<String>, B: Into<Bytes>>(system_id: S, data: B) -> Self {
        Self::new("cenc", vec![InitDataValue::with_system_id(system_id, data)])
    }

    #[must_use]
    pub fn with_key_ids(mut self, key_ids: Vec<KeyId>) -> Self {
        self.key_ids = Some(key_ids);
        self
    }
}

//! Ghosts: the last server-acknowledged state of an object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The last server-acknowledged state of one object.
///
/// Version 0 means the object has never been synced. A missing ghost reads
/// back as [`Ghost::empty`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ghost {
    /// Object id within the bucket.
    pub key: String,
    /// Server version of `data`.
    pub version: u64,
    /// Object contents at `version`.
    pub data: Value,
}

impl Ghost {
    /// Creates a ghost.
    pub fn new(key: impl Into<String>, version: u64, data: Value) -> Self {
        Self {
            key: key.into(),
            version,
            data,
        }
    }

    /// Creates the never-synced ghost for `key`: version 0, empty object.
    pub fn empty(key: impl Into<String>) -> Self {
        Self::new(key, 0, Value::Object(Map::new()))
    }

    /// Returns true once the server has acknowledged some version.
    pub fn is_synced(&self) -> bool {
        self.version > 0
    }

    /// Returns true if a change starting at `sv` applies to this ghost.
    ///
    /// An unset start version matches a never-synced ghost.
    pub fn matches_start_version(&self, sv: Option<u64>) -> bool {
        sv.unwrap_or(0) == self.version
    }
}

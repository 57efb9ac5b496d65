//! Entity records mirrored from the daemon

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field name -> value. Ordered so serialized diffs are deterministic.
pub type Fields = BTreeMap<String, Value>;

/// Well-known field names
pub mod field {
    pub const HASH: &str = "hash";
    pub const NAME: &str = "name";
    pub const SIZE_BYTES: &str = "sizeBytes";
    pub const BYTES_DONE: &str = "bytesDone";
    pub const DOWN_RATE: &str = "downRate";
    pub const UP_RATE: &str = "upRate";
    pub const DOWN_TOTAL: &str = "downTotal";
    pub const UP_TOTAL: &str = "upTotal";
    pub const DIRECTORY: &str = "directory";
    pub const TAGS: &str = "tags";
    pub const TRACKERS: &str = "trackerURIs";
    pub const IS_ACTIVE: &str = "isActive";
    pub const IS_COMPLETE: &str = "isComplete";
    pub const IS_HASH_CHECKING: &str = "isHashChecking";
    pub const IS_OPEN: &str = "isOpen";
    pub const MESSAGE: &str = "message";
    pub const DATE_ADDED: &str = "dateAdded";
    pub const PEERS_CONNECTED: &str = "peersConnected";
    pub const SEEDS_CONNECTED: &str = "seedsConnected";

    pub const STATUS: &str = "status";
    pub const PERCENT_COMPLETE: &str = "percentComplete";
    pub const ETA: &str = "eta";
}

/// One torrent as known to the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub hash: String,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Entity {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            fields: Fields::new(),
        }
    }

    /// Builder-style setter, mostly for fixtures
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn u64_field(&self, name: &str) -> u64 {
        self.fields.get(name).and_then(Value::as_u64).unwrap_or(0)
    }

    pub fn bool_field(&self, name: &str) -> bool {
        self.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn str_field(&self, name: &str) -> &str {
        self.fields.get(name).and_then(Value::as_str).unwrap_or("")
    }

    fn string_list(&self, name: &str) -> Vec<String> {
        match self.fields.get(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn status(&self) -> Vec<String> {
        self.string_list(field::STATUS)
    }

    pub fn tags(&self) -> Vec<String> {
        self.string_list(field::TAGS)
    }

    pub fn trackers(&self) -> Vec<String> {
        self.string_list(field::TRACKERS)
    }

    pub fn directory(&self) -> &str {
        self.str_field(field::DIRECTORY)
    }

    pub fn size_bytes(&self) -> u64 {
        self.u64_field(field::SIZE_BYTES)
    }

    pub fn percent_complete(&self) -> f64 {
        self.fields
            .get(field::PERCENT_COMPLETE)
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

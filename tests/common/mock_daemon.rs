//! In-memory torrent daemon speaking the multicall subset the gateway uses
//!
//! `MockDaemon` implements `Transport` directly, so no HTTP is involved.
//! Tests mutate torrents between polls and flip the daemon offline to
//! exercise the connection bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use torrent_mirror::registry::TransportFactory;
use torrent_mirror::{MethodCall, MirrorError, Result, Transport};

/// One torrent as the daemon stores it
#[derive(Debug, Clone)]
pub struct MockTorrent {
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub done: u64,
    pub down_rate: u64,
    pub up_rate: u64,
    pub directory: String,
    /// Comma separated, as stored in `d.custom1`
    pub tags: String,
    pub trackers: Vec<String>,
    pub open: bool,
    pub active: bool,
    pub hashing: bool,
    pub message: String,
}

impl MockTorrent {
    pub fn seeding(hash: &str, size: u64) -> Self {
        Self {
            hash: hash.to_string(),
            name: format!("{}.iso", hash.to_lowercase()),
            size,
            done: size,
            down_rate: 0,
            up_rate: 0,
            directory: "/data/complete".to_string(),
            tags: String::new(),
            trackers: vec!["udp://tracker.example.org:1337/announce".to_string()],
            open: true,
            active: true,
            hashing: false,
            message: String::new(),
        }
    }

    pub fn downloading(hash: &str, size: u64, done: u64) -> Self {
        Self {
            done,
            directory: "/data/incoming".to_string(),
            ..Self::seeding(hash, size)
        }
    }

    pub fn with_tags(mut self, tags: &str) -> Self {
        self.tags = tags.to_string();
        self
    }

    pub fn in_directory(mut self, directory: &str) -> Self {
        self.directory = directory.to_string();
        self
    }

    /// Positional row in `PropertyMap::torrent_list` column order
    pub fn row(&self) -> Value {
        let flag = |b: bool| json!(if b { 1 } else { 0 });
        json!([
            self.hash,
            self.name,
            self.size,
            self.done,
            self.down_rate,
            self.up_rate,
            self.done,
            0,
            self.directory,
            self.tags,
            self.trackers.join("|||"),
            flag(self.active),
            flag(self.done >= self.size),
            flag(self.hashing),
            flag(self.open),
            self.message,
            "1700000000",
            3,
            1,
        ])
    }
}

#[derive(Default)]
pub struct MockDaemon {
    torrents: Mutex<BTreeMap<String, MockTorrent>>,
    /// Raw rows appended to every list response (for malformed-row tests)
    extra_rows: Mutex<Vec<Value>>,
    summary: Mutex<HashMap<String, u64>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl MockDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_torrents(torrents: Vec<MockTorrent>) -> Arc<Self> {
        let daemon = Self::new();
        for torrent in torrents {
            daemon.upsert(torrent);
        }
        daemon
    }

    pub fn upsert(&self, torrent: MockTorrent) {
        self.torrents.lock().insert(torrent.hash.clone(), torrent);
    }

    pub fn remove(&self, hash: &str) {
        self.torrents.lock().remove(hash);
    }

    pub fn update<F: FnOnce(&mut MockTorrent)>(&self, hash: &str, change: F) {
        if let Some(torrent) = self.torrents.lock().get_mut(hash) {
            change(torrent);
        }
    }

    pub fn torrent(&self, hash: &str) -> Option<MockTorrent> {
        self.torrents.lock().get(hash).cloned()
    }

    pub fn push_raw_row(&self, row: Value) {
        self.extra_rows.lock().push(row);
    }

    pub fn set_rates(&self, down: u64, up: u64) {
        let mut summary = self.summary.lock();
        summary.insert("throttle.global_down.rate".to_string(), down);
        summary.insert("throttle.global_up.rate".to_string(), up);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every method name received, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count_calls(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| m.as_str() == method).count()
    }

    fn answer(&self, call: &MethodCall) -> Result<Value> {
        let hash_param = || call.params.first().and_then(Value::as_str).unwrap_or_default();
        match call.method.as_str() {
            "d.multicall2" => {
                let mut rows: Vec<Value> = self.torrents.lock().values().map(MockTorrent::row).collect();
                rows.extend(self.extra_rows.lock().iter().cloned());
                Ok(Value::Array(rows))
            }
            "system.client_version" => Ok(json!("0.9.8")),
            "d.open" => {
                self.update(hash_param(), |t| t.open = true);
                Ok(json!(0))
            }
            "d.start" => {
                self.update(hash_param(), |t| t.active = true);
                Ok(json!(0))
            }
            "d.stop" => {
                self.update(hash_param(), |t| t.active = false);
                Ok(json!(0))
            }
            "d.close" => {
                self.update(hash_param(), |t| t.open = false);
                Ok(json!(0))
            }
            method if method.starts_with("throttle.") => {
                Ok(json!(self.summary.lock().get(method).copied().unwrap_or(0)))
            }
            method => Err(MirrorError::Fault {
                code: -506,
                message: format!("Method '{}' not defined", method),
            }),
        }
    }
}

#[async_trait]
impl Transport for MockDaemon {
    async fn send(&self, batch: &[MethodCall]) -> Result<Vec<Value>> {
        self.calls
            .lock()
            .extend(batch.iter().map(|c| c.method.clone()));
        if self.offline.load(Ordering::SeqCst) {
            return Err(MirrorError::Transport {
                message: "connection refused".to_string(),
            });
        }
        batch.iter().map(|call| self.answer(call)).collect()
    }
}

/// Hands out one `MockDaemon` per user, creating them on demand
#[derive(Default)]
pub struct MockDaemons {
    daemons: Mutex<HashMap<String, Arc<MockDaemon>>>,
}

impl MockDaemons {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, user: &str, daemon: Arc<MockDaemon>) {
        self.daemons.lock().insert(user.to_string(), daemon);
    }

    pub fn daemon(&self, user: &str) -> Arc<MockDaemon> {
        Arc::clone(
            self.daemons
                .lock()
                .entry(user.to_string())
                .or_insert_with(MockDaemon::new),
        )
    }
}

impl TransportFactory for MockDaemons {
    fn transport(&self, user_id: &str) -> Result<Arc<dyn Transport>> {
        Ok(self.daemon(user_id))
    }
}

//! Service events and the per-user event bus
//!
//! Every user graph owns one `EventBus`. Services publish typed
//! `ServiceEvent`s onto it and a transport layer (the daemon binary's JSON
//! lines sink, a websocket relay, ...) subscribes and forwards them.
//!
//! # Event Types
//!
//! - `CONNECTION_STATE_CHANGE` - gateway connected/disconnected
//! - `LIST_DIFF` - entity list changed since the last poll
//! - `TAXONOMY_DIFF` - aggregation changed since the last poll
//! - `HISTORY_SAMPLE` - new transfer summary sample
//! - `NOTIFICATION_COUNT_CHANGE` - notification totals changed
//!
//! Cross-service subscriptions do not go through the bus. They use
//! `Listeners`, a callback table whose entries are removed explicitly before
//! the publishing service is torn down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::aggregation::Patch;
use crate::model::Diff;
use crate::notifications::NotificationCount;
use crate::rollup::TransferSummary;

/// Event published on a user's bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEvent {
    ConnectionStateChange {
        connected: bool,
    },
    ListDiff {
        diff: Diff,
        id: u64,
    },
    TaxonomyDiff {
        patch: Patch,
        id: u64,
    },
    HistorySample {
        id: u64,
        summary: TransferSummary,
    },
    NotificationCountChange {
        count: NotificationCount,
    },
}

impl ServiceEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChange { .. } => "CONNECTION_STATE_CHANGE",
            Self::ListDiff { .. } => "LIST_DIFF",
            Self::TaxonomyDiff { .. } => "TAXONOMY_DIFF",
            Self::HistorySample { .. } => "HISTORY_SAMPLE",
            Self::NotificationCountChange { .. } => "NOTIFICATION_COUNT_CHANGE",
        }
    }
}

/// Broadcast bus for one user's graph
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ServiceEvent) {
        tracing::trace!("emit {}", event.name());
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Identifier returned by `Listeners::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Callback table for one event kind
///
/// Callbacks run synchronously in subscription order on the publishing
/// task, so a listener sees events in exactly the order they are produced.
pub struct Listeners<E: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Callback<E>)>>,
}

impl<E: ?Sized> Listeners<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn notify(&self, event: &E) {
        // Snapshot so a callback may unsubscribe without deadlocking
        let callbacks: Vec<Callback<E>> =
            self.entries.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

impl<E: ?Sized> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

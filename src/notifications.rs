//! Completion notifications
//!
//! `NotificationService` watches list diffs and records a `DownloadFinished`
//! notification whenever an entity's `isComplete` flag turns on. Storage is a
//! collaborator behind `NotificationStore`; only insert, update and find
//! are required of it.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::Result;
use crate::events::{EventBus, ServiceEvent};
use crate::model::{field, DiffEntry};
use crate::registry::{ServiceLookup, Subscription};
use crate::sync::ListChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    DownloadFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub kind: NotificationKind,
    pub read: bool,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationCount {
    pub total: usize,
    pub unread: usize,
}

/// Selection used by `find` and `update`
#[derive(Debug, Clone, Default)]
pub struct NotificationQuery {
    pub user_id: String,
    pub read: Option<bool>,
    /// Inclusive lower bound on `timestamp`
    pub since: Option<i64>,
    /// Exclusive upper bound on `timestamp`
    pub until: Option<i64>,
}

impl NotificationQuery {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        notification.user_id == self.user_id
            && self.read.map_or(true, |read| notification.read == read)
            && self.since.map_or(true, |since| notification.timestamp >= since)
            && self.until.map_or(true, |until| notification.timestamp < until)
    }
}

pub trait NotificationStore: Send + Sync {
    fn insert(&self, notification: Notification) -> Result<()>;

    /// Apply `change` to every match, returning how many were touched
    fn update(&self, query: &NotificationQuery, change: &dyn Fn(&mut Notification)) -> Result<usize>;

    /// Matches, newest first
    fn find(&self, query: &NotificationQuery) -> Result<Vec<Notification>>;
}

/// In-process store, the default when nothing persistent is configured
#[derive(Default)]
pub struct MemoryNotificationStore {
    entries: RwLock<Vec<Notification>>,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationStore for MemoryNotificationStore {
    fn insert(&self, notification: Notification) -> Result<()> {
        self.entries.write().push(notification);
        Ok(())
    }

    fn update(&self, query: &NotificationQuery, change: &dyn Fn(&mut Notification)) -> Result<usize> {
        let mut touched = 0;
        for notification in self.entries.write().iter_mut().filter(|n| query.matches(n)) {
            change(notification);
            touched += 1;
        }
        Ok(touched)
    }

    fn find(&self, query: &NotificationQuery) -> Result<Vec<Notification>> {
        let mut found: Vec<Notification> = self
            .entries
            .read()
            .iter()
            .filter(|n| query.matches(n))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(found)
    }
}

pub struct NotificationService {
    user_id: String,
    store: Arc<dyn NotificationStore>,
    bus: EventBus,
    count: Mutex<NotificationCount>,
    weak_self: Weak<NotificationService>,
}

impl NotificationService {
    pub fn new(user_id: impl Into<String>, store: Arc<dyn NotificationStore>, bus: EventBus) -> Arc<Self> {
        let user_id = user_id.into();
        Arc::new_cyclic(|weak_self| Self {
            user_id,
            store,
            bus,
            count: Mutex::new(NotificationCount::default()),
            weak_self: weak_self.clone(),
        })
    }

    /// Subscribe to the sync service's list diffs
    pub fn link(&self, lookup: ServiceLookup) -> Vec<Subscription> {
        let Some(sync) = lookup.sync() else {
            return Vec::new();
        };
        if let Err(e) = self.refresh_count() {
            tracing::warn!("[{}] Could not load notification counts: {}", self.user_id, e);
        }

        let weak = self.weak_self.clone();
        let id = sync.list_changed.subscribe(move |change: &ListChange| {
            if let Some(service) = weak.upgrade() {
                if let Err(e) = service.on_list_change(change) {
                    tracing::warn!("[{}] Notification update failed: {}", service.user_id, e);
                }
            }
        });

        let sync = Arc::downgrade(&sync);
        vec![Subscription::new("notifications<-sync.list_changed", move || {
            if let Some(sync) = sync.upgrade() {
                sync.list_changed.unsubscribe(id);
            }
        })]
    }

    pub fn count(&self) -> NotificationCount {
        *self.count.lock()
    }

    /// Page of notifications, newest first
    pub fn list(&self, start: usize, limit: usize) -> Result<Vec<Notification>> {
        let found = self.store.find(&NotificationQuery::user(&self.user_id))?;
        Ok(found.into_iter().skip(start).take(limit).collect())
    }

    /// Returns how many notifications changed
    pub fn mark_all_read(&self) -> Result<usize> {
        let query = NotificationQuery {
            read: Some(false),
            ..NotificationQuery::user(&self.user_id)
        };
        let touched = self.store.update(&query, &|n: &mut Notification| n.read = true)?;
        if touched > 0 {
            self.refresh_count()?;
        }
        Ok(touched)
    }

    fn on_list_change(&self, change: &ListChange) -> Result<()> {
        let mut inserted = 0;
        for (hash, entry) in &change.diff {
            let DiffEntry::Updated { data, .. } = entry else {
                continue;
            };
            // Updated entries carry only changed fields, so presence means the flag flipped
            let finished = data
                .get(field::IS_COMPLETE)
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !finished {
                continue;
            }
            let name = change
                .snapshot
                .get(hash)
                .map(|e| e.str_field(field::NAME).to_string())
                .unwrap_or_default();
            tracing::info!("[{}] Download finished: {} ({})", self.user_id, name, hash);
            self.store.insert(Notification {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: self.user_id.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                kind: NotificationKind::DownloadFinished,
                read: false,
                data: json!({ "hash": hash, "name": name }),
            })?;
            inserted += 1;
        }
        if inserted > 0 {
            self.refresh_count()?;
        }
        Ok(())
    }

    /// Recompute totals and publish them when they moved
    fn refresh_count(&self) -> Result<()> {
        let all = self.store.find(&NotificationQuery::user(&self.user_id))?;
        let next = NotificationCount {
            total: all.len(),
            unread: all.iter().filter(|n| !n.read).count(),
        };
        let changed = {
            let mut count = self.count.lock();
            std::mem::replace(&mut *count, next) != next
        };
        if changed {
            self.bus
                .emit(ServiceEvent::NotificationCountChange { count: next });
        }
        Ok(())
    }

    pub fn dispose(&self) {
        tracing::debug!("[{}] Notification service disposed", self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Diff, Entity, Snapshot};
    use std::collections::BTreeMap;

    fn change(id: u64, entries: Vec<(&str, DiffEntry)>) -> ListChange {
        let snapshot = Snapshot::new(
            id,
            vec![Entity::new("A").with(field::NAME, "ubuntu.iso")],
        );
        let diff: Diff = entries
            .into_iter()
            .map(|(hash, entry)| (hash.to_string(), entry))
            .collect();
        ListChange {
            id,
            diff,
            snapshot: Arc::new(snapshot),
        }
    }

    fn progress(pct: f64, complete: bool) -> DiffEntry {
        let mut data = BTreeMap::new();
        data.insert(field::PERCENT_COMPLETE.to_string(), json!(pct));
        if complete {
            data.insert(field::IS_COMPLETE.to_string(), json!(true));
        }
        DiffEntry::Updated {
            data,
            removed: Vec::new(),
        }
    }

    #[test]
    fn test_completion_creates_notification() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let service = NotificationService::new("alice", Arc::new(MemoryNotificationStore::new()), bus);

        service.on_list_change(&change(1, vec![("A", progress(55.5, false))])).unwrap();
        assert_eq!(service.count().total, 0);

        service.on_list_change(&change(2, vec![("A", progress(100.0, true))])).unwrap();
        assert_eq!(service.count(), NotificationCount { total: 1, unread: 1 });

        let list = service.list(0, 10).unwrap();
        assert_eq!(list[0].kind, NotificationKind::DownloadFinished);
        assert_eq!(list[0].data["name"], "ubuntu.iso");

        match rx.try_recv().unwrap() {
            ServiceEvent::NotificationCountChange { count } => assert_eq!(count.unread, 1),
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[test]
    fn test_rounded_full_progress_is_not_completion() {
        let service = NotificationService::new(
            "alice",
            Arc::new(MemoryNotificationStore::new()),
            EventBus::new(8),
        );
        // 999,999 of 1,000,000 bytes rounds to 100.00%
        service.on_list_change(&change(1, vec![("A", progress(100.0, false))])).unwrap();
        assert_eq!(service.count(), NotificationCount::default());

        service.on_list_change(&change(2, vec![("A", progress(100.0, true))])).unwrap();
        assert_eq!(service.count().total, 1);
    }

    #[test]
    fn test_mark_all_read() {
        let service = NotificationService::new(
            "alice",
            Arc::new(MemoryNotificationStore::new()),
            EventBus::new(8),
        );
        service.on_list_change(&change(1, vec![("A", progress(100.0, true))])).unwrap();
        service.on_list_change(&change(2, vec![("A", progress(100.0, true))])).unwrap();

        assert_eq!(service.mark_all_read().unwrap(), 2);
        assert_eq!(service.count(), NotificationCount { total: 2, unread: 0 });
        assert_eq!(service.mark_all_read().unwrap(), 0);
    }

    #[test]
    fn test_store_paging_and_time_range() {
        let store = MemoryNotificationStore::new();
        for ts in [10, 30, 20] {
            store
                .insert(Notification {
                    id: ts.to_string(),
                    user_id: "alice".into(),
                    timestamp: ts,
                    kind: NotificationKind::DownloadFinished,
                    read: false,
                    data: Value::Null,
                })
                .unwrap();
        }
        let query = NotificationQuery {
            since: Some(15),
            ..NotificationQuery::user("alice")
        };
        let ids: Vec<String> = store.find(&query).unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["30", "20"]);
        assert!(store.find(&NotificationQuery::user("bob")).unwrap().is_empty());
    }
}

//! Entity list synchronization
//!
//! Polls the gateway on a fixed interval, diffs the decoded list against the
//! previous snapshot and publishes `LIST_DIFF` when something changed. On
//! failure the next poll is delayed with the shared capped backoff.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::diff::compare;
use crate::config::BackoffConfig;
use crate::error::{MirrorError, Result};
use crate::events::{EventBus, Listeners, ServiceEvent};
use crate::model::{Diff, DiffStats, Snapshot};
use crate::registry::ServiceLookup;

/// Delivered to sibling services after every non-empty diff
#[derive(Debug, Clone)]
pub struct ListChange {
    pub id: u64,
    pub diff: Diff,
    pub snapshot: Arc<Snapshot>,
}

/// What a single poll did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another poll was still running
    Skipped,
    Unchanged { id: u64 },
    Changed { id: u64, stats: DiffStats },
}

pub struct SyncService {
    user_id: String,
    interval: Duration,
    backoff: BackoffConfig,
    bus: EventBus,
    lookup: OnceLock<ServiceLookup>,
    current: Mutex<Arc<Snapshot>>,
    in_flight: AtomicBool,
    error_count: AtomicU32,
    timer: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<SyncService>,
    pub list_changed: Listeners<ListChange>,
}

/// Clears the in-flight flag however the poll ends
pub(crate) struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    /// `None` while another holder has the flag set
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        (!flag.swap(true, Ordering::SeqCst)).then_some(Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncService {
    pub fn new(
        user_id: impl Into<String>,
        interval: Duration,
        backoff: BackoffConfig,
        bus: EventBus,
    ) -> Arc<Self> {
        let user_id = user_id.into();
        Arc::new_cyclic(|weak_self| Self {
            user_id,
            interval,
            backoff,
            bus,
            lookup: OnceLock::new(),
            current: Mutex::new(Arc::new(Snapshot::default())),
            in_flight: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            timer: Mutex::new(None),
            weak_self: weak_self.clone(),
            list_changed: Listeners::new(),
        })
    }

    /// Linking pass hook; later calls are ignored
    pub fn link(&self, lookup: ServiceLookup) {
        let _ = self.lookup.set(lookup);
    }

    /// Current snapshot, the initial state handed to new subscribers
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.lock())
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Fetch, diff, publish
    pub async fn poll(&self) -> Result<PollOutcome> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return Ok(PollOutcome::Skipped);
        };

        let gateway = self
            .lookup
            .get()
            .and_then(ServiceLookup::gateway)
            .ok_or_else(|| MirrorError::ServiceClosed {
                service: "gateway".to_string(),
            })?;

        let list = gateway.fetch_entity_list().await?;
        let next = Arc::new(Snapshot::new(list.id, list.entities));

        let diff = {
            let mut current = self.current.lock();
            let diff = compare(&current, &next);
            *current = Arc::clone(&next);
            diff
        };

        if diff.is_empty() {
            return Ok(PollOutcome::Unchanged { id: next.id });
        }

        let stats = DiffStats::of(&diff);
        tracing::debug!(
            "[{}] List diff {}: +{} -{} ~{}",
            self.user_id,
            next.id,
            stats.added,
            stats.removed,
            stats.updated
        );

        let change = ListChange {
            id: next.id,
            diff,
            snapshot: next,
        };
        self.list_changed.notify(&change);
        self.bus.emit(ServiceEvent::ListDiff {
            diff: change.diff,
            id: change.id,
        });

        Ok(PollOutcome::Changed {
            id: change.id,
            stats,
        })
    }

    /// Start the poll loop. Calling it twice keeps the first loop.
    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        *timer = Some(tokio::spawn(poll_loop(weak)));
        tracing::debug!("[{}] List polling started every {:?}", self.user_id, self.interval);
    }

    /// Out-of-band poll, e.g. right after a start/stop action
    pub fn poll_now(&self) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            if let Some(service) = weak.upgrade() {
                if let Err(e) = service.poll().await {
                    tracing::debug!("[{}] Immediate poll failed: {}", service.user_id, e);
                }
            }
        });
    }

    fn next_delay(&self, result: &Result<PollOutcome>) -> Duration {
        match result {
            Ok(_) => {
                self.error_count.store(0, Ordering::SeqCst);
                self.interval
            }
            Err(e) => {
                let errors = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = self.backoff.delay(errors);
                tracing::warn!(
                    "[{}] List poll failed ({} consecutive), retrying in {:?}: {}",
                    self.user_id,
                    errors,
                    delay,
                    e
                );
                delay
            }
        }
    }

    pub fn dispose(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.list_changed.clear();
        tracing::debug!("[{}] Sync service disposed", self.user_id);
    }
}

async fn poll_loop(weak: Weak<SyncService>) {
    loop {
        let delay = {
            let Some(service) = weak.upgrade() else {
                return;
            };
            let result = service.poll().await;
            service.next_delay(&result)
        };
        tokio::time::sleep(delay).await;
    }
}

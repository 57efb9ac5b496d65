//! Summary poller feeding the rollup store

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::store::{History, RollupStore};
use super::TransferSummary;
use crate::config::BackoffConfig;
use crate::error::{MirrorError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::registry::ServiceLookup;
use crate::sync::InFlight;

/// What a single summary poll did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// Another sample was still running
    Skipped,
    Sampled(TransferSummary),
}

pub struct RollupService {
    user_id: String,
    interval: Duration,
    backoff: BackoffConfig,
    bus: EventBus,
    lookup: OnceLock<ServiceLookup>,
    store: Mutex<RollupStore>,
    latest: Mutex<Option<TransferSummary>>,
    in_flight: AtomicBool,
    error_count: AtomicU32,
    timer: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<RollupService>,
}

impl RollupService {
    pub fn new(
        user_id: impl Into<String>,
        interval: Duration,
        backoff: BackoffConfig,
        store: RollupStore,
        bus: EventBus,
    ) -> Arc<Self> {
        let user_id = user_id.into();
        Arc::new_cyclic(|weak_self| Self {
            user_id,
            interval,
            backoff,
            bus,
            lookup: OnceLock::new(),
            store: Mutex::new(store),
            latest: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            error_count: AtomicU32::new(0),
            timer: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn link(&self, lookup: ServiceLookup) {
        let _ = self.lookup.set(lookup);
    }

    pub fn history(&self, era: &str) -> Option<History> {
        self.store.lock().get_history(era)
    }

    pub fn era_names(&self) -> Vec<String> {
        self.store
            .lock()
            .era_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Most recent summary, if any poll has succeeded
    pub fn latest(&self) -> Option<TransferSummary> {
        *self.latest.lock()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Fetch one summary, store it and publish `HISTORY_SAMPLE`
    pub async fn sample(&self) -> Result<SampleOutcome> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return Ok(SampleOutcome::Skipped);
        };

        let gateway = self
            .lookup
            .get()
            .and_then(ServiceLookup::gateway)
            .ok_or_else(|| MirrorError::ServiceClosed {
                service: "gateway".to_string(),
            })?;

        let summary = gateway.fetch_summary().await?;
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.record(summary, timestamp);
        Ok(SampleOutcome::Sampled(summary))
    }

    fn record(&self, summary: TransferSummary, timestamp: i64) {
        self.store
            .lock()
            .add_sample(summary.down_rate, summary.up_rate, timestamp);
        *self.latest.lock() = Some(summary);
        self.bus.emit(ServiceEvent::HistorySample {
            id: timestamp.max(0) as u64,
            summary,
        });
    }

    pub fn start(&self) {
        let mut timer = self.timer.lock();
        if timer.is_some() {
            return;
        }
        *timer = Some(tokio::spawn(sample_loop(self.weak_self.clone())));
        tracing::debug!("[{}] Summary polling started every {:?}", self.user_id, self.interval);
    }

    fn next_delay(&self, result: &Result<SampleOutcome>) -> Duration {
        match result {
            Ok(_) => {
                self.error_count.store(0, Ordering::SeqCst);
                self.interval
            }
            Err(e) => {
                let errors = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = self.backoff.delay(errors);
                tracing::debug!(
                    "[{}] Summary poll failed ({} consecutive), retrying in {:?}: {}",
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
        tracing::debug!("[{}] Rollup service disposed", self.user_id);
    }
}

async fn sample_loop(weak: Weak<RollupService>) {
    loop {
        let delay = {
            let Some(service) = weak.upgrade() else {
                return;
            };
            let result = service.sample().await;
            service.next_delay(&result)
        };
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::EraSpec;

    fn service(bus: EventBus) -> Arc<RollupService> {
        let store = RollupStore::new(EraSpec::default_table(), true).unwrap();
        RollupService::new("alice", Duration::from_secs(5), BackoffConfig::default(), store, bus)
    }

    #[test]
    fn test_record_stores_and_emits() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let service = service(bus);

        let summary = TransferSummary {
            down_rate: 7,
            up_rate: 3,
            ..Default::default()
        };
        service.record(summary, 1_000);

        let history = service.history("fiveMinute").unwrap();
        assert_eq!(history.download, vec![7]);
        assert_eq!(history.upload, vec![3]);
        assert_eq!(service.latest(), Some(summary));
        match rx.try_recv().unwrap() {
            ServiceEvent::HistorySample { id, summary: sent } => {
                assert_eq!(id, 1_000);
                assert_eq!(sent, summary);
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_sample_skipped_while_in_flight() {
        let service = service(EventBus::new(8));
        service.in_flight.store(true, Ordering::SeqCst);
        assert_eq!(service.sample().await.unwrap(), SampleOutcome::Skipped);
        assert!(service.history("fiveMinute").unwrap().is_empty());

        service.in_flight.store(false, Ordering::SeqCst);
        assert!(service.sample().await.is_err());
        assert!(!service.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sample_without_link_fails_and_backs_off() {
        let service = service(EventBus::new(8));
        let result = service.sample().await;
        assert!(result.is_err());
        assert_eq!(service.next_delay(&result), Duration::from_secs(1));
        assert_eq!(service.error_count(), 1);
    }
}

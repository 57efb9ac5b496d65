//! Daemon gateway
//!
//! `GatewayAdapter` is the only component that talks to a user's daemon.
//! Every operation goes through the user's `RequestSerializer` and is wrapped
//! by connection bookkeeping:
//!
//! ```text
//!             failure (errors += 1, retry after backoff)
//!   Connected ─────────────────────────────────────────► Disconnected ─┐
//!       ▲                                                     │        │ failure
//!       └──────────────── success (errors = 0) ───────────────┘ ◄──────┘
//! ```
//!
//! Only the edges emit `CONNECTION_STATE_CHANGE`; repeated failures only
//! bump the error count and re-arm the retry probe.
//!
//! While decoding a list response the gateway notifies three callback
//! tables in order: `list_start`, one `entity_decoded` per row, `list_end`.
//! Observers can aggregate incrementally without re-parsing the batch.

pub mod protocol;
pub mod transport;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::{BackoffConfig, SerializerConfig};
use crate::error::{MirrorError, Result};
use crate::events::{EventBus, Listeners, ServiceEvent};
use crate::model::{apply_reducers, Entity};
use crate::rollup::TransferSummary;
use crate::serializer::{RequestSerializer, SerializerStats};

pub use protocol::{Batch, MethodCall, PropertyMap, PropertySpec, Transform};
pub use transport::{HttpTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub error_count: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            error_count: 0,
        }
    }
}

/// Emitted before the first row of a list response is decoded
#[derive(Debug, Clone, Copy)]
pub struct ListStart {
    pub id: u64,
}

/// Emitted after the last row of a list response is decoded
#[derive(Debug, Clone, Copy)]
pub struct ListEnd {
    pub id: u64,
    pub count: usize,
    pub skipped: usize,
}

/// Decoded list response
#[derive(Debug, Clone)]
pub struct EntityList {
    pub id: u64,
    pub entities: Vec<Entity>,
}

const SUMMARY_GETTERS: [&str; 6] = [
    "throttle.global_down.rate",
    "throttle.global_up.rate",
    "throttle.global_down.total",
    "throttle.global_up.total",
    "throttle.global_down.max_rate",
    "throttle.global_up.max_rate",
];

/// Gateway construction parameters
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub view: String,
    pub backoff: BackoffConfig,
    pub serializer: SerializerConfig,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            view: "main".to_string(),
            backoff: BackoffConfig::default(),
            serializer: SerializerConfig::default(),
        }
    }
}

pub struct GatewayAdapter {
    user_id: String,
    serializer: RequestSerializer,
    properties: PropertyMap,
    view: String,
    backoff: BackoffConfig,
    connection: Mutex<ConnectionState>,
    retry: Mutex<Option<JoinHandle<()>>>,
    bus: EventBus,
    last_list_id: AtomicU64,
    weak_self: Weak<GatewayAdapter>,
    pub list_start: Listeners<ListStart>,
    pub entity_decoded: Listeners<Entity>,
    pub list_end: Listeners<ListEnd>,
}

impl GatewayAdapter {
    /// Create the gateway and its serializer worker. Must run inside tokio.
    pub fn new(
        user_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        options: GatewayOptions,
        bus: EventBus,
    ) -> Arc<Self> {
        let user_id = user_id.into();
        Arc::new_cyclic(|weak_self| Self {
            serializer: RequestSerializer::new(transport, options.serializer),
            properties: PropertyMap::torrent_list(),
            view: options.view,
            backoff: options.backoff,
            connection: Mutex::new(ConnectionState::default()),
            retry: Mutex::new(None),
            bus,
            last_list_id: AtomicU64::new(0),
            weak_self: weak_self.clone(),
            list_start: Listeners::new(),
            entity_decoded: Listeners::new(),
            list_end: Listeners::new(),
            user_id,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().status == ConnectionStatus::Connected
    }

    pub fn serializer_stats(&self) -> SerializerStats {
        self.serializer.stats()
    }

    pub fn has_pending_retry(&self) -> bool {
        self.retry.lock().is_some()
    }

    /// Fetch and decode the full entity list
    pub async fn fetch_entity_list(&self) -> Result<EntityList> {
        self.tracked("fetch_entity_list", async {
            let call = self.properties.list_call(&self.view);
            let mut values = self.serializer.call_batch(vec![call]).await?;
            let rows = match values.pop() {
                Some(Value::Array(rows)) => rows,
                _ => {
                    return Err(MirrorError::MalformedResponse {
                        message: "list response is not an array of rows".to_string(),
                    })
                }
            };
            Ok(self.decode_list(&rows))
        })
        .await
    }

    /// Fetch global transfer rates, totals and throttles
    pub async fn fetch_summary(&self) -> Result<TransferSummary> {
        self.tracked("fetch_summary", async {
            let batch: Batch = SUMMARY_GETTERS
                .iter()
                .map(|getter| MethodCall::new(*getter, vec![json!("")]))
                .collect();
            let values = self.serializer.call_batch(batch).await?;
            TransferSummary::from_values(&values)
        })
        .await
    }

    /// Cheap liveness check, used by the retry timer
    pub async fn probe(&self) -> Result<String> {
        self.tracked("probe", async {
            let version = self.serializer.call("system.client_version", vec![]).await?;
            Ok(version.as_str().unwrap_or_default().to_string())
        })
        .await
    }

    pub async fn start_entities(&self, hashes: &[String]) -> Result<()> {
        self.run_actions("start_entities", hashes, &["d.open", "d.start"])
            .await
    }

    pub async fn stop_entities(&self, hashes: &[String]) -> Result<()> {
        self.run_actions("stop_entities", hashes, &["d.stop", "d.close"])
            .await
    }

    async fn run_actions(&self, op: &'static str, hashes: &[String], methods: &[&str]) -> Result<()> {
        if hashes.is_empty() {
            return Ok(());
        }
        self.tracked(op, async {
            let batch: Batch = hashes
                .iter()
                .flat_map(|hash| {
                    methods
                        .iter()
                        .map(move |method| MethodCall::new(*method, vec![json!(hash)]))
                })
                .collect();
            self.serializer.call_batch(batch).await?;
            Ok(())
        })
        .await
    }

    fn decode_list(&self, rows: &[Value]) -> EntityList {
        let id = self.next_list_id();
        self.list_start.notify(&ListStart { id });

        let mut entities = Vec::with_capacity(rows.len());
        let mut skipped = 0;
        for row in rows {
            match self.properties.decode_row(row) {
                Ok(mut entity) => {
                    apply_reducers(&mut entity);
                    self.entity_decoded.notify(&entity);
                    entities.push(entity);
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("[{}] Skipping malformed entity record: {}", self.user_id, e);
                }
            }
        }

        self.list_end.notify(&ListEnd {
            id,
            count: entities.len(),
            skipped,
        });
        EntityList { id, entities }
    }

    /// Strictly increasing millisecond timestamp
    fn next_list_id(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut prev = self.last_list_id.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_list_id
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    async fn tracked<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match fut.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                // Serializer overflow and teardown say nothing about the daemon
                if e.is_transient() {
                    self.on_failure(op, &e);
                }
                Err(e)
            }
        }
    }

    fn on_success(&self) {
        let reconnected = {
            let mut conn = self.connection.lock();
            let was_failing = conn.error_count != 0;
            conn.error_count = 0;
            conn.status = ConnectionStatus::Connected;
            was_failing
        };
        if reconnected {
            tracing::info!("[{}] Daemon connection restored", self.user_id);
            self.bus
                .emit(ServiceEvent::ConnectionStateChange { connected: true });
        }
        if let Some(retry) = self.retry.lock().take() {
            retry.abort();
        }
    }

    fn on_failure(&self, op: &str, error: &MirrorError) {
        let error_count = {
            let mut conn = self.connection.lock();
            conn.error_count += 1;
            conn.status = ConnectionStatus::Disconnected;
            conn.error_count
        };
        if error_count == 1 {
            tracing::warn!("[{}] Daemon connection lost during {}: {}", self.user_id, op, error);
            self.bus
                .emit(ServiceEvent::ConnectionStateChange { connected: false });
        } else {
            tracing::debug!("[{}] {} failed ({} consecutive): {}", self.user_id, op, error_count, error);
        }
        self.schedule_retry(error_count);
    }

    fn schedule_retry(&self, error_count: u32) {
        let delay = self.backoff.delay(error_count);
        let weak = self.weak_self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(gateway) = weak.upgrade() else {
                return;
            };
            // Detach ourselves so the probe's own hooks can re-arm the timer
            drop(gateway.retry.lock().take());
            if let Err(e) = gateway.probe().await {
                tracing::debug!("[{}] Retry probe failed: {}", gateway.user_id, e);
            }
        });
        if let Some(previous) = self.retry.lock().replace(task) {
            previous.abort();
        }
    }

    /// Cancel timers, stop the serializer, drop every listener
    pub fn dispose(&self) {
        if let Some(retry) = self.retry.lock().take() {
            retry.abort();
        }
        self.serializer.shutdown();
        self.list_start.clear();
        self.entity_decoded.clear();
        self.list_end.clear();
        tracing::debug!("[{}] Gateway disposed", self.user_id);
    }
}

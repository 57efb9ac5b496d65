//! Per-user request serializer
//!
//! Guarantees at most one physical request to the daemon is outstanding for
//! a user. Callers are queued FIFO on a bounded channel drained by a single
//! worker task; the worker waits at least `min_spacing` after each response
//! before sending the next request.
//!
//! Each caller gets its own reply channel, so one failed request never
//! affects the others in the queue. A caller that gives up (drops its future)
//! while queued is skipped without touching the daemon.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SerializerConfig;
use crate::error::{MirrorError, Result};
use crate::gateway::protocol::{Batch, MethodCall};
use crate::gateway::transport::Transport;

struct Pending {
    batch: Batch,
    reply: oneshot::Sender<Result<Vec<Value>>>,
}

#[derive(Debug, Default)]
struct WorkerState {
    in_flight: AtomicBool,
    sent: AtomicU64,
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerStats {
    pub in_flight: bool,
    pub queued: usize,
    pub sent: u64,
}

pub struct RequestSerializer {
    tx: mpsc::Sender<Pending>,
    max_depth: usize,
    state: Arc<WorkerState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestSerializer {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, config: SerializerConfig) -> Self {
        let max_depth = config.max_queue_depth.max(1);
        let (tx, rx) = mpsc::channel(max_depth);
        let state = Arc::new(WorkerState::default());
        let worker = tokio::spawn(run_worker(
            transport,
            rx,
            config.min_spacing(),
            Arc::clone(&state),
        ));

        Self {
            tx,
            max_depth,
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Send a batch once every earlier caller has been served
    pub async fn call_batch(&self, batch: Batch) -> Result<Vec<Value>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Pending { batch, reply })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => MirrorError::QueueFull {
                    depth: self.max_depth,
                },
                mpsc::error::TrySendError::Closed(_) => MirrorError::ServiceClosed {
                    service: "request serializer".to_string(),
                },
            })?;

        rx.await.map_err(|_| MirrorError::ServiceClosed {
            service: "request serializer".to_string(),
        })?
    }

    /// Single call convenience
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let mut values = self
            .call_batch(vec![MethodCall::new(method, params)])
            .await?;
        values.pop().ok_or_else(|| MirrorError::MalformedResponse {
            message: format!("no result for {}", method),
        })
    }

    pub fn stats(&self) -> SerializerStats {
        SerializerStats {
            in_flight: self.state.in_flight.load(Ordering::SeqCst),
            queued: self.tx.max_capacity() - self.tx.capacity(),
            sent: self.state.sent.load(Ordering::SeqCst),
        }
    }

    /// Stop the worker. Queued callers fail with `ServiceClosed`; a request
    /// already on the wire is abandoned.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl Drop for RequestSerializer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<Pending>,
    min_spacing: Duration,
    state: Arc<WorkerState>,
) {
    let mut last_response: Option<Instant> = None;

    while let Some(pending) = rx.recv().await {
        if pending.reply.is_closed() {
            tracing::debug!("Skipping abandoned request");
            continue;
        }

        if let Some(last) = last_response {
            tokio::time::sleep_until(last + min_spacing).await;
        }

        state.in_flight.store(true, Ordering::SeqCst);
        let result = transport.send(&pending.batch).await;
        state.in_flight.store(false, Ordering::SeqCst);
        state.sent.fetch_add(1, Ordering::SeqCst);
        last_response = Some(Instant::now());

        if let Err(e) = &result {
            tracing::debug!("Request failed: {}", e);
        }
        let _ = pending.reply.send(result);
    }
}

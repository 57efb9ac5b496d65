//! Torrent Mirror: per-user synchronization engine for torrent daemons
//!
//! Keeps an in-memory mirror of a remote daemon's torrent list for each
//! user and publishes what changed as typed events.
//!
//! # Services
//!
//! Every user gets one graph, owned by the [`ServiceRegistry`]:
//!
//! - [`GatewayAdapter`] - the only component talking to the daemon; every
//!   request goes through the user's [`RequestSerializer`]
//! - [`SyncService`] - polls the list, diffs snapshots, emits `LIST_DIFF`
//! - [`AggregationService`] - counts entities while they decode, emits
//!   `TAXONOMY_DIFF`
//! - [`RollupService`] - samples transfer rates into a [`RollupStore`],
//!   emits `HISTORY_SAMPLE`
//! - [`NotificationService`] - records finished downloads, emits
//!   `NOTIFICATION_COUNT_CHANGE`
//!
//! # Example
//!
//! ```ignore
//! use torrent_mirror::{MirrorConfig, ServiceRegistry};
//!
//! let config = MirrorConfig::load_from(&path)?;
//! let registry = ServiceRegistry::from_config(config);
//! let mut events = registry.subscribe("alice")?;
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.name());
//! }
//! ```

pub mod aggregation;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod model;
pub mod notifications;
pub mod registry;
pub mod rollup;
pub mod serializer;
pub mod sink;
pub mod sync;

// Re-export commonly used types
pub use aggregation::{AggregationService, LocationNode, Patch, Taxonomy};
pub use config::{BackoffConfig, MirrorConfig, PollingConfig, RollupConfig, SerializerConfig};
pub use error::{MirrorError, Result};
pub use events::{EventBus, ListenerId, Listeners, ServiceEvent};
pub use gateway::{
    ConnectionState, ConnectionStatus, EntityList, GatewayAdapter, GatewayOptions, HttpTransport,
    MethodCall, Transport,
};
pub use model::{apply_diff, Diff, DiffEntry, Entity, Snapshot};
pub use notifications::{
    MemoryNotificationStore, Notification, NotificationCount, NotificationKind,
    NotificationService, NotificationStore,
};
pub use registry::{
    ServiceHandle, ServiceKind, ServiceLookup, ServiceRegistry, TransportFactory, UserServices,
};
pub use rollup::{EraSpec, History, RollupService, RollupStore, SampleOutcome, TransferSummary};
pub use serializer::{RequestSerializer, SerializerStats};
pub use sink::EventSink;
pub use sync::{compare, SyncService};

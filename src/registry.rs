//! Per-user service graphs
//!
//! The registry owns one graph per user: gateway, sync, aggregation, rollup
//! and notification services sharing one event bus. A graph is built on
//! first access in three steps. Every service is constructed without
//! references to its siblings, then a linking pass hands each one a
//! `ServiceLookup` of weak sibling handles, then the pollers start.
//! Subscriptions made while linking are recorded in order so teardown can
//! undo them in reverse before any service is disposed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::aggregation::AggregationService;
use crate::config::MirrorConfig;
use crate::error::{MirrorError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::gateway::{GatewayAdapter, GatewayOptions, HttpTransport, Transport};
use crate::notifications::{MemoryNotificationStore, NotificationService, NotificationStore};
use crate::rollup::{RollupService, RollupStore};
use crate::sync::SyncService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Gateway,
    Sync,
    Aggregation,
    Rollup,
    Notifications,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Gateway => write!(f, "gateway"),
            ServiceKind::Sync => write!(f, "sync"),
            ServiceKind::Aggregation => write!(f, "aggregation"),
            ServiceKind::Rollup => write!(f, "rollup"),
            ServiceKind::Notifications => write!(f, "notifications"),
        }
    }
}

/// A service returned by `ServiceRegistry::get`
#[derive(Clone)]
pub enum ServiceHandle {
    Gateway(Arc<GatewayAdapter>),
    Sync(Arc<SyncService>),
    Aggregation(Arc<AggregationService>),
    Rollup(Arc<RollupService>),
    Notifications(Arc<NotificationService>),
}

impl ServiceHandle {
    pub fn kind(&self) -> ServiceKind {
        match self {
            ServiceHandle::Gateway(_) => ServiceKind::Gateway,
            ServiceHandle::Sync(_) => ServiceKind::Sync,
            ServiceHandle::Aggregation(_) => ServiceKind::Aggregation,
            ServiceHandle::Rollup(_) => ServiceKind::Rollup,
            ServiceHandle::Notifications(_) => ServiceKind::Notifications,
        }
    }
}

/// Weak handles to every service of one user, given out by the linking pass
#[derive(Clone, Default)]
pub struct ServiceLookup {
    gateway: Weak<GatewayAdapter>,
    sync: Weak<SyncService>,
    aggregation: Weak<AggregationService>,
    rollup: Weak<RollupService>,
    notifications: Weak<NotificationService>,
}

impl ServiceLookup {
    pub fn gateway(&self) -> Option<Arc<GatewayAdapter>> {
        self.gateway.upgrade()
    }

    pub fn sync(&self) -> Option<Arc<SyncService>> {
        self.sync.upgrade()
    }

    pub fn aggregation(&self) -> Option<Arc<AggregationService>> {
        self.aggregation.upgrade()
    }

    pub fn rollup(&self) -> Option<Arc<RollupService>> {
        self.rollup.upgrade()
    }

    pub fn notifications(&self) -> Option<Arc<NotificationService>> {
        self.notifications.upgrade()
    }
}

/// Undo handle for one cross-service subscription
pub struct Subscription {
    source: &'static str,
    unsubscribe: Box<dyn FnOnce() + Send + Sync>,
}

impl Subscription {
    pub fn new<F>(source: &'static str, unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            source,
            unsubscribe: Box::new(unsubscribe),
        }
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn cancel(self) {
        (self.unsubscribe)();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("source", &self.source).finish()
    }
}

/// Where a user's daemon transport comes from
pub trait TransportFactory: Send + Sync {
    fn transport(&self, user_id: &str) -> Result<Arc<dyn Transport>>;
}

/// HTTP transports for the `[[users]]` listed in the configuration
pub struct ConfiguredTransports {
    config: MirrorConfig,
}

impl ConfiguredTransports {
    pub fn new(config: MirrorConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for ConfiguredTransports {
    fn transport(&self, user_id: &str) -> Result<Arc<dyn Transport>> {
        let endpoint = self
            .config
            .user(user_id)
            .ok_or_else(|| MirrorError::UnknownUser {
                user: user_id.to_string(),
            })?;
        let transport =
            HttpTransport::new(&endpoint.endpoint, Duration::from_millis(endpoint.timeout_ms))?;
        Ok(Arc::new(transport))
    }
}

/// One user's complete service graph
pub struct UserServices {
    pub user_id: String,
    pub bus: EventBus,
    pub gateway: Arc<GatewayAdapter>,
    pub sync: Arc<SyncService>,
    pub aggregation: Arc<AggregationService>,
    pub rollup: Arc<RollupService>,
    pub notifications: Arc<NotificationService>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl UserServices {
    pub fn handle(&self, kind: ServiceKind) -> ServiceHandle {
        match kind {
            ServiceKind::Gateway => ServiceHandle::Gateway(Arc::clone(&self.gateway)),
            ServiceKind::Sync => ServiceHandle::Sync(Arc::clone(&self.sync)),
            ServiceKind::Aggregation => ServiceHandle::Aggregation(Arc::clone(&self.aggregation)),
            ServiceKind::Rollup => ServiceHandle::Rollup(Arc::clone(&self.rollup)),
            ServiceKind::Notifications => {
                ServiceHandle::Notifications(Arc::clone(&self.notifications))
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.bus.subscribe()
    }

    /// Sources of the live cross-service subscriptions, in link order
    pub fn subscription_sources(&self) -> Vec<&'static str> {
        self.subscriptions.lock().iter().map(Subscription::source).collect()
    }

    /// Start torrents, then refresh the list without waiting for the poller
    pub async fn start_entities(&self, hashes: &[String]) -> Result<()> {
        self.gateway.start_entities(hashes).await?;
        self.sync.poll_now();
        Ok(())
    }

    /// Stop torrents, then refresh the list without waiting for the poller
    pub async fn stop_entities(&self, hashes: &[String]) -> Result<()> {
        self.gateway.stop_entities(hashes).await?;
        self.sync.poll_now();
        Ok(())
    }

    fn start(&self) {
        self.sync.start();
        self.rollup.start();
    }

    /// Unsubscribe in reverse, then dispose every service
    fn teardown(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions.into_iter().rev() {
            tracing::trace!("[{}] Unsubscribing {}", self.user_id, subscription.source());
            subscription.cancel();
        }
        self.sync.dispose();
        self.rollup.dispose();
        self.notifications.dispose();
        self.aggregation.dispose();
        self.gateway.dispose();
    }
}

pub struct ServiceRegistry {
    config: MirrorConfig,
    transports: Arc<dyn TransportFactory>,
    /// Shared collaborator store; `None` gives each user its own memory store
    notification_store: Option<Arc<dyn NotificationStore>>,
    autostart: bool,
    users: RwLock<HashMap<String, Arc<UserServices>>>,
}

impl ServiceRegistry {
    pub fn new(config: MirrorConfig, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            config,
            transports,
            notification_store: None,
            autostart: true,
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Registry using HTTP transports from the configured endpoints
    pub fn from_config(config: MirrorConfig) -> Self {
        let transports = Arc::new(ConfiguredTransports::new(config.clone()));
        Self::new(config, transports)
    }

    pub fn with_notification_store(mut self, store: Arc<dyn NotificationStore>) -> Self {
        self.notification_store = Some(store);
        self
    }

    /// Whether pollers start as soon as a graph is built (default true)
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// The user's graph, built on first access. Must run inside tokio.
    pub fn get_or_create(&self, user_id: &str) -> Result<Arc<UserServices>> {
        if let Some(services) = self.users.read().get(user_id) {
            return Ok(Arc::clone(services));
        }

        // Build under the write lock so a user never gets two gateways
        let mut users = self.users.write();
        if let Some(services) = users.get(user_id) {
            return Ok(Arc::clone(services));
        }
        tracing::info!("Creating service graph for {}", user_id);
        let services = Arc::new(self.build(user_id)?);
        users.insert(user_id.to_string(), Arc::clone(&services));
        drop(users);

        if self.autostart {
            services.start();
        }
        Ok(services)
    }

    fn build(&self, user_id: &str) -> Result<UserServices> {
        let transport = self.transports.transport(user_id)?;
        let bus = EventBus::default();
        let config = &self.config;

        let gateway = GatewayAdapter::new(
            user_id,
            transport,
            GatewayOptions {
                view: config.polling.view.clone(),
                backoff: config.backoff,
                serializer: config.serializer,
            },
            bus.clone(),
        );
        let sync = SyncService::new(
            user_id,
            config.polling.list_interval(),
            config.backoff,
            bus.clone(),
        );
        let aggregation = AggregationService::new(user_id, bus.clone());
        let store = RollupStore::new(config.rollup.era_table(), config.rollup.cascading)?;
        let rollup = RollupService::new(
            user_id,
            config.polling.summary_interval(),
            config.backoff,
            store,
            bus.clone(),
        );
        let notification_store = self
            .notification_store
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryNotificationStore::new()));
        let notifications = NotificationService::new(user_id, notification_store, bus.clone());

        let lookup = ServiceLookup {
            gateway: Arc::downgrade(&gateway),
            sync: Arc::downgrade(&sync),
            aggregation: Arc::downgrade(&aggregation),
            rollup: Arc::downgrade(&rollup),
            notifications: Arc::downgrade(&notifications),
        };
        let mut subscriptions = Vec::new();
        sync.link(lookup.clone());
        rollup.link(lookup.clone());
        subscriptions.extend(aggregation.link(lookup.clone()));
        subscriptions.extend(notifications.link(lookup));

        Ok(UserServices {
            user_id: user_id.to_string(),
            bus,
            gateway,
            sync,
            aggregation,
            rollup,
            notifications,
            subscriptions: Mutex::new(subscriptions),
        })
    }

    /// Existing graph without creating one
    pub fn lookup(&self, user_id: &str) -> Option<Arc<UserServices>> {
        self.users.read().get(user_id).cloned()
    }

    pub fn get(&self, user_id: &str, kind: ServiceKind) -> Result<ServiceHandle> {
        Ok(self.get_or_create(user_id)?.handle(kind))
    }

    /// Receiver for the user's events, creating the graph if needed
    pub fn subscribe(&self, user_id: &str) -> Result<broadcast::Receiver<ServiceEvent>> {
        Ok(self.get_or_create(user_id)?.subscribe())
    }

    /// Tear down a user's graph. Returns false if there was none.
    ///
    /// The entry leaves the map before teardown, so a concurrent `get` builds
    /// a fresh graph instead of receiving one being disposed.
    pub fn destroy(&self, user_id: &str) -> bool {
        let Some(services) = self.users.write().remove(user_id) else {
            return false;
        };
        services.teardown();
        tracing::info!("Destroyed service graph for {}", user_id);
        true
    }

    pub fn destroy_all(&self) {
        for user_id in self.active_users() {
            self.destroy(&user_id);
        }
    }

    pub fn active_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.users.read().keys().cloned().collect();
        users.sort();
        users
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MethodCall;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Offline;

    #[async_trait]
    impl Transport for Offline {
        async fn send(&self, _batch: &[MethodCall]) -> Result<Vec<Value>> {
            Err(MirrorError::Transport {
                message: "offline".into(),
            })
        }
    }

    struct OfflineFactory;

    impl TransportFactory for OfflineFactory {
        fn transport(&self, _user_id: &str) -> Result<Arc<dyn Transport>> {
            Ok(Arc::new(Offline))
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(MirrorConfig::default(), Arc::new(OfflineFactory)).with_autostart(false)
    }

    #[tokio::test]
    async fn test_get_is_lazy_and_stable() {
        let registry = registry();
        assert!(registry.active_users().is_empty());

        let first = registry.get_or_create("alice").unwrap();
        let second = registry.get_or_create("alice").unwrap();
        assert!(Arc::ptr_eq(&first.gateway, &second.gateway));
        assert_eq!(registry.active_users(), vec!["alice"]);

        let handle = registry.get("alice", ServiceKind::Rollup).unwrap();
        assert_eq!(handle.kind(), ServiceKind::Rollup);
    }

    #[tokio::test]
    async fn test_link_order_recorded() {
        let registry = registry();
        let services = registry.get_or_create("alice").unwrap();
        assert_eq!(
            services.subscription_sources(),
            vec![
                "aggregation<-gateway.list_start",
                "aggregation<-gateway.entity_decoded",
                "aggregation<-gateway.list_end",
                "notifications<-sync.list_changed",
            ]
        );
        assert_eq!(services.gateway.list_end.len(), 1);
        assert_eq!(services.sync.list_changed.len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_unsubscribes_and_removes() {
        let registry = registry();
        let services = registry.get_or_create("alice").unwrap();
        assert!(registry.destroy("alice"));
        assert!(!registry.destroy("alice"));

        assert!(services.subscription_sources().is_empty());
        assert!(services.gateway.list_start.is_empty());
        assert!(services.sync.list_changed.is_empty());
        assert!(registry.lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_get_after_destroy_builds_fresh_graph() {
        let registry = registry();
        let old = registry.get_or_create("alice").unwrap();
        assert!(registry.destroy("alice"));

        let fresh = registry.get_or_create("alice").unwrap();
        assert!(!Arc::ptr_eq(&old.gateway, &fresh.gateway));
        assert_eq!(fresh.gateway.list_end.len(), 1);
        assert_eq!(fresh.subscription_sources().len(), 4);
        assert!(old.gateway.list_end.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_destroy_tears_down_once() {
        let registry = registry();
        registry.get_or_create("alice").unwrap();

        let destroyed = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| registry.destroy("alice")))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().is_ok_and(|removed| removed))
                .filter(|&removed| removed)
                .count()
        });
        assert_eq!(destroyed, 1);
        assert!(registry.active_users().is_empty());
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let registry = registry();
        let alice = registry.get_or_create("alice").unwrap();
        let bob = registry.get_or_create("bob").unwrap();
        assert!(!Arc::ptr_eq(&alice.gateway, &bob.gateway));

        registry.destroy("alice");
        assert_eq!(registry.active_users(), vec!["bob"]);
        assert_eq!(bob.gateway.list_end.len(), 1);

        registry.destroy_all();
        assert!(registry.active_users().is_empty());
    }

    #[test]
    fn test_unknown_user_rejected_by_config_transports() {
        let transports = ConfiguredTransports::new(MirrorConfig::default());
        assert!(matches!(
            transports.transport("mallory"),
            Err(MirrorError::UnknownUser { .. })
        ));
    }
}

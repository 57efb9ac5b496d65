//! Common test utilities and fixtures for torrent-mirror integration tests
//!
//! This module provides:
//! - `MockDaemon`, an in-memory daemon implementing `Transport`
//! - `Replica`, a client-side mirror rebuilt from emitted events
//! - Registry and config builders tuned for paused-time tests

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod assertions;
pub mod mock_daemon;

use std::sync::Arc;

pub use assertions::*;
pub use mock_daemon::{MockDaemon, MockDaemons, MockTorrent};

use torrent_mirror::{MirrorConfig, ServiceRegistry, TransportFactory};

/// Defaults with a small request spacing
pub fn test_config() -> MirrorConfig {
    let mut config = MirrorConfig::default();
    config.serializer.min_spacing_ms = 10;
    config
}

/// Registry over mock daemons; pollers stay idle unless `autostart`
pub fn registry(daemons: &Arc<MockDaemons>, autostart: bool) -> ServiceRegistry {
    let transports: Arc<dyn TransportFactory> = Arc::clone(daemons) as Arc<dyn TransportFactory>;
    ServiceRegistry::new(test_config(), transports).with_autostart(autostart)
}

//! Event collection and consistency checks shared by integration tests

use serde_json::Value;
use tokio::sync::broadcast::Receiver;

use torrent_mirror::{apply_diff, aggregation::apply_patch, ServiceEvent, Snapshot, Taxonomy};

/// Everything currently buffered on the receiver
pub fn drain(rx: &mut Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn names(events: &[ServiceEvent]) -> Vec<&'static str> {
    events.iter().map(ServiceEvent::name).collect()
}

pub fn connection_changes(events: &[ServiceEvent]) -> Vec<bool> {
    events
        .iter()
        .filter_map(|e| match e {
            ServiceEvent::ConnectionStateChange { connected } => Some(*connected),
            _ => None,
        })
        .collect()
}

/// Client-side mirror rebuilt purely from events
pub struct Replica {
    pub snapshot: Snapshot,
    pub taxonomy: Value,
    pub list_ids: Vec<u64>,
    pub taxonomy_ids: Vec<u64>,
}

impl Default for Replica {
    fn default() -> Self {
        Self {
            snapshot: Snapshot::default(),
            taxonomy: serde_json::to_value(Taxonomy::default()).unwrap(),
            list_ids: Vec::new(),
            taxonomy_ids: Vec::new(),
        }
    }
}

impl Replica {
    pub fn apply(&mut self, event: &ServiceEvent) {
        match event {
            ServiceEvent::ListDiff { diff, id } => {
                self.snapshot = apply_diff(&self.snapshot, diff, *id);
                self.list_ids.push(*id);
                assert_consistent(&self.snapshot, &self.taxonomy);
            }
            ServiceEvent::TaxonomyDiff { patch, id } => {
                apply_patch(&mut self.taxonomy, patch).unwrap();
                self.taxonomy_ids.push(*id);
            }
            _ => {}
        }
    }

    pub fn apply_all(&mut self, events: &[ServiceEvent]) {
        for event in events {
            self.apply(event);
        }
    }

    pub fn status_count(&self, status: &str) -> u64 {
        self.taxonomy["statusCounts"][status].as_u64().unwrap_or(0)
    }
}

/// Taxonomy totals and location root must match the snapshot size
pub fn assert_consistent(snapshot: &Snapshot, taxonomy: &Value) {
    let entities = snapshot.len() as u64;
    assert_eq!(
        taxonomy["statusCounts"][""].as_u64(),
        Some(entities),
        "status total disagrees with snapshot {}",
        snapshot.id
    );
    assert_eq!(
        taxonomy["locationTree"]["containedCount"].as_u64(),
        Some(entities),
        "location root disagrees with snapshot {}",
        snapshot.id
    );
    assert_tree_sums(&taxonomy["locationTree"]);
}

/// Every node counts at least what its children count
pub fn assert_tree_sums(node: &Value) {
    let children = node["children"].as_array().cloned().unwrap_or_default();
    let sum: u64 = children.iter().filter_map(|c| c["containedCount"].as_u64()).sum();
    let own = node["containedCount"].as_u64().unwrap_or(0);
    assert!(own >= sum, "{} counts {} but children sum to {}", node["fullPath"], own, sum);
    for child in &children {
        assert_tree_sums(child);
    }
}

//! Running counters over one list cycle
//!
//! Every count/size map carries a `""` key holding the total. Entities
//! without tags are counted under `untagged`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::model::Entity;

pub const TOTAL_KEY: &str = "";
pub const UNTAGGED_KEY: &str = "untagged";

/// Directory tree node with counters for everything at or below it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationNode {
    pub name: String,
    pub full_path: String,
    pub children: Vec<LocationNode>,
    pub contained_count: u64,
    pub contained_size: u64,
}

impl LocationNode {
    pub fn root() -> Self {
        Self::default()
    }

    fn child(name: &str, full_path: String) -> Self {
        Self {
            name: name.to_string(),
            full_path,
            ..Default::default()
        }
    }

    /// Children are keyed by full path, so `data` and `/data` stay apart.
    /// They stay sorted by name so patches between cycles are stable.
    fn child_mut(&mut self, name: &str, full_path: &str) -> &mut LocationNode {
        let index = match self.children.binary_search_by(|c| {
            c.name
                .as_str()
                .cmp(name)
                .then_with(|| c.full_path.as_str().cmp(full_path))
        }) {
            Ok(i) => i,
            Err(i) => {
                self.children.insert(i, Self::child(name, full_path.to_string()));
                i
            }
        };
        &mut self.children[index]
    }

    fn add(&mut self, size: u64) -> Result<()> {
        self.contained_count = checked(self.contained_count, 1, &self.full_path)?;
        self.contained_size = checked(self.contained_size, size, &self.full_path)?;
        Ok(())
    }

    /// Walk/extend the tree along `directory`, counting at every node
    pub fn insert(&mut self, directory: &str, size: u64) -> Result<()> {
        let separator = if directory.contains('/') || !directory.contains('\\') {
            '/'
        } else {
            '\\'
        };
        let absolute = directory.starts_with(separator);

        self.add(size)?;
        let mut node = self;
        let mut full_path = String::new();
        for segment in directory.split(separator).filter(|s| !s.is_empty()) {
            if absolute || !full_path.is_empty() {
                full_path.push(separator);
            }
            full_path.push_str(segment);
            node = node.child_mut(segment, &full_path);
            node.add(size)?;
        }
        Ok(())
    }

    /// Entities located exactly at this node (not in a child)
    pub fn direct_count(&self) -> u64 {
        self.contained_count - self.children.iter().map(|c| c.contained_count).sum::<u64>()
    }

    pub fn find(&self, full_path: &str) -> Option<&LocationNode> {
        if self.full_path == full_path {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(full_path))
    }
}

fn checked(value: u64, delta: u64, what: &str) -> Result<u64> {
    value
        .checked_add(delta)
        .ok_or_else(|| MirrorError::Aggregation {
            message: format!("counter overflow at '{}'", what),
        })
}

fn bump(map: &mut BTreeMap<String, u64>, key: &str, delta: u64) -> Result<()> {
    let slot = map.entry(key.to_string()).or_insert(0);
    *slot = checked(*slot, delta, key)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Taxonomy {
    pub status_counts: BTreeMap<String, u64>,
    pub tag_counts: BTreeMap<String, u64>,
    pub tag_sizes: BTreeMap<String, u64>,
    pub tracker_counts: BTreeMap<String, u64>,
    pub tracker_sizes: BTreeMap<String, u64>,
    pub location_tree: LocationNode,
}

impl Default for Taxonomy {
    fn default() -> Self {
        let totals = || BTreeMap::from([(TOTAL_KEY.to_string(), 0)]);
        let mut tag_counts = totals();
        tag_counts.insert(UNTAGGED_KEY.to_string(), 0);
        let mut tag_sizes = totals();
        tag_sizes.insert(UNTAGGED_KEY.to_string(), 0);
        Self {
            status_counts: totals(),
            tag_counts,
            tag_sizes,
            tracker_counts: totals(),
            tracker_sizes: totals(),
            location_tree: LocationNode::root(),
        }
    }
}

impl Taxonomy {
    /// Count one decoded entity
    pub fn record(&mut self, entity: &Entity) -> Result<()> {
        let size = entity.size_bytes();

        bump(&mut self.status_counts, TOTAL_KEY, 1)?;
        for status in entity.status() {
            bump(&mut self.status_counts, &status, 1)?;
        }

        bump(&mut self.tag_counts, TOTAL_KEY, 1)?;
        bump(&mut self.tag_sizes, TOTAL_KEY, size)?;
        let tags = entity.tags();
        if tags.is_empty() {
            bump(&mut self.tag_counts, UNTAGGED_KEY, 1)?;
            bump(&mut self.tag_sizes, UNTAGGED_KEY, size)?;
        }
        for tag in &tags {
            bump(&mut self.tag_counts, tag, 1)?;
            bump(&mut self.tag_sizes, tag, size)?;
        }

        bump(&mut self.tracker_counts, TOTAL_KEY, 1)?;
        bump(&mut self.tracker_sizes, TOTAL_KEY, size)?;
        for tracker in entity.trackers() {
            bump(&mut self.tracker_counts, &tracker, 1)?;
            bump(&mut self.tracker_sizes, &tracker, size)?;
        }

        self.location_tree.insert(entity.directory(), size)
    }

    pub fn total(&self) -> u64 {
        self.status_counts.get(TOTAL_KEY).copied().unwrap_or(0)
    }

    pub fn status_count(&self, status: &str) -> u64 {
        self.status_counts.get(status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(hash: &str, dir: &str, size: u64, status: &[&str], tags: &[&str]) -> Entity {
        Entity::new(hash)
            .with("directory", dir)
            .with("sizeBytes", size)
            .with("status", json!(status))
            .with("tags", json!(tags))
            .with("trackerURIs", json!(["tracker.example.org"]))
    }

    fn assert_tree_invariant(node: &LocationNode) {
        let children: u64 = node.children.iter().map(|c| c.contained_count).sum();
        assert!(node.contained_count >= children, "{} undercounts", node.full_path);
        assert_eq!(node.contained_count, children + node.direct_count());
        for child in &node.children {
            assert_tree_invariant(child);
        }
    }

    #[test]
    fn test_counts() {
        let mut taxonomy = Taxonomy::default();
        taxonomy
            .record(&entity("A", "/data/iso", 100, &["seeding"], &["linux"]))
            .unwrap();
        taxonomy
            .record(&entity("B", "/data/iso", 50, &["downloading"], &[]))
            .unwrap();

        assert_eq!(taxonomy.total(), 2);
        assert_eq!(taxonomy.status_count("seeding"), 1);
        assert_eq!(taxonomy.status_count("downloading"), 1);
        assert_eq!(taxonomy.tag_counts["untagged"], 1);
        assert_eq!(taxonomy.tag_sizes["linux"], 100);
        assert_eq!(taxonomy.tracker_sizes["tracker.example.org"], 150);
    }

    #[test]
    fn test_location_tree() {
        let mut taxonomy = Taxonomy::default();
        taxonomy.record(&entity("A", "/data/iso", 100, &[], &[])).unwrap();
        taxonomy.record(&entity("B", "/data/movies", 10, &[], &[])).unwrap();
        taxonomy.record(&entity("C", "/data", 1, &[], &[])).unwrap();

        let root = &taxonomy.location_tree;
        assert_eq!(root.contained_count, 3);
        assert_eq!(root.contained_size, 111);
        let data = root.find("/data").unwrap();
        assert_eq!(data.contained_count, 3);
        assert_eq!(data.direct_count(), 1);
        assert_eq!(data.children.len(), 2);
        assert_eq!(data.children[0].name, "iso");
        assert_eq!(root.find("/data/movies").unwrap().contained_size, 10);
        assert_tree_invariant(root);
    }

    #[test]
    fn test_windows_and_relative_paths() {
        let mut node = LocationNode::root();
        node.insert("C:\\Downloads\\iso", 5).unwrap();
        node.insert("relative/dir", 1).unwrap();
        assert!(node.find("C:\\Downloads\\iso").is_some());
        assert!(node.find("relative/dir").is_some());
        assert_eq!(node.contained_count, 2);
    }

    #[test]
    fn test_relative_and_absolute_same_name_stay_apart() {
        let mut node = LocationNode::root();
        node.insert("/data/iso", 10).unwrap();
        node.insert("data", 3).unwrap();
        node.insert("data/iso", 1).unwrap();

        assert_eq!(node.children.len(), 2);
        let absolute = node.find("/data").unwrap();
        let relative = node.find("data").unwrap();
        assert_eq!((absolute.contained_count, absolute.contained_size), (1, 10));
        assert_eq!((relative.contained_count, relative.contained_size), (2, 4));
        assert_eq!(node.find("data/iso").unwrap().contained_size, 1);
        assert_eq!(node.find("/data/iso").unwrap().contained_size, 10);
        assert_tree_invariant(&node);
    }

    #[test]
    fn test_overflow_is_an_error() {
        let mut taxonomy = Taxonomy::default();
        taxonomy
            .record(&entity("A", "/x", u64::MAX, &[], &[]))
            .unwrap();
        let err = taxonomy.record(&entity("B", "/x", 1, &[], &[])).unwrap_err();
        assert!(matches!(err, MirrorError::Aggregation { .. }));
    }
}

//! Snapshots and list diffs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::entity::{Entity, Fields};

/// Complete known state of all entities at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: u64,
    pub entities: BTreeMap<String, Entity>,
}

impl Snapshot {
    pub fn new(id: u64, entities: impl IntoIterator<Item = Entity>) -> Self {
        Self {
            id,
            entities: entities.into_iter().map(|e| (e.hash.clone(), e)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&Entity> {
        self.entities.get(hash)
    }
}

/// Change to a single entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DiffEntry {
    /// New entity; carries every field
    Added { data: Fields },
    /// Entity gone
    Removed,
    /// Existing entity; carries changed or new fields and the names of
    /// fields it no longer has
    Updated {
        data: Fields,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        removed: Vec<String>,
    },
}

/// hash -> change
pub type Diff = BTreeMap<String, DiffEntry>;

/// Apply a diff to a snapshot, producing the successor snapshot
///
/// `apply_diff(&prev, &compare(&prev, &next), next.id) == next`
pub fn apply_diff(snapshot: &Snapshot, diff: &Diff, id: u64) -> Snapshot {
    let mut entities = snapshot.entities.clone();
    for (hash, entry) in diff {
        match entry {
            DiffEntry::Added { data } => {
                entities.insert(
                    hash.clone(),
                    Entity {
                        hash: hash.clone(),
                        fields: data.clone(),
                    },
                );
            }
            DiffEntry::Removed => {
                entities.remove(hash);
            }
            DiffEntry::Updated { data, removed } => {
                if let Some(entity) = entities.get_mut(hash) {
                    for name in removed {
                        entity.fields.remove(name);
                    }
                    for (name, value) in data {
                        entity.fields.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }
    Snapshot { id, entities }
}

/// Count of each action in a diff, for logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
}

impl DiffStats {
    pub fn of(diff: &Diff) -> Self {
        diff.values().fold(Self::default(), |mut stats, entry| {
            match entry {
                DiffEntry::Added { .. } => stats.added += 1,
                DiffEntry::Removed => stats.removed += 1,
                DiffEntry::Updated { .. } => stats.updated += 1,
            }
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_entry_wire_shape() {
        let mut diff = Diff::new();
        diff.insert("B".into(), DiffEntry::Removed);
        let value = serde_json::to_value(&diff).unwrap();
        assert_eq!(value, json!({"B": {"action": "removed"}}));
    }

    #[test]
    fn test_apply_update_keeps_untouched_fields() {
        let prev = Snapshot::new(1, [Entity::new("A").with("downRate", 0).with("name", "a")]);
        let mut data = Fields::new();
        data.insert("downRate".into(), json!(7));
        let mut diff = Diff::new();
        diff.insert("A".into(), DiffEntry::Updated { data, removed: Vec::new() });

        let next = apply_diff(&prev, &diff, 2);
        assert_eq!(next.id, 2);
        let a = next.get("A").unwrap();
        assert_eq!(a.get("downRate"), Some(&json!(7)));
        assert_eq!(a.get("name"), Some(&json!("a")));
    }
}

//! Snapshot comparison
//!
//! For every entity in the next snapshot: absent before means `Added`,
//! otherwise changed fields (deep equality) and vanished field names become
//! an `Updated` entry.
//!
//! Removals are only searched for when one could have happened. Every key of
//! `next` is either added or carried over, so
//! `next.len() == prev.len() - removed + added`; when the number of added
//! keys equals the growth exactly, nothing was removed and the scan over
//! `prev` is skipped.

use crate::model::{Diff, DiffEntry, Fields, Snapshot};

pub fn compare(prev: &Snapshot, next: &Snapshot) -> Diff {
    let mut diff = Diff::new();
    let mut added = 0usize;

    for (hash, entity) in &next.entities {
        match prev.entities.get(hash) {
            None => {
                added += 1;
                diff.insert(
                    hash.clone(),
                    DiffEntry::Added {
                        data: entity.fields.clone(),
                    },
                );
            }
            Some(old) => {
                let changed = changed_fields(&old.fields, &entity.fields);
                let removed = vanished_fields(&old.fields, &entity.fields);
                if !changed.is_empty() || !removed.is_empty() {
                    diff.insert(
                        hash.clone(),
                        DiffEntry::Updated {
                            data: changed,
                            removed,
                        },
                    );
                }
            }
        }
    }

    if removal_possible(prev.len(), next.len(), added) {
        for hash in prev.entities.keys() {
            if !next.entities.contains_key(hash) {
                diff.insert(hash.clone(), DiffEntry::Removed);
            }
        }
    }

    diff
}

fn removal_possible(prev_len: usize, next_len: usize, added: usize) -> bool {
    // next_len - prev_len == added  <=>  removed == 0
    next_len < prev_len || next_len - prev_len != added
}

/// Fields whose value differs, plus fields that appeared
fn changed_fields(old: &Fields, new: &Fields) -> Fields {
    new.iter()
        .filter(|(name, value)| old.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn vanished_fields(old: &Fields, new: &Fields) -> Vec<String> {
    old.keys().filter(|name| !new.contains_key(*name)).cloned().collect()
}

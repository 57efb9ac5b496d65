//! JSON patches between two aggregation states
//!
//! Thin layer over `json_patch` so callers see crate errors. Patches are
//! RFC 6902 operation lists addressed with JSON pointers.

use serde_json::Value;

use crate::error::{MirrorError, Result};

pub use json_patch::Patch;

/// Operations turning `old` into `new`
pub fn diff_values(old: &Value, new: &Value) -> Patch {
    json_patch::diff(old, new)
}

/// Apply `patch` in place. On error `target` is left as it was.
pub fn apply_patch(target: &mut Value, patch: &Patch) -> Result<()> {
    json_patch::patch(target, patch).map_err(|e| MirrorError::Aggregation {
        message: format!("patch rejected: {}", e),
    })
}

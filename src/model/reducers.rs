//! Derived fields
//!
//! Each reducer computes one field from raw wire fields. They run on every
//! decoded entity before diffing, so diffs carry derived values (a status
//! flip, a percent step) rather than raw counters.

use serde_json::{json, Value};

use super::entity::{field, Entity};

/// Pure function from an entity's raw fields to one derived value
pub struct Reducer {
    pub field: &'static str,
    pub compute: fn(&Entity) -> Value,
}

/// Derived fields, applied in order
pub const DERIVED_FIELDS: &[Reducer] = &[
    Reducer {
        field: field::PERCENT_COMPLETE,
        compute: percent_complete,
    },
    Reducer {
        field: field::ETA,
        compute: eta,
    },
    Reducer {
        field: field::STATUS,
        compute: status,
    },
];

/// Apply every reducer to the entity in place
pub fn apply_reducers(entity: &mut Entity) {
    for reducer in DERIVED_FIELDS {
        let value = (reducer.compute)(entity);
        entity.set(reducer.field, value);
    }
}

fn percent_complete(entity: &Entity) -> Value {
    let size = entity.u64_field(field::SIZE_BYTES);
    if size == 0 {
        return json!(0.0);
    }
    let done = entity.u64_field(field::BYTES_DONE).min(size);
    let percent = done as f64 / size as f64 * 100.0;
    // Two decimals keeps byte-level progress from producing a diff every poll
    json!((percent * 100.0).round() / 100.0)
}

/// Seconds until complete; -1 when stalled
fn eta(entity: &Entity) -> Value {
    let size = entity.u64_field(field::SIZE_BYTES);
    let done = entity.u64_field(field::BYTES_DONE);
    if done >= size {
        return json!(0);
    }
    let rate = entity.u64_field(field::DOWN_RATE);
    if rate == 0 {
        return json!(-1);
    }
    let remaining = size - done;
    json!(remaining.div_ceil(rate))
}

fn status(entity: &Entity) -> Value {
    let is_checking = entity.bool_field(field::IS_HASH_CHECKING);
    let is_complete = entity.bool_field(field::IS_COMPLETE);
    let is_open = entity.bool_field(field::IS_OPEN);
    let is_active = entity.bool_field(field::IS_ACTIVE);

    let mut flags: Vec<&str> = Vec::new();
    if is_checking {
        flags.push("checking");
    } else if is_open && is_active {
        flags.push(if is_complete { "seeding" } else { "downloading" });
    } else {
        flags.push("stopped");
    }

    if !entity.str_field(field::MESSAGE).is_empty() {
        flags.push("error");
    }
    if is_complete {
        flags.push("complete");
    }

    let transferring = entity.u64_field(field::DOWN_RATE) > 0 || entity.u64_field(field::UP_RATE) > 0;
    flags.push(if transferring { "active" } else { "inactive" });

    json!(flags)
}

//! Transfer history at several resolutions
//!
//! The era table is flat and ordered finest first. Each era keeps at most
//! `ceil(retention / interval)` samples.

pub mod service;
pub mod store;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::{MirrorError, Result};

pub use service::{RollupService, SampleOutcome};
pub use store::{History, RollupStore, Sample};

/// Global rates, totals and throttle limits of one daemon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub down_rate: u64,
    pub up_rate: u64,
    pub down_total: u64,
    pub up_total: u64,
    pub down_throttle: u64,
    pub up_throttle: u64,
}

impl TransferSummary {
    /// Decode the six summary getters, in request order
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let [down_rate, up_rate, down_total, up_total, down_throttle, up_throttle] = values else {
            return Err(MirrorError::MalformedResponse {
                message: format!("summary expects 6 values, got {}", values.len()),
            });
        };
        Ok(Self {
            down_rate: number(down_rate, "down rate")?,
            up_rate: number(up_rate, "up rate")?,
            down_total: number(down_total, "down total")?,
            up_total: number(up_total, "up total")?,
            down_throttle: number(down_throttle, "down throttle")?,
            up_throttle: number(up_throttle, "up throttle")?,
        })
    }
}

fn number(value: &Value, what: &str) -> Result<u64> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| MirrorError::MalformedResponse {
        message: format!("{} is not a non-negative integer: {}", what, value),
    })
}

/// One row of the era table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EraSpec {
    pub name: String,
    pub interval_ms: u64,
    pub retention_ms: u64,
}

impl EraSpec {
    pub fn new(name: impl Into<String>, interval: Duration, retention: Duration) -> Self {
        Self {
            name: name.into(),
            interval_ms: interval.as_millis() as u64,
            retention_ms: retention.as_millis() as u64,
        }
    }

    /// `ceil(retention / interval)`, at least one
    pub fn capacity(&self) -> usize {
        if self.interval_ms == 0 {
            return 1;
        }
        self.retention_ms.div_ceil(self.interval_ms).max(1) as usize
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn default_table() -> Vec<EraSpec> {
        const SEC: u64 = 1000;
        const MIN: u64 = 60 * SEC;
        const HOUR: u64 = 60 * MIN;
        const DAY: u64 = 24 * HOUR;
        [
            ("fiveMinute", 5 * SEC, 5 * MIN),
            ("thirtyMinute", 20 * SEC, 30 * MIN),
            ("hour", 30 * SEC, HOUR),
            ("sixHour", 3 * MIN, 6 * HOUR),
            ("day", 15 * MIN, DAY),
            ("week", HOUR, 7 * DAY),
            ("month", 6 * HOUR, 30 * DAY),
            ("year", DAY, 365 * DAY),
        ]
        .into_iter()
        .map(|(name, interval_ms, retention_ms)| EraSpec {
            name: name.to_string(),
            interval_ms,
            retention_ms,
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capacity_rounds_up() {
        let era = EraSpec::new("x", Duration::from_secs(7), Duration::from_secs(60));
        assert_eq!(era.capacity(), 9);
        assert_eq!(EraSpec::default_table()[0].capacity(), 60);
    }

    #[test]
    fn test_default_table_is_ordered() {
        let table = EraSpec::default_table();
        assert!(table.windows(2).all(|w| w[0].interval_ms < w[1].interval_ms));
        assert!(table.windows(2).all(|w| w[0].retention_ms < w[1].retention_ms));
    }

    #[test]
    fn test_summary_from_strings_and_numbers() {
        let values = vec![json!("10"), json!(2), json!(3), json!(4), json!(0), json!("0")];
        let summary = TransferSummary::from_values(&values).unwrap();
        assert_eq!(summary.down_rate, 10);
        assert_eq!(summary.up_total, 4);

        assert!(TransferSummary::from_values(&values[..5]).is_err());
        let mut bad = values.clone();
        bad[0] = json!(-1);
        assert!(TransferSummary::from_values(&bad).is_err());
    }
}

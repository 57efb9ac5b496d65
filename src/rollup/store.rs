//! Bounded multi-resolution sample storage
//!
//! Samples enter the finest era. In cascading mode an era that overflows
//! hands its evicted samples to a promotion buffer; once the buffer holds
//! `ceil(next.interval / this.interval)` samples they are averaged into one
//! sample of the next era, which may overflow and cascade in turn. The
//! coarsest era drops what it evicts.
//!
//! Without cascading every era samples the raw stream on its own: a sample
//! is kept by an era when at least one interval has passed since that era's
//! newest sample.

use std::collections::VecDeque;

use serde::Serialize;

use super::EraSpec;
use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub download: u64,
    pub upload: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Parallel arrays, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct History {
    pub download: Vec<u64>,
    pub upload: Vec<u64>,
    pub timestamps: Vec<i64>,
}

impl History {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

#[derive(Debug)]
struct Era {
    spec: EraSpec,
    capacity: usize,
    samples: VecDeque<Sample>,
    /// Evicted samples waiting to be averaged into the next era
    pending: Vec<Sample>,
    promote_every: usize,
}

#[derive(Debug)]
pub struct RollupStore {
    eras: Vec<Era>,
    cascading: bool,
}

impl RollupStore {
    pub fn new(table: Vec<EraSpec>, cascading: bool) -> Result<Self> {
        if table.is_empty() {
            return Err(MirrorError::ConfigError {
                message: "rollup needs at least one era".to_string(),
            });
        }
        if let Some(era) = table.iter().find(|e| e.interval_ms == 0) {
            return Err(MirrorError::ConfigError {
                message: format!("era '{}' has a zero interval", era.name),
            });
        }

        let mut eras = Vec::with_capacity(table.len());
        for (index, spec) in table.iter().enumerate() {
            let promote_every = table
                .get(index + 1)
                .map(|next| next.interval_ms.div_ceil(spec.interval_ms).max(1) as usize)
                .unwrap_or(1);
            eras.push(Era {
                capacity: spec.capacity(),
                samples: VecDeque::with_capacity(spec.capacity()),
                pending: Vec::new(),
                promote_every,
                spec: spec.clone(),
            });
        }
        Ok(Self { eras, cascading })
    }

    pub fn is_cascading(&self) -> bool {
        self.cascading
    }

    pub fn era_names(&self) -> Vec<&str> {
        self.eras.iter().map(|e| e.spec.name.as_str()).collect()
    }

    pub fn add_sample(&mut self, download: u64, upload: u64, timestamp: i64) {
        let sample = Sample {
            download,
            upload,
            timestamp,
        };
        if self.cascading {
            self.push_cascading(sample);
        } else {
            self.push_sliding(sample);
        }
    }

    fn push_cascading(&mut self, sample: Sample) {
        let mut index = 0;
        let mut incoming = Some(sample);
        while let Some(sample) = incoming.take() {
            let last = index + 1 == self.eras.len();
            let era = &mut self.eras[index];
            era.samples.push_back(sample);
            if era.samples.len() <= era.capacity {
                break;
            }
            let Some(evicted) = era.samples.pop_front() else {
                break;
            };
            if last {
                break;
            }
            era.pending.push(evicted);
            if era.pending.len() >= era.promote_every {
                incoming = Some(average(&era.pending));
                era.pending.clear();
                index += 1;
            }
        }
    }

    fn push_sliding(&mut self, sample: Sample) {
        for (index, era) in self.eras.iter_mut().enumerate() {
            let due = index == 0
                || era
                    .samples
                    .back()
                    .map_or(true, |newest| sample.timestamp - newest.timestamp >= era.spec.interval_ms as i64);
            if !due {
                continue;
            }
            era.samples.push_back(sample);
            while era.samples.len() > era.capacity {
                era.samples.pop_front();
            }
        }
    }

    /// History of the named era, `None` for an unknown name
    pub fn get_history(&self, era: &str) -> Option<History> {
        let era = self.eras.iter().find(|e| e.spec.name == era)?;
        let mut history = History::default();
        for sample in &era.samples {
            history.download.push(sample.download);
            history.upload.push(sample.upload);
            history.timestamps.push(sample.timestamp);
        }
        Some(history)
    }

    pub fn len(&self, era: &str) -> usize {
        self.eras
            .iter()
            .find(|e| e.spec.name == era)
            .map_or(0, |e| e.samples.len())
    }
}

/// Mean of the values, stamped with the oldest sample's time
fn average(samples: &[Sample]) -> Sample {
    let n = samples.len().max(1) as u128;
    let download: u128 = samples.iter().map(|s| u128::from(s.download)).sum();
    let upload: u128 = samples.iter().map(|s| u128::from(s.upload)).sum();
    Sample {
        download: (download / n) as u64,
        upload: (upload / n) as u64,
        timestamp: samples.first().map_or(0, |s| s.timestamp),
    }
}

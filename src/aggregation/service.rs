//! Incremental aggregation over gateway decode events
//!
//! The taxonomy is rebuilt from scratch every list cycle: `ListStart` parks
//! the current taxonomy as the baseline and resets the counters, each
//! `EntityDecoded` is counted as it is parsed, and `ListEnd` publishes the
//! patch from baseline to rebuilt state. There is no removal bookkeeping.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;

use super::patch::{diff_values, Patch};
use super::taxonomy::Taxonomy;
use crate::error::{MirrorError, Result};
use crate::events::{EventBus, ServiceEvent};
use crate::gateway::{ListEnd, ListStart};
use crate::model::Entity;
use crate::registry::{ServiceLookup, Subscription};

#[derive(Default)]
struct CycleState {
    current: Arc<Taxonomy>,
    /// Baseline captured at `ListStart`
    previous: Arc<Taxonomy>,
    building: Option<Taxonomy>,
    cycle_id: Option<u64>,
    failure: Option<MirrorError>,
}

pub struct AggregationService {
    user_id: String,
    bus: EventBus,
    state: Mutex<CycleState>,
    weak_self: Weak<AggregationService>,
}

impl AggregationService {
    pub fn new(user_id: impl Into<String>, bus: EventBus) -> Arc<Self> {
        let user_id = user_id.into();
        Arc::new_cyclic(|weak_self| Self {
            user_id,
            bus,
            state: Mutex::new(CycleState::default()),
            weak_self: weak_self.clone(),
        })
    }

    /// Attach to the gateway's decode callbacks
    pub fn link(&self, lookup: ServiceLookup) -> Vec<Subscription> {
        let Some(gateway) = lookup.gateway() else {
            return Vec::new();
        };

        let weak = self.weak_self.clone();
        let start = gateway.list_start.subscribe(move |event: &ListStart| {
            if let Some(service) = weak.upgrade() {
                service.on_list_start(event.id);
            }
        });
        let weak = self.weak_self.clone();
        let entity = gateway.entity_decoded.subscribe(move |event: &Entity| {
            if let Some(service) = weak.upgrade() {
                service.on_entity(event);
            }
        });
        let weak = self.weak_self.clone();
        let end = gateway.list_end.subscribe(move |event: &ListEnd| {
            if let Some(service) = weak.upgrade() {
                service.on_list_end(event);
            }
        });

        let g = Arc::downgrade(&gateway);
        vec![
            Subscription::new("aggregation<-gateway.list_start", {
                let g = g.clone();
                move || {
                    if let Some(gateway) = g.upgrade() {
                        gateway.list_start.unsubscribe(start);
                    }
                }
            }),
            Subscription::new("aggregation<-gateway.entity_decoded", {
                let g = g.clone();
                move || {
                    if let Some(gateway) = g.upgrade() {
                        gateway.entity_decoded.unsubscribe(entity);
                    }
                }
            }),
            Subscription::new("aggregation<-gateway.list_end", move || {
                if let Some(gateway) = g.upgrade() {
                    gateway.list_end.unsubscribe(end);
                }
            }),
        ]
    }

    /// Taxonomy as of the last completed cycle
    pub fn taxonomy(&self) -> Arc<Taxonomy> {
        Arc::clone(&self.state.lock().current)
    }

    fn on_list_start(&self, id: u64) {
        let mut state = self.state.lock();
        state.previous = Arc::clone(&state.current);
        state.building = Some(Taxonomy::default());
        state.cycle_id = Some(id);
        state.failure = None;
    }

    fn on_entity(&self, entity: &Entity) {
        let mut state = self.state.lock();
        if state.failure.is_some() {
            return;
        }
        let Some(building) = state.building.as_mut() else {
            return;
        };
        if let Err(e) = building.record(entity) {
            state.failure = Some(e);
        }
    }

    fn on_list_end(&self, end: &ListEnd) {
        match self.finish_cycle(end) {
            Ok(Some(patch)) => {
                tracing::debug!("[{}] Taxonomy patch {} ({} ops)", self.user_id, end.id, patch.len());
                self.bus.emit(ServiceEvent::TaxonomyDiff { patch, id: end.id });
            }
            Ok(None) => {}
            Err(e) => {
                // The baseline stays current; the next cycle starts fresh
                tracing::warn!("[{}] Aggregation cycle {} aborted: {}", self.user_id, end.id, e);
            }
        }
    }

    fn finish_cycle(&self, end: &ListEnd) -> Result<Option<Patch>> {
        let mut state = self.state.lock();
        let building = state.building.take();
        let failure = state.failure.take();
        if state.cycle_id.take() != Some(end.id) {
            return Err(MirrorError::Aggregation {
                message: format!("list end {} without matching start", end.id),
            });
        }
        if let Some(e) = failure {
            return Err(e);
        }
        let Some(rebuilt) = building else {
            return Err(MirrorError::Aggregation {
                message: "no taxonomy under construction".to_string(),
            });
        };

        let before: Value = serde_json::to_value(state.previous.as_ref())?;
        let after: Value = serde_json::to_value(&rebuilt)?;
        state.current = Arc::new(rebuilt);

        let patch = diff_values(&before, &after);
        Ok((!patch.is_empty()).then_some(patch))
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.building = None;
        state.cycle_id = None;
        tracing::debug!("[{}] Aggregation service disposed", self.user_id);
    }
}

//! List synchronization: snapshot diffing and the poll loop

pub mod diff;
pub mod service;

pub use diff::compare;
pub use service::{ListChange, PollOutcome, SyncService};
pub(crate) use service::InFlight;

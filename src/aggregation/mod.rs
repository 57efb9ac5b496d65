//! Taxonomy aggregation: counters, location tree, patches

pub mod patch;
pub mod service;
pub mod taxonomy;

pub use patch::{apply_patch, diff_values, Patch};
pub use service::AggregationService;
pub use taxonomy::{LocationNode, Taxonomy};

//! Adaptive octree spatial index used for visibility culling and proximity
//! queries.
//!
//! # Invariants
//! - Every registered object maps to exactly one node whose box contains
//!   its sphere center; objects too large for a child stay at inner nodes.
//! - Insert/remove/update sequences are reproducible: thresholds are fixed,
//!   children follow the split-table order and node ids grow monotonically.
//! - Contract violations (duplicate insert, unknown id, center outside the
//!   root) panic.

mod filter;
mod octree;

pub use filter::FilterSet;
pub use octree::{
    DEFAULT_HALF_MIN_RESOLUTION, DEFAULT_MAX_OBJECTS, DEFAULT_MIN_OBJECTS, NodeId, Octree,
};

pub fn crate_info() -> &'static str {
    "strata-octree v0.1.0"
}

//! Shared types for the strata streaming core: bounding volumes, culling
//! planes and a deterministic random source.
//!
//! # Invariants
//! - Float volumes (`AACube`, `Sphere`, `Frustum`) are f64; they serve the
//!   spatial index, which must cover the full world extent without precision loss.
//! - Integer volumes (`AABox`, `ISphere`) are inclusive and address voxels in
//!   world coordinates.

mod bounds;
mod culling;
mod rng;

pub use bounds::{AABox, AACube, ISphere, Sphere};
pub use culling::{Frustum, Plane};
pub use rng::{SplitMix64, splitmix64};

pub fn crate_info() -> &'static str {
    "strata-common v0.1.0"
}

//! Voxel storage: run-length encoded columns, dense grids built from them,
//! and integer line stepping for sketch edits and ray casts.
//!
//! # Invariants
//! - A column's runs always cover its full height and never repeat a value
//!   in adjacent runs; equal content means equal representation.
//! - Grid point access outside the box is a caller bug and panics.

mod column;
mod grid;
mod line;

pub use column::VoxelColumn;
pub use grid::VoxelGrid;
pub use line::VoxelLine;

pub fn crate_info() -> &'static str {
    "strata-voxel v0.1.0"
}

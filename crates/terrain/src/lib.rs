//! Terrain streaming: discovery of coarse blocks around an observer, LOD
//! subdivision and merging, asynchronous generation and meshing, voxel edits
//! and visibility culling.
//!
//! # Invariants
//! - Block bookkeeping only happens inside `TerrainManager::update`; workers
//!   see immutable snapshots and hand results back through a channel.
//! - A block is destroyed only when it has no children, is out of range and
//!   has no outstanding worker task.
//! - A block is meshed only once every block it borders holds voxel data.
//! - Exactly one block of each branch is visible; children take over from
//!   their parent only when all of them are ready.

mod block;
mod config;
mod delegate;
mod discovery;
mod edits;
mod error;
pub mod lod;
mod manager;
mod mesh;
mod scene;
mod stats;
mod worker;

pub use block::{BlockId, BlockState, Face, VoxelBlock, octant_offset};
pub use config::{ConfigError, MAX_WORLD_EXTENT, TerrainConfig};
pub use delegate::{GenerationRequest, Observer, PropPlacement, PropPlacer, VoxelGenerator};
pub use edits::{EditLog, EditSender, EditShape, VoxelEdit};
pub use error::GenerationError;
pub use manager::{RayHit, TerrainManager};
pub use mesh::{MeshData, MeshInput, Mesher, ParentSample, SurfaceMesher, TerrainVertex};
pub use scene::{MeshHandle, SceneAction};
pub use stats::{FrameTimer, TerrainStats};

pub fn crate_info() -> &'static str {
    "strata-terrain v0.1.0"
}

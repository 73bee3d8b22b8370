//! Caller-supplied collaborators: voxel generation, prop placement and the
//! observer position.

use glam::{DVec3, I64Vec3, IVec3};
use strata_common::AABox;
use strata_voxel::VoxelGrid;

use crate::block::BlockId;
use crate::error::GenerationError;

/// Everything a generator needs to fill one block grid.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub block: BlockId,
    pub lod: u32,
    /// World voxels covered by the grid, overlap included.
    pub world_box: AABox,
    /// World units per grid voxel.
    pub voxel_size: i64,
    /// Grid dimensions the generator must return.
    pub dims: IVec3,
    pub non_solid_value: u8,
}

impl GenerationRequest {
    /// World position of grid voxel `local`.
    pub fn world_position(&self, local: IVec3) -> I64Vec3 {
        self.world_box.min + local.as_i64vec3() * self.voxel_size
    }

    /// A grid of the requested size filled with `clear_value`.
    pub fn empty_grid(&self, clear_value: u8) -> VoxelGrid {
        VoxelGrid::new(self.dims, clear_value).with_non_solid_value(self.non_solid_value)
    }
}

/// Fills block grids. Called from worker threads; must be deterministic for
/// the same request so re-streamed blocks reproduce identical geometry.
pub trait VoxelGenerator: Send + Sync {
    fn generate(&self, request: &GenerationRequest) -> Result<VoxelGrid, GenerationError>;
}

impl<F> VoxelGenerator for F
where
    F: Fn(&GenerationRequest) -> Result<VoxelGrid, GenerationError> + Send + Sync,
{
    fn generate(&self, request: &GenerationRequest) -> Result<VoxelGrid, GenerationError> {
        self(request)
    }
}

/// Finalised data of a freshly meshed finest-LOD block.
#[derive(Debug, Clone)]
pub struct PropPlacement {
    pub block: BlockId,
    pub world_box: AABox,
    pub voxel_size: i64,
    pub grid: VoxelGrid,
}

/// Scatters decorative objects over a block. Runs on the worker pool once per
/// finest-LOD block, after its first mesh.
pub trait PropPlacer: Send + Sync {
    fn place_props(&self, placement: &PropPlacement);
}

impl<F> PropPlacer for F
where
    F: Fn(&PropPlacement) + Send + Sync,
{
    fn place_props(&self, placement: &PropPlacement) {
        self(placement)
    }
}

/// Source of the streaming center, polled once per frame.
pub trait Observer {
    fn world_position(&self) -> DVec3;
}

impl Observer for DVec3 {
    fn world_position(&self) -> DVec3 {
        *self
    }
}

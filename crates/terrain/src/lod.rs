//! Block coordinate math shared by discovery, subdivision and queries.

use glam::{DVec3, I64Vec3, IVec3};
use strata_common::{AABox, Sphere};

use crate::config::TerrainConfig;

/// Block coordinate at `lod` containing the world position.
pub fn observer_block(config: &TerrainConfig, lod: u32, position: DVec3) -> I64Vec3 {
    let size = config.block_world_size(lod) as f64;
    (position / size).floor().as_i64vec3()
}

/// Per-axis (Chebyshev) distance between two block coordinates.
pub fn block_distance(a: I64Vec3, b: I64Vec3) -> i64 {
    (a - b).abs().max_element()
}

/// World position of a block's first voxel.
pub fn block_world_min(config: &TerrainConfig, lod: u32, position: I64Vec3) -> I64Vec3 {
    position * config.block_world_size(lod)
}

/// World voxels covered by a block grid, overlap included.
pub fn grid_world_box(config: &TerrainConfig, lod: u32, position: I64Vec3) -> AABox {
    AABox::from_min_size(
        block_world_min(config, lod, position),
        I64Vec3::splat(config.grid_edge() as i64 * config.voxel_size(lod)),
    )
}

/// Bounding sphere of a block without overlap.
pub fn block_sphere(config: &TerrainConfig, lod: u32, position: I64Vec3) -> Sphere {
    let size = config.block_world_size(lod) as f64;
    let min = block_world_min(config, lod, position).as_dvec3();
    Sphere::new(min + DVec3::splat(size * 0.5), size * 0.5 * 3f64.sqrt())
}

/// Split a world voxel position into the owning block at `lod` and the
/// grid-local voxel inside it.
pub fn world_to_block(config: &TerrainConfig, lod: u32, world: I64Vec3) -> (I64Vec3, IVec3) {
    let size = config.block_world_size(lod);
    let block = I64Vec3::new(
        world.x.div_euclid(size),
        world.y.div_euclid(size),
        world.z.div_euclid(size),
    );
    let offset = world - block * size;
    let local = offset / config.voxel_size(lod);
    (block, local.as_ivec3())
}

/// Exclusive upper bound of block coordinates at `lod`.
pub fn lod_bounds(config: &TerrainConfig, lod: u32) -> I64Vec3 {
    config.max_discovery_bounds * (1i64 << (config.lowest_lod() - lod))
}

/// True if the block coordinate lies inside the discoverable world.
pub fn in_world(config: &TerrainConfig, lod: u32, position: I64Vec3) -> bool {
    position.cmpge(I64Vec3::ZERO).all() && position.cmplt(lod_bounds(config, lod)).all()
}

/// Inclusive range of lowest-LOD coordinates scanned around `center`.
pub fn discovery_range(config: &TerrainConfig, center: I64Vec3) -> (I64Vec3, I64Vec3) {
    let radius = I64Vec3::splat(config.discovery_distance() as i64);
    let min = (center - radius).max(I64Vec3::ZERO);
    let max = (center + radius).min(config.max_discovery_bounds - I64Vec3::ONE);
    (min, max)
}

use std::collections::HashMap;

use crossbeam_channel::Sender;
use glam::{I64Vec3, IVec3};
use serde::{Deserialize, Serialize};
use strata_common::{AABox, ISphere};
use strata_voxel::VoxelGrid;

/// Region of an edit in world voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditShape {
    Box(AABox),
    Sphere(ISphere),
}

/// Density write over a world region, applied to every block it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelEdit {
    pub shape: EditShape,
    pub density: u8,
}

impl VoxelEdit {
    pub fn fill_box(region: AABox, density: u8) -> Self {
        Self {
            shape: EditShape::Box(region),
            density,
        }
    }

    pub fn fill_sphere(sphere: ISphere, density: u8) -> Self {
        Self {
            shape: EditShape::Sphere(sphere),
            density,
        }
    }

    pub fn bounds(&self) -> AABox {
        match self.shape {
            EditShape::Box(b) => b,
            EditShape::Sphere(s) => s.bounds(),
        }
    }

    /// Write the edit into a grid whose voxel (0, 0, 0) sits at `world_min`
    /// and whose voxels are `voxel_size` world units apart. Voxels are
    /// sampled at their world position; writes clip to the grid.
    pub fn apply_to_grid(&self, grid: &mut VoxelGrid, world_min: I64Vec3, voxel_size: i64) {
        let dims = grid.dims().as_i64vec3();
        match self.shape {
            EditShape::Box(region) => {
                let lo = ceil_div(region.min - world_min, voxel_size);
                let hi = floor_div(region.max - world_min, voxel_size);
                let lo = lo.clamp(I64Vec3::splat(-1), dims).as_ivec3();
                let hi = hi.clamp(I64Vec3::splat(-1), dims).as_ivec3();
                grid.fill_box(lo, hi, self.density);
            }
            EditShape::Sphere(sphere) => {
                let bounds = sphere.bounds();
                let lo = ceil_div(bounds.min - world_min, voxel_size).max(I64Vec3::ZERO);
                let hi = floor_div(bounds.max - world_min, voxel_size).min(dims - I64Vec3::ONE);
                let r2 = sphere.radius * sphere.radius;
                for z in lo.z..=hi.z {
                    for x in lo.x..=hi.x {
                        let dx = world_min.x + x * voxel_size - sphere.center.x;
                        let dz = world_min.z + z * voxel_size - sphere.center.z;
                        let rest = r2 - dx * dx - dz * dz;
                        if rest < 0 {
                            continue;
                        }
                        let half = rest.isqrt();
                        let y0 = ceil_div_scalar(sphere.center.y - half - world_min.y, voxel_size).max(0);
                        let y1 = floor_div_scalar(sphere.center.y + half - world_min.y, voxel_size)
                            .min(dims.y - 1);
                        if y0 <= y1 {
                            grid.set_density_span(
                                IVec3::new(x as i32, y0 as i32, z as i32),
                                (y1 - y0 + 1) as i32,
                                self.density,
                            );
                        }
                    }
                }
            }
        }
    }
}

fn floor_div_scalar(v: i64, d: i64) -> i64 {
    v.div_euclid(d)
}

fn ceil_div_scalar(v: i64, d: i64) -> i64 {
    -(-v).div_euclid(d)
}

fn floor_div(v: I64Vec3, d: i64) -> I64Vec3 {
    I64Vec3::new(
        floor_div_scalar(v.x, d),
        floor_div_scalar(v.y, d),
        floor_div_scalar(v.z, d),
    )
}

fn ceil_div(v: I64Vec3, d: i64) -> I64Vec3 {
    I64Vec3::new(
        ceil_div_scalar(v.x, d),
        ceil_div_scalar(v.y, d),
        ceil_div_scalar(v.z, d),
    )
}

/// Applied edits filed per lowest-LOD region, in application order.
///
/// Blocks generated after an edit replay the list of the region they lie
/// in. An edit is filed under every region whose grid it reaches; an entry
/// whose footprint inside the region is covered by a later box edit is
/// dropped, so repeated work on the same spot does not grow the log.
#[derive(Debug, Default)]
pub struct EditLog {
    regions: HashMap<I64Vec3, Vec<VoxelEdit>>,
    recorded: u64,
}

impl EditLog {
    /// File `edit` under the regions it reaches, each given with the world
    /// box its blocks' grids cover.
    pub(crate) fn record(&mut self, edit: VoxelEdit, regions: impl IntoIterator<Item = (I64Vec3, AABox)>) {
        for (region, region_box) in regions {
            let Some(footprint) = edit.bounds().intersection(&region_box) else {
                continue;
            };
            let entries = self.regions.entry(region).or_default();
            if let EditShape::Box(cover) = edit.shape {
                entries.retain(|old| {
                    old.bounds()
                        .intersection(&region_box)
                        .is_some_and(|old| !box_covers(&cover, &old))
                });
            }
            tracing::trace!(%region, ?footprint, kept = entries.len(), "edit filed");
            entries.push(edit);
        }
        self.recorded += 1;
    }

    /// Edits affecting `region`, oldest first.
    pub fn edits(&self, region: I64Vec3) -> &[VoxelEdit] {
        self.regions.get(&region).map(Vec::as_slice).unwrap_or_default()
    }

    /// Stored entries over all regions.
    pub fn len(&self) -> usize {
        self.regions.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.values().all(Vec::is_empty)
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Edits recorded since the manager was created.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }
}

fn box_covers(outer: &AABox, inner: &AABox) -> bool {
    outer.min.cmple(inner.min).all() && inner.max.cmple(outer.max).all()
}

/// Cloneable handle for submitting edits from any thread. Edits are applied
/// by the next `TerrainManager::update`.
#[derive(Debug, Clone)]
pub struct EditSender {
    pub(crate) tx: Sender<VoxelEdit>,
}

impl EditSender {
    /// Queue an edit. Returns false if the manager has been dropped.
    pub fn send(&self, edit: VoxelEdit) -> bool {
        self.tx.send(edit).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> VoxelGrid {
        VoxelGrid::new(IVec3::splat(10), 0)
    }

    #[test]
    fn box_edit_at_lod_zero() {
        let mut g = grid();
        let edit = VoxelEdit::fill_box(AABox::new(I64Vec3::new(98, 100, 100), I64Vec3::new(101, 101, 101)), 1);
        edit.apply_to_grid(&mut g, I64Vec3::splat(100), 1);
        assert_eq!(g.density(IVec3::ZERO), 1);
        assert_eq!(g.density(IVec3::new(1, 1, 1)), 1);
        assert_eq!(g.density(IVec3::new(2, 0, 0)), 0);
    }

    #[test]
    fn box_edit_samples_coarse_voxels() {
        let mut g = grid();
        // world x 3..=8 with voxel size 4 covers voxel x=1 (world 4) and x=2 (world 8)
        let edit = VoxelEdit::fill_box(AABox::new(I64Vec3::new(3, 0, 0), I64Vec3::new(8, 0, 0)), 7);
        edit.apply_to_grid(&mut g, I64Vec3::ZERO, 4);
        assert_eq!(g.line(IVec3::ZERO, IVec3::new(3, 0, 0)), vec![0, 7, 7, 0]);
    }

    #[test]
    fn box_edit_outside_grid_is_ignored() {
        let mut g = grid();
        let edit = VoxelEdit::fill_box(AABox::new(I64Vec3::splat(-50), I64Vec3::splat(-20)), 1);
        edit.apply_to_grid(&mut g, I64Vec3::ZERO, 1);
        assert!(g.is_uniform());
    }

    #[test]
    fn sphere_edit_matches_world_distance() {
        let mut g = grid();
        let sphere = ISphere::new(I64Vec3::new(12, 10, 10), 5);
        VoxelEdit::fill_sphere(sphere, 3).apply_to_grid(&mut g, I64Vec3::splat(8), 1);
        for z in 0..10 {
            for y in 0..10 {
                for x in 0..10 {
                    let local = IVec3::new(x, y, z);
                    let world = I64Vec3::splat(8) + local.as_i64vec3();
                    assert_eq!(g.density(local) == 3, sphere.contains(world), "{world}");
                }
            }
        }
    }

    #[test]
    fn sphere_edit_on_coarse_grid() {
        let mut g = grid();
        let sphere = ISphere::new(I64Vec3::new(8, 8, 8), 4);
        VoxelEdit::fill_sphere(sphere, 2).apply_to_grid(&mut g, I64Vec3::ZERO, 2);
        assert_eq!(g.density(IVec3::splat(4)), 2);
        assert_eq!(g.density(IVec3::new(6, 4, 4)), 2);
        assert_eq!(g.density(IVec3::new(7, 4, 4)), 0);
        assert_eq!(g.density(IVec3::new(5, 5, 5)), 2);
        assert_eq!(g.density(IVec3::new(6, 6, 4)), 0);
    }

    fn region_box() -> AABox {
        AABox::from_min_size(I64Vec3::ZERO, I64Vec3::splat(40))
    }

    #[test]
    fn log_files_edits_per_region_in_order() {
        let mut log = EditLog::default();
        let a = VoxelEdit::fill_sphere(ISphere::new(I64Vec3::splat(10), 2), 0);
        let b = VoxelEdit::fill_box(AABox::new(I64Vec3::splat(5), I64Vec3::splat(6)), 1);
        let next = AABox::from_min_size(I64Vec3::new(32, 0, 0), I64Vec3::splat(40));
        log.record(a, [(I64Vec3::ZERO, region_box()), (I64Vec3::X, next)]);
        log.record(b, [(I64Vec3::ZERO, region_box())]);

        assert_eq!(log.edits(I64Vec3::ZERO), &[a, b]);
        // the sphere never reaches x >= 32
        assert!(log.edits(I64Vec3::X).is_empty());
        assert_eq!(log.len(), 2);
        assert_eq!(log.recorded(), 2);
        assert!(log.edits(I64Vec3::splat(9)).is_empty());
    }

    #[test]
    fn covering_box_edit_supersedes_older_entries() {
        let mut log = EditLog::default();
        let dig = VoxelEdit::fill_sphere(ISphere::new(I64Vec3::splat(10), 3), 0);
        let small = VoxelEdit::fill_box(AABox::new(I64Vec3::splat(20), I64Vec3::splat(22)), 1);
        log.record(dig, [(I64Vec3::ZERO, region_box())]);
        log.record(small, [(I64Vec3::ZERO, region_box())]);

        // covers the dig but not `small`
        let fill = VoxelEdit::fill_box(AABox::new(I64Vec3::splat(5), I64Vec3::splat(15)), 2);
        log.record(fill, [(I64Vec3::ZERO, region_box())]);
        assert_eq!(log.edits(I64Vec3::ZERO), &[small, fill]);

        // only the part inside the region has to be covered
        let wide = VoxelEdit::fill_box(AABox::new(I64Vec3::splat(-100), I64Vec3::new(25, 100, 100)), 0);
        log.record(wide, [(I64Vec3::ZERO, region_box())]);
        assert_eq!(log.edits(I64Vec3::ZERO), &[wide]);
    }

    #[test]
    fn repeated_edits_do_not_grow_the_log() {
        let mut log = EditLog::default();
        let region = AABox::new(I64Vec3::splat(8), I64Vec3::splat(12));
        for density in 0..100 {
            log.record(VoxelEdit::fill_box(region, density % 2), [(I64Vec3::ZERO, region_box())]);
        }
        assert_eq!(log.len(), 1);
        assert_eq!(log.recorded(), 100);
        assert_eq!(log.edits(I64Vec3::ZERO)[0].density, 1);
    }
}

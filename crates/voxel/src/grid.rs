use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::column::VoxelColumn;
use crate::line::VoxelLine;

/// Density and material strips of one (x, z) cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VoxelPillar {
    density: VoxelColumn,
    material: VoxelColumn,
}

/// Dense box of voxels stored as run-length encoded columns.
///
/// Columns are addressed by `(x, z)` and run along `y`. Point accessors
/// panic on coordinates outside the box; region writes (`set_line`,
/// `fill_box`, `fill_sphere`) clip to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoxelGrid {
    dims: IVec3,
    clear_value: u8,
    non_solid_value: u8,
    pillars: Vec<VoxelPillar>,
}

impl VoxelGrid {
    /// Grid of `dims` voxels, densities set to `clear_value`, materials to 0.
    pub fn new(dims: IVec3, clear_value: u8) -> Self {
        assert!(dims.min_element() > 0, "grid dimensions must be positive: {dims}");
        let height = dims.y as u32;
        let pillar = VoxelPillar {
            density: VoxelColumn::new(height, clear_value),
            material: VoxelColumn::new(height, 0),
        };
        Self {
            dims,
            clear_value,
            non_solid_value: 0,
            pillars: vec![pillar; (dims.x * dims.z) as usize],
        }
    }

    pub fn with_non_solid_value(mut self, value: u8) -> Self {
        self.non_solid_value = value;
        self
    }

    pub fn dims(&self) -> IVec3 {
        self.dims
    }

    pub fn width(&self) -> i32 {
        self.dims.x
    }

    pub fn height(&self) -> i32 {
        self.dims.y
    }

    pub fn depth(&self) -> i32 {
        self.dims.z
    }

    pub fn clear_value(&self) -> u8 {
        self.clear_value
    }

    pub fn non_solid_value(&self) -> u8 {
        self.non_solid_value
    }

    pub fn contains(&self, pos: IVec3) -> bool {
        pos.cmpge(IVec3::ZERO).all() && pos.cmplt(self.dims).all()
    }

    pub fn is_solid(&self, pos: IVec3) -> bool {
        self.density(pos) != self.non_solid_value
    }

    pub fn density(&self, pos: IVec3) -> u8 {
        self.pillar(pos).density.get(pos.y as u32)
    }

    pub fn set_density(&mut self, pos: IVec3, density: u8) {
        self.pillar_mut(pos).density.set(pos.y as u32, density);
    }

    pub fn material(&self, pos: IVec3) -> u8 {
        self.pillar(pos).material.get(pos.y as u32)
    }

    pub fn set_material(&mut self, pos: IVec3, material: u8) {
        self.pillar_mut(pos).material.set(pos.y as u32, material);
    }

    /// Write `height` voxels upward from `pos` in a single column.
    pub fn set_density_span(&mut self, pos: IVec3, height: i32, density: u8) {
        assert!(
            height >= 0 && pos.y + height <= self.dims.y,
            "span {pos}+{height} out of range"
        );
        self.pillar_mut(pos)
            .density
            .set_span(pos.y as u32, height as u32, density);
    }

    pub fn density_column(&self, x: i32, z: i32) -> &VoxelColumn {
        &self.pillar(IVec3::new(x, 0, z)).density
    }

    pub fn density_column_mut(&mut self, x: i32, z: i32) -> &mut VoxelColumn {
        &mut self.pillar_mut(IVec3::new(x, 0, z)).density
    }

    pub fn material_column(&self, x: i32, z: i32) -> &VoxelColumn {
        &self.pillar(IVec3::new(x, 0, z)).material
    }

    /// Reset all densities to `density` and all materials to 0.
    pub fn clear(&mut self, density: u8) {
        for pillar in &mut self.pillars {
            pillar.density.clear(density);
            pillar.material.clear(0);
        }
    }

    /// Writes every in-grid voxel visited by the line from `from` to `to`.
    pub fn set_line(&mut self, from: IVec3, to: IVec3, density: u8) {
        for pos in VoxelLine::new(from, to) {
            if self.contains(pos) {
                self.set_density(pos, density);
            }
        }
    }

    /// Densities along the line from `from` to `to`; voxels outside the grid
    /// are skipped.
    pub fn line(&self, from: IVec3, to: IVec3) -> Vec<u8> {
        VoxelLine::new(from, to)
            .filter(|p| self.contains(*p))
            .map(|p| self.density(p))
            .collect()
    }

    /// Steps from `origin` towards `origin + direction * max_dist` and
    /// returns the first voxel where the ray enters solid material.
    ///
    /// A ray that starts inside solid voxels only reports a hit after it
    /// has passed through non-solid space. Voxels outside the grid count as
    /// non-solid.
    pub fn cast_ray(&self, origin: IVec3, direction: IVec3, max_dist: i32) -> Option<(IVec3, u8)> {
        let to = origin + direction * max_dist;
        let mut inside_solid = self.contains(origin) && self.is_solid(origin);
        for pos in VoxelLine::new(origin, to) {
            if !self.contains(pos) {
                inside_solid = false;
                continue;
            }
            let value = self.density(pos);
            if value == self.non_solid_value {
                inside_solid = false;
            } else if !inside_solid {
                return Some((pos, value));
            }
        }
        None
    }

    /// Sets every voxel in the inclusive box `[min, max]`, clipped to the grid.
    pub fn fill_box(&mut self, min: IVec3, max: IVec3, density: u8) {
        let lo = min.max(IVec3::ZERO);
        let hi = max.min(self.dims - IVec3::ONE);
        if lo.cmpgt(hi).any() {
            return;
        }
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                self.set_density_span(IVec3::new(x, lo.y, z), hi.y - lo.y + 1, density);
            }
        }
    }

    /// Sets every voxel within `radius` of `center`, clipped to the grid.
    pub fn fill_sphere(&mut self, center: IVec3, radius: i32, density: u8) {
        if radius < 0 {
            return;
        }
        let r2 = radius as i64 * radius as i64;
        let lo = (center - IVec3::splat(radius)).max(IVec3::ZERO);
        let hi = (center + IVec3::splat(radius)).min(self.dims - IVec3::ONE);
        for z in lo.z..=hi.z {
            for x in lo.x..=hi.x {
                let dx = (x - center.x) as i64;
                let dz = (z - center.z) as i64;
                let rest = r2 - dx * dx - dz * dz;
                if rest < 0 {
                    continue;
                }
                let half = rest.isqrt() as i32;
                let y0 = (center.y - half).max(0);
                let y1 = (center.y + half).min(self.dims.y - 1);
                if y0 <= y1 {
                    self.set_density_span(IVec3::new(x, y0, z), y1 - y0 + 1, density);
                }
            }
        }
    }

    /// True when all voxels agree on solidity, i.e. the grid contains no
    /// surface.
    pub fn is_uniform(&self) -> bool {
        let mut solidity = None;
        for pillar in &self.pillars {
            for (_, value) in pillar.density.runs() {
                let solid = value != self.non_solid_value;
                match solidity {
                    None => solidity = Some(solid),
                    Some(s) if s != solid => return false,
                    Some(_) => {}
                }
            }
        }
        true
    }

    /// Total number of density runs, a rough measure of grid complexity.
    pub fn run_count(&self) -> usize {
        self.pillars.iter().map(|p| p.density.run_count()).sum()
    }

    fn index(&self, pos: IVec3) -> usize {
        assert!(self.contains(pos), "voxel {pos} outside grid {}", self.dims);
        (pos.z * self.dims.x + pos.x) as usize
    }

    fn pillar(&self, pos: IVec3) -> &VoxelPillar {
        &self.pillars[self.index(pos)]
    }

    fn pillar_mut(&mut self, pos: IVec3) -> &mut VoxelPillar {
        let i = self.index(pos);
        &mut self.pillars[i]
    }
}

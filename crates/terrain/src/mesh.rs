use bytemuck::{Pod, Zeroable};
use glam::{I64Vec3, IVec3, Vec3};
use strata_voxel::VoxelGrid;

use crate::block::{BlockId, Face};

/// Vertex layout of terrain meshes, ready for GPU upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TerrainVertex {
    /// Block-local position in world units.
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub material: u32,
}

/// Triangle mesh of one block, positioned relative to `origin`.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub origin: I64Vec3,
    pub lod: u32,
    pub vertices: Vec<TerrainVertex>,
    pub indices: Vec<u32>,
    pub bounds_min: Vec3,
    pub bounds_max: Vec3,
}

impl MeshData {
    pub fn new(origin: I64Vec3, lod: u32) -> Self {
        Self {
            origin,
            lod,
            vertices: Vec::new(),
            indices: Vec::new(),
            bounds_min: Vec3::splat(f32::MAX),
            bounds_max: Vec3::splat(f32::MIN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    fn push_quad(&mut self, corners: [Vec3; 4], normal: Vec3, material: u32, flip: bool) {
        let base = self.vertices.len() as u32;
        for position in corners {
            self.bounds_min = self.bounds_min.min(position);
            self.bounds_max = self.bounds_max.max(position);
            self.vertices.push(TerrainVertex {
                position: position.to_array(),
                normal: normal.to_array(),
                material,
            });
        }
        let order: [u32; 6] = if flip {
            [0, 2, 1, 0, 3, 2]
        } else {
            [0, 1, 2, 0, 2, 3]
        };
        self.indices.extend(order.iter().map(|i| base + i));
    }
}

/// Coarser data used on faces that border a lower-detail neighbour.
#[derive(Debug, Clone)]
pub struct ParentSample {
    pub grid: VoxelGrid,
    /// Which octant of the parent the block occupies (0 or 1 per axis).
    pub octant: IVec3,
}

/// Snapshot handed to a [`Mesher`] on a worker thread.
#[derive(Debug, Clone)]
pub struct MeshInput {
    pub block: BlockId,
    pub lod: u32,
    pub world_min: I64Vec3,
    pub voxel_size: i64,
    pub block_size: i32,
    pub grid: VoxelGrid,
    pub parent: Option<ParentSample>,
    /// One bit per face whose neighbour is coarser (see `Face::transition_bit`).
    pub transition_mask: u8,
}

pub trait Mesher: Send + Sync {
    fn build(&self, input: &MeshInput) -> MeshData;
}

/// Emits one quad per boundary between a solid and a non-solid voxel.
///
/// A block owns the boundaries between its voxels and the overlap layer on
/// its positive sides; the negative-side boundaries belong to the neighbour.
/// On faces bordering a coarser neighbour the outside voxels are sampled from
/// the parent grid and vertices on that face snap to the coarser lattice, so
/// both sides meet at the same edges.
#[derive(Debug, Clone, Copy, Default)]
pub struct SurfaceMesher;

impl SurfaceMesher {
    fn outside_is_solid(input: &MeshInput, q: IVec3, axis: usize) -> bool {
        let face = Face::ALL[axis * 2];
        let coarse = input.transition_mask & face.transition_bit() != 0;
        match &input.parent {
            Some(parent) if coarse && q[axis] == input.block_size => {
                let local = parent.octant * (input.block_size / 2) + q / 2;
                parent.grid.contains(local) && parent.grid.is_solid(local)
            }
            _ => input.grid.is_solid(q),
        }
    }

    fn snap(input: &MeshInput, mut corner: IVec3) -> IVec3 {
        for face in Face::ALL {
            if input.transition_mask & face.transition_bit() == 0 {
                continue;
            }
            let plane = if face.is_positive() { input.block_size } else { 0 };
            if corner[face.axis()] != plane {
                continue;
            }
            for other in 0..3 {
                if other != face.axis() {
                    corner[other] &= !1;
                }
            }
        }
        corner
    }
}

impl Mesher for SurfaceMesher {
    fn build(&self, input: &MeshInput) -> MeshData {
        let grid = &input.grid;
        let size = input.block_size;
        let scale = input.voxel_size as f32;
        let mut mesh = MeshData::new(input.world_min, input.lod);

        for z in 0..size {
            for y in 0..size {
                for x in 0..size {
                    let p = IVec3::new(x, y, z);
                    let solid = grid.is_solid(p);
                    for axis in 0..3 {
                        let mut q = p;
                        q[axis] += 1;
                        if solid == Self::outside_is_solid(input, q, axis) {
                            continue;
                        }

                        let u = (axis + 1) % 3;
                        let v = (axis + 2) % 3;
                        let mut base = p;
                        base[axis] += 1;
                        let mut du = IVec3::ZERO;
                        du[u] = 1;
                        let mut dv = IVec3::ZERO;
                        dv[v] = 1;
                        let corners = [base, base + du, base + du + dv, base + dv]
                            .map(|c| Self::snap(input, c));

                        let distinct = (0..4)
                            .filter(|i| !corners[..*i].contains(&corners[*i]))
                            .count();
                        if distinct < 3 {
                            continue;
                        }

                        let mut normal = Vec3::ZERO;
                        normal[axis] = if solid { 1.0 } else { -1.0 };
                        let material = if solid {
                            grid.material(p)
                        } else {
                            grid.material(q)
                        };
                        mesh.push_quad(
                            corners.map(|c| c.as_vec3() * scale),
                            normal,
                            material as u32,
                            !solid,
                        );
                    }
                }
            }
        }

        if mesh.vertices.is_empty() {
            mesh.bounds_min = Vec3::ZERO;
            mesh.bounds_max = Vec3::ZERO;
        }
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(grid: VoxelGrid) -> MeshInput {
        MeshInput {
            block: BlockId(1),
            lod: 0,
            world_min: I64Vec3::ZERO,
            voxel_size: 1,
            block_size: 8,
            grid,
            parent: None,
            transition_mask: 0,
        }
    }

    fn empty() -> VoxelGrid {
        VoxelGrid::new(IVec3::splat(10), 0)
    }

    #[test]
    fn empty_grid_has_no_mesh() {
        let mesh = SurfaceMesher.build(&input(empty()));
        assert!(mesh.is_empty());
        assert_eq!(mesh.bounds_min, Vec3::ZERO);
    }

    #[test]
    fn single_voxel_is_a_cube() {
        let mut grid = empty();
        grid.set_density(IVec3::splat(3), 1);
        grid.set_material(IVec3::splat(3), 5);
        let mesh = SurfaceMesher.build(&input(grid));
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.triangle_count(), 12);
        assert_eq!(mesh.bounds_min, Vec3::splat(3.0));
        assert_eq!(mesh.bounds_max, Vec3::splat(4.0));
        assert!(mesh.vertices.iter().all(|v| v.material == 5));
        assert_eq!(mesh.vertex_bytes().len(), 24 * std::mem::size_of::<TerrainVertex>());
    }

    #[test]
    fn flat_ground_emits_only_the_top() {
        let mut grid = empty();
        grid.fill_box(IVec3::ZERO, IVec3::new(9, 3, 9), 1);
        let mesh = SurfaceMesher.build(&input(grid));
        assert_eq!(mesh.triangle_count(), 8 * 8 * 2);
        assert!(mesh.vertices.iter().all(|v| v.normal == [0.0, 1.0, 0.0]));
        assert!(mesh.vertices.iter().all(|v| v.position[1] == 4.0));
    }

    #[test]
    fn lod_scales_positions() {
        let mut grid = empty();
        grid.set_density(IVec3::ZERO, 1);
        let mesh = SurfaceMesher.build(&MeshInput {
            voxel_size: 4,
            lod: 2,
            ..input(grid)
        });
        assert_eq!(mesh.bounds_max, Vec3::splat(4.0));
        assert_eq!(mesh.lod, 2);
    }

    #[test]
    fn coarse_face_vertices_snap_to_even_lattice() {
        let mut grid = empty();
        // a wall against -X with an odd-sized notch
        grid.fill_box(IVec3::ZERO, IVec3::new(2, 4, 8), 1);
        grid.fill_box(IVec3::new(0, 3, 0), IVec3::new(2, 4, 2), 0);
        let mesh = SurfaceMesher.build(&MeshInput {
            transition_mask: Face::NegX.transition_bit(),
            ..input(grid)
        });
        assert!(!mesh.is_empty());
        for vertex in mesh.vertices.iter().filter(|v| v.position[0] == 0.0) {
            assert_eq!(vertex.position[1] as i32 % 2, 0, "{vertex:?}");
            assert_eq!(vertex.position[2] as i32 % 2, 0, "{vertex:?}");
        }
    }

    #[test]
    fn coarse_face_samples_parent_grid() {
        let mut grid = empty();
        // solid slab running through the +X overlap: no face on its own
        grid.fill_box(IVec3::new(4, 0, 0), IVec3::new(9, 9, 9), 1);
        let plain = SurfaceMesher.build(&input(grid.clone()));
        assert!(plain.vertices.iter().all(|v| v.position[0] != 8.0));

        // the coarser neighbour side is empty in the parent
        let coarse = SurfaceMesher.build(&MeshInput {
            transition_mask: Face::PosX.transition_bit(),
            parent: Some(ParentSample {
                grid: empty(),
                octant: IVec3::ZERO,
            }),
            ..input(grid)
        });
        let outer: Vec<_> = coarse
            .vertices
            .iter()
            .filter(|v| v.position[0] == 8.0)
            .collect();
        assert!(!outer.is_empty());
        assert!(outer.iter().all(|v| v.normal == [1.0, 0.0, 0.0]));
    }
}

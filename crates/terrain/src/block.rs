use glam::I64Vec3;
use serde::{Deserialize, Serialize};
use strata_voxel::VoxelGrid;

use crate::scene::MeshHandle;

/// Arena id of a terrain block. Ids grow monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

/// Lifecycle of a block. The ordering follows the pipeline, so
/// `state >= Generated` means the block has passed generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockState {
    Created,
    GenerationRequested,
    Generated,
    MeshRequested,
    Visible,
    ToDelete,
}

impl BlockState {
    /// True for states that own a generated grid.
    pub fn has_grid(self) -> bool {
        matches!(self, Self::Generated | Self::MeshRequested | Self::Visible)
    }
}

/// Block faces in neighbour order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::PosX,
        Face::NegX,
        Face::PosY,
        Face::NegY,
        Face::PosZ,
        Face::NegZ,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn offset(self) -> I64Vec3 {
        match self {
            Face::PosX => I64Vec3::X,
            Face::NegX => I64Vec3::NEG_X,
            Face::PosY => I64Vec3::Y,
            Face::NegY => I64Vec3::NEG_Y,
            Face::PosZ => I64Vec3::Z,
            Face::NegZ => I64Vec3::NEG_Z,
        }
    }

    pub fn opposite(self) -> Face {
        match self {
            Face::PosX => Face::NegX,
            Face::NegX => Face::PosX,
            Face::PosY => Face::NegY,
            Face::NegY => Face::PosY,
            Face::PosZ => Face::NegZ,
            Face::NegZ => Face::PosZ,
        }
    }

    /// Axis index (0 = x, 1 = y, 2 = z).
    pub fn axis(self) -> usize {
        self.index() / 2
    }

    pub fn is_positive(self) -> bool {
        self.index() % 2 == 0
    }

    /// Bit of this face in a LOD transition mask.
    pub fn transition_bit(self) -> u8 {
        0x20 >> self.index()
    }
}

/// Offset of child octant `index` (bits x = 1, y = 2, z = 4).
pub fn octant_offset(index: usize) -> I64Vec3 {
    I64Vec3::new(
        (index & 1) as i64,
        ((index >> 1) & 1) as i64,
        ((index >> 2) & 1) as i64,
    )
}

/// One LOD cell of terrain.
#[derive(Debug)]
pub struct VoxelBlock {
    pub(crate) id: BlockId,
    pub(crate) lod: u32,
    pub(crate) position: I64Vec3,
    pub(crate) parent: Option<BlockId>,
    pub(crate) children: Option<[BlockId; 8]>,
    pub(crate) neighbors: [Option<BlockId>; 6],
    pub(crate) state: BlockState,
    pub(crate) grid: Option<VoxelGrid>,
    pub(crate) mesh: Option<MeshHandle>,
    pub(crate) in_range: bool,
    pub(crate) pending_tasks: u32,
    pub(crate) dirty: bool,
    pub(crate) transition_mask: u8,
    pub(crate) has_surface: bool,
    pub(crate) visible: bool,
    pub(crate) mesh_revision: u64,
    pub(crate) props_placed: bool,
    pub(crate) failed_generations: u32,
}

impl VoxelBlock {
    pub(crate) fn new(id: BlockId, lod: u32, position: I64Vec3, parent: Option<BlockId>) -> Self {
        Self {
            id,
            lod,
            position,
            parent,
            children: None,
            neighbors: [None; 6],
            state: BlockState::Created,
            grid: None,
            mesh: None,
            in_range: true,
            pending_tasks: 0,
            dirty: false,
            transition_mask: 0,
            has_surface: false,
            visible: false,
            mesh_revision: 0,
            props_placed: false,
            failed_generations: 0,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn lod(&self) -> u32 {
        self.lod
    }

    /// Block coordinate in units of this LOD's block size.
    pub fn position(&self) -> I64Vec3 {
        self.position
    }

    pub fn parent(&self) -> Option<BlockId> {
        self.parent
    }

    pub fn children(&self) -> Option<[BlockId; 8]> {
        self.children
    }

    pub fn neighbor(&self, face: Face) -> Option<BlockId> {
        self.neighbors[face.index()]
    }

    pub fn neighbors(&self) -> [Option<BlockId>; 6] {
        self.neighbors
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn grid(&self) -> Option<&VoxelGrid> {
        self.grid.as_ref()
    }

    pub fn mesh(&self) -> Option<&MeshHandle> {
        self.mesh.as_ref()
    }

    pub fn in_range(&self) -> bool {
        self.in_range
    }

    pub fn pending_tasks(&self) -> u32 {
        self.pending_tasks
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn transition_mask(&self) -> u8 {
        self.transition_mask
    }

    pub fn has_surface(&self) -> bool {
        self.has_surface
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn mesh_revision(&self) -> u64 {
        self.mesh_revision
    }

    pub fn failed_generations(&self) -> u32 {
        self.failed_generations
    }

    /// Safe to destroy: no children, out of range, nothing in flight.
    pub fn can_be_deleted(&self) -> bool {
        self.children.is_none() && !self.in_range && self.pending_tasks == 0
    }
}

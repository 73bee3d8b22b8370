use std::sync::Arc;

use crate::block::BlockId;
use crate::mesh::MeshData;

/// Shared, immutable mesh of one block. `revision` increases with every
/// rebuild of that block's mesh.
#[derive(Debug, Clone)]
pub struct MeshHandle {
    pub revision: u64,
    pub data: Arc<MeshData>,
}

/// Requests for the scene-graph consumer, drained with
/// `TerrainManager::take_actions`.
#[derive(Debug, Clone)]
pub enum SceneAction {
    /// Attach (or replace) the mesh of a block. Attached meshes start hidden.
    Attach { block: BlockId, mesh: MeshHandle },
    /// Remove the block's mesh from the scene.
    Detach { block: BlockId },
    SetVisible { block: BlockId, visible: bool },
}

impl SceneAction {
    pub fn block(&self) -> BlockId {
        match self {
            SceneAction::Attach { block, .. }
            | SceneAction::Detach { block }
            | SceneAction::SetVisible { block, .. } => *block,
        }
    }
}

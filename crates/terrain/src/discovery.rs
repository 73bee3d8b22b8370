use glam::{DVec3, I64Vec3};

use crate::block::{BlockId, BlockState};
use crate::lod;
use crate::manager::TerrainManager;

impl TerrainManager {
    /// Create the lowest-LOD blocks around the observer and release the
    /// ones that fell out of the discovery cube.
    ///
    /// Runs on the first frame, after the observer travelled further than
    /// the rediscovery distance, and after any lowest-LOD block was
    /// destroyed so a returning observer gets it back.
    pub(crate) fn discover(&mut self, position: DVec3) {
        let moved = match self.last_discovery {
            Some(last) => last.distance(position) > self.config().effective_rediscovery_distance(),
            None => true,
        };
        if !moved && !self.needs_discovery {
            return;
        }
        self.last_discovery = Some(position);
        self.needs_discovery = false;

        let lowest = self.config().lowest_lod();
        let center = lod::observer_block(self.config(), lowest, position);
        let (min, max) = lod::discovery_range(self.config(), center);

        let mut leaving: Vec<BlockId> = self.lods[lowest as usize]
            .iter()
            .filter(|(pos, _)| pos.cmplt(min).any() || pos.cmpgt(max).any())
            .map(|(_, id)| *id)
            .collect();
        leaving.sort();
        let mut released = 0;
        for id in leaving {
            if self.blocks.get(&id).is_some_and(|b| b.state != BlockState::ToDelete) {
                self.mark_for_deletion(id);
                released += 1;
            }
        }

        let mut created = 0;
        for z in min.z..=max.z {
            for y in min.y..=max.y {
                for x in min.x..=max.x {
                    let pos = I64Vec3::new(x, y, z);
                    if !self.lods[lowest as usize].contains_key(&pos) {
                        self.create_block(lowest, pos, None);
                        created += 1;
                    }
                }
            }
        }

        tracing::debug!(%center, created, released, "discovery");
    }

    /// Destroy blocks marked for deletion once nothing refers to them.
    ///
    /// Children always have larger ids than their parents, so walking ids
    /// downwards frees a whole released subtree in one pass.
    pub(crate) fn collect_garbage(&mut self) {
        let candidates: Vec<BlockId> = self
            .blocks
            .values()
            .rev()
            .filter(|b| b.state == BlockState::ToDelete)
            .map(|b| b.id)
            .collect();

        for id in candidates {
            if self.blocks.get(&id).is_some_and(|b| b.can_be_deleted()) {
                self.destroy_block(id);
            }
        }
    }
}

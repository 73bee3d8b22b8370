use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, unbounded};
use glam::{DVec3, I64Vec3, IVec3};
use strata_common::{AABox, AACube, Frustum};
use strata_octree::Octree;
use strata_voxel::{VoxelGrid, VoxelLine};

use crate::block::{BlockId, BlockState, Face, VoxelBlock, octant_offset};
use crate::config::{ConfigError, TerrainConfig};
use crate::delegate::{GenerationRequest, Observer, PropPlacement, PropPlacer, VoxelGenerator};
use crate::edits::{EditLog, EditSender, VoxelEdit};
use crate::lod;
use crate::mesh::{MeshData, MeshInput, Mesher, ParentSample, SurfaceMesher};
use crate::scene::{MeshHandle, SceneAction};
use crate::stats::{FrameTimer, TerrainStats};
use crate::worker::{Job, JobResult, WorkerPool};

const FRAME_HISTORY: usize = 120;
const CULL_MAX_OBJECTS: usize = 8;
const CULL_MIN_OBJECTS: usize = 2;

/// Result of [`TerrainManager::cast_ray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayHit {
    /// First solid voxel along the ray.
    pub inside: I64Vec3,
    /// The voxel visited just before `inside`.
    pub outside: I64Vec3,
    pub value: u8,
}

/// Streams a bounded set of generated, meshed LOD blocks around a moving
/// observer.
///
/// All block bookkeeping happens on the caller's thread inside [`update`];
/// generation, meshing and prop placement run on a worker pool and come back
/// through a completion channel that `update` drains without blocking.
///
/// [`update`]: TerrainManager::update
pub struct TerrainManager {
    config: TerrainConfig,
    pub(crate) blocks: BTreeMap<BlockId, VoxelBlock>,
    pub(crate) lods: Vec<HashMap<I64Vec3, BlockId>>,
    next_id: u64,
    workers: WorkerPool,
    edit_tx: Sender<VoxelEdit>,
    edit_rx: Receiver<VoxelEdit>,
    edit_log: EditLog,
    actions: Vec<SceneAction>,
    cull_tree: Octree<BlockId>,
    pub(crate) last_discovery: Option<DVec3>,
    pub(crate) needs_discovery: bool,
    pub(crate) stats: TerrainStats,
    frame_timer: FrameTimer,
    frame: u64,
}

impl TerrainManager {
    /// Manager with the default [`SurfaceMesher`] and no prop placement.
    pub fn new(
        config: TerrainConfig,
        generator: impl VoxelGenerator + 'static,
    ) -> Result<Self, ConfigError> {
        Self::with_delegates(config, Arc::new(generator), Arc::new(SurfaceMesher), None)
    }

    pub fn with_delegates(
        config: TerrainConfig,
        generator: Arc<dyn VoxelGenerator>,
        mesher: Arc<dyn Mesher>,
        props: Option<Arc<dyn PropPlacer>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let lowest = config.lowest_lod();
        let world_edge = config.max_discovery_bounds.max_element() * config.block_world_size(lowest);
        let cull_tree = Octree::new(
            AACube::from_min_edge(DVec3::ZERO, world_edge as f64),
            config.block_size as f64 * 0.5,
            CULL_MAX_OBJECTS,
            CULL_MIN_OBJECTS,
        );
        let workers = WorkerPool::new(config.worker_threads, generator, mesher, props);
        // drained every frame; senders on other threads never block
        let (edit_tx, edit_rx) = unbounded();

        tracing::info!(
            block_size = config.block_size,
            lod_count = config.lod_count,
            workers = workers.thread_count(),
            "terrain manager created"
        );

        Ok(Self {
            lods: vec![HashMap::new(); config.lod_count as usize],
            config,
            blocks: BTreeMap::new(),
            next_id: 0,
            workers,
            edit_tx,
            edit_rx,
            edit_log: EditLog::default(),
            actions: Vec::new(),
            cull_tree,
            last_discovery: None,
            needs_discovery: true,
            stats: TerrainStats::default(),
            frame_timer: FrameTimer::new(FRAME_HISTORY),
            frame: 0,
        })
    }

    pub fn config(&self) -> &TerrainConfig {
        &self.config
    }

    /// Run one streaming pass: garbage collection, discovery, block
    /// lifecycle and meshing, worker completions, queued edits and
    /// visibility, in that order.
    pub fn update(&mut self, observer: &impl Observer) {
        let _span = tracing::info_span!("terrain_update", frame = self.frame).entered();
        let frame_start = Instant::now();
        self.stats = TerrainStats {
            frame: self.frame,
            ..TerrainStats::default()
        };

        let position = observer.world_position();
        self.collect_garbage();
        self.discover(position);

        let observer_blocks: Vec<I64Vec3> = (0..self.config.lod_count)
            .map(|lod| lod::observer_block(&self.config, lod, position))
            .collect();
        self.update_lifecycle(&observer_blocks);
        self.update_meshes();
        self.process_completions();
        self.apply_queued_edits();
        self.update_visibility();

        self.stats.total_blocks = self.blocks.len();
        self.stats.visible_blocks = self.blocks.values().filter(|b| b.visible).count();
        self.stats.pending_tasks = self.blocks.values().map(|b| b.pending_tasks as usize).sum();
        self.stats.job_backlog = self.workers.backlog_len();
        self.stats.frame_time = frame_start.elapsed();
        self.frame_timer.record(self.stats.frame_time);
        self.frame += 1;

        tracing::trace!(
            created = self.stats.blocks_created,
            deleted = self.stats.blocks_deleted,
            total = self.stats.total_blocks,
            visible = self.stats.visible_blocks,
            pending = self.stats.pending_tasks,
            "terrain update complete"
        );
    }

    /// Queue an edit for the next [`update`](Self::update).
    pub fn apply_edit(&self, edit: VoxelEdit) {
        // the receiver lives in `self`, so the channel cannot be disconnected
        let _ = self.edit_tx.send(edit);
    }

    /// Handle for queueing edits from other threads.
    pub fn edit_sender(&self) -> EditSender {
        EditSender {
            tx: self.edit_tx.clone(),
        }
    }

    /// Applied edits, kept per lowest-LOD region for blocks generated later.
    pub fn edit_log(&self) -> &EditLog {
        &self.edit_log
    }

    /// Scene actions produced since the last call.
    pub fn take_actions(&mut self) -> Vec<SceneAction> {
        std::mem::take(&mut self.actions)
    }

    /// Statistics of the most recent update.
    pub fn stats(&self) -> &TerrainStats {
        &self.stats
    }

    pub fn frame_timer(&self) -> &FrameTimer {
        &self.frame_timer
    }

    pub fn block(&self, id: BlockId) -> Option<&VoxelBlock> {
        self.blocks.get(&id)
    }

    /// All live blocks in id order.
    pub fn blocks(&self) -> impl Iterator<Item = &VoxelBlock> {
        self.blocks.values()
    }

    pub fn block_at(&self, lod: u32, position: I64Vec3) -> Option<&VoxelBlock> {
        let id = self.lods.get(lod as usize)?.get(&position)?;
        self.blocks.get(id)
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Visible blocks whose bounds intersect `frustum`.
    pub fn cull(&mut self, frustum: &Frustum) -> Vec<BlockId> {
        self.cull_tree.clear_filter();
        self.cull_tree.add_frustum_filter(*frustum);
        self.cull_tree.filter();
        let result = self.cull_tree.result().to_vec();
        self.cull_tree.clear_filter();
        result
    }

    /// Density of the LOD 0 voxel at a world position, if its block has a
    /// grid.
    pub fn voxel_density(&self, world: I64Vec3) -> Option<u8> {
        self.voxel_density_at_lod(0, world)
    }

    pub fn voxel_density_at_lod(&self, lod: u32, world: I64Vec3) -> Option<u8> {
        if lod >= self.config.lod_count {
            return None;
        }
        let (position, local) = lod::world_to_block(&self.config, lod, world);
        let block = self.block_at(lod, position)?;
        block.grid.as_ref().map(|grid| grid.density(local))
    }

    /// Walk LOD 0 voxels from `from` to `to` and report where the ray first
    /// enters solid material. Voxels without a generated block count as
    /// empty; a ray starting inside solid only hits after leaving it.
    pub fn cast_ray(&self, from: I64Vec3, to: I64Vec3) -> Option<RayHit> {
        let offset = to - from;
        if offset.abs().max_element() > i32::MAX as i64 {
            return None;
        }
        let solid = |pos: I64Vec3| {
            self.voxel_density(pos)
                .filter(|value| *value != self.config.non_solid_value)
        };

        let mut inside_solid = solid(from).is_some();
        let mut previous = from;
        for step in VoxelLine::new(IVec3::ZERO, offset.as_ivec3()) {
            let pos = from + step.as_i64vec3();
            match solid(pos) {
                Some(value) if !inside_solid => {
                    return Some(RayHit {
                        inside: pos,
                        outside: previous,
                        value,
                    });
                }
                Some(_) => {}
                None => inside_solid = false,
            }
            previous = pos;
        }
        None
    }

    /// Stop the worker threads. Jobs submitted afterwards run inline.
    pub fn shutdown(&mut self) {
        self.workers.shutdown();
        tracing::info!(blocks = self.blocks.len(), "terrain manager shut down");
    }

    pub(crate) fn create_block(&mut self, lod: u32, position: I64Vec3, parent: Option<BlockId>) -> BlockId {
        let id = BlockId(self.next_id);
        self.next_id += 1;

        let mut block = VoxelBlock::new(id, lod, position, parent);
        let level = &self.lods[lod as usize];
        for face in Face::ALL {
            if let Some(&neighbor) = level.get(&(position + face.offset())) {
                block.neighbors[face.index()] = Some(neighbor);
                if let Some(other) = self.blocks.get_mut(&neighbor) {
                    other.neighbors[face.opposite().index()] = Some(id);
                }
            }
        }
        self.lods[lod as usize].insert(position, id);
        self.blocks.insert(id, block);
        self.stats.blocks_created += 1;
        tracing::debug!(?id, lod, %position, "block created");
        id
    }

    pub(crate) fn destroy_block(&mut self, id: BlockId) {
        let Some(block) = self.blocks.remove(&id) else {
            return;
        };
        if block.mesh.is_some() {
            self.actions.push(SceneAction::Detach { block: id });
        }
        if self.cull_tree.contains(id) {
            self.cull_tree.remove(id);
        }
        self.lods[block.lod as usize].remove(&block.position);
        for face in Face::ALL {
            if let Some(other) = block.neighbors[face.index()].and_then(|n| self.blocks.get_mut(&n)) {
                other.neighbors[face.opposite().index()] = None;
            }
        }
        if let Some(parent_id) = block.parent {
            let orphaned = self
                .blocks
                .get(&parent_id)
                .and_then(|parent| parent.children)
                .is_some_and(|children| children.iter().all(|c| !self.blocks.contains_key(c)));
            if orphaned {
                if let Some(parent) = self.blocks.get_mut(&parent_id) {
                    parent.children = None;
                }
            }
        }
        if block.lod == self.config.lowest_lod() {
            self.needs_discovery = true;
        }
        self.stats.blocks_deleted += 1;
        tracing::debug!(?id, lod = block.lod, position = %block.position, "block deleted");
    }

    /// Mark a block and all its descendants for deletion.
    pub(crate) fn mark_for_deletion(&mut self, id: BlockId) {
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            let Some(block) = self.blocks.get_mut(&id) else {
                continue;
            };
            block.state = BlockState::ToDelete;
            block.in_range = false;
            if let Some(children) = block.children {
                stack.extend(children);
            }
        }
    }

    fn update_lifecycle(&mut self, observer_blocks: &[I64Vec3]) {
        let lowest = self.config.lowest_lod();
        let ids: Vec<BlockId> = self.blocks.keys().copied().collect();

        for id in ids {
            let Some(block) = self.blocks.get_mut(&id) else {
                continue;
            };
            if block.state == BlockState::ToDelete {
                continue;
            }
            let distance = lod::block_distance(block.position, observer_blocks[block.lod as usize]);
            let is_lowest = block.lod == lowest;
            if is_lowest {
                block.in_range = distance <= self.config.discovery_distance() as i64;
            }

            if block.state == BlockState::Created {
                if !is_lowest || distance <= self.config.setup_distance as i64 {
                    self.request_generation(id);
                }
                continue;
            }

            let subdivide = block.state.has_grid()
                && block.lod > 0
                && block.has_surface
                && block.children.is_none()
                && distance <= self.config.subdivide_distance as i64;
            let merge_distance = self.config.subdivide_distance as i64 + self.config.merge_hysteresis as i64;
            let children = block.children;

            if subdivide {
                self.subdivide(id);
            } else if let Some(children) = children {
                let live = children
                    .iter()
                    .any(|c| self.blocks.get(c).is_some_and(|c| c.state != BlockState::ToDelete));
                if live && distance > merge_distance {
                    self.merge(id, children);
                }
            }
        }
    }

    fn request_generation(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(&id) else {
            return;
        };
        block.state = BlockState::GenerationRequested;
        block.pending_tasks += 1;

        let edge = self.config.grid_edge() as i32;
        let request = GenerationRequest {
            block: id,
            lod: block.lod,
            world_box: lod::grid_world_box(&self.config, block.lod, block.position),
            voxel_size: self.config.voxel_size(block.lod),
            dims: IVec3::splat(edge),
            non_solid_value: self.config.non_solid_value,
        };
        self.stats.generation_requested += 1;
        self.workers.submit(Job::Generate(request));
    }

    fn subdivide(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(&id) else {
            return;
        };
        let lod = block.lod - 1;
        let base = block.position * 2;

        let children: [BlockId; 8] =
            std::array::from_fn(|i| self.create_block(lod, base + octant_offset(i), Some(id)));
        if let Some(block) = self.blocks.get_mut(&id) {
            block.children = Some(children);
        }
        for child in children {
            self.request_generation(child);
        }
        self.stats.subdivisions += 1;
        tracing::debug!(?id, child_lod = lod, "block subdivided");
    }

    fn merge(&mut self, id: BlockId, children: [BlockId; 8]) {
        for child in children {
            self.mark_for_deletion(child);
        }
        self.stats.merges += 1;
        tracing::debug!(?id, "children merged");
    }

    /// Faces whose same-LOD neighbour is missing or leaving, so the block
    /// borders coarser terrain there.
    fn transition_mask(&self, block: &VoxelBlock) -> u8 {
        let mut mask = 0;
        for face in Face::ALL {
            if !lod::in_world(&self.config, block.lod, block.position + face.offset()) {
                continue;
            }
            let coarse = match block.neighbor(face).and_then(|n| self.blocks.get(&n)) {
                Some(neighbor) => !neighbor.in_range || neighbor.state == BlockState::ToDelete,
                None => true,
            };
            if coarse {
                mask |= face.transition_bit();
            }
        }
        mask
    }

    /// A block may mesh once everything it borders has voxel data. Across
    /// each face that is the finest live block covering the neighbouring
    /// cell; faces at the world edge or next to undiscovered space have
    /// nothing to wait for.
    fn neighbors_ready(&self, block: &VoxelBlock) -> bool {
        Face::ALL.iter().all(|&face| {
            let across = block.position + face.offset();
            if !lod::in_world(&self.config, block.lod, across) {
                return true;
            }
            self.covering_block(block.lod, across)
                .is_none_or(|cover| cover.state.has_grid())
        })
    }

    /// Finest block at `lod` or coarser that contains the LOD `lod` cell
    /// `position` and is not being released.
    fn covering_block(&self, lod: u32, position: I64Vec3) -> Option<&VoxelBlock> {
        (lod..self.config.lod_count).find_map(|level| {
            let shift = level - lod;
            let cell = I64Vec3::new(position.x >> shift, position.y >> shift, position.z >> shift);
            self.lods[level as usize]
                .get(&cell)
                .and_then(|id| self.blocks.get(id))
                .filter(|b| b.state != BlockState::ToDelete)
        })
    }

    fn update_meshes(&mut self) {
        let lowest = self.config.lowest_lod();
        let ids: Vec<BlockId> = self
            .blocks
            .values()
            .filter(|b| b.lod != lowest && b.state.has_grid())
            .map(|b| b.id)
            .collect();

        for id in ids {
            let Some(block) = self.blocks.get(&id) else {
                continue;
            };
            let mask = self.transition_mask(block);
            let ready = self.neighbors_ready(block);
            let Some(block) = self.blocks.get_mut(&id) else {
                continue;
            };

            if mask != block.transition_mask {
                block.transition_mask = mask;
                if block.mesh.is_some() || block.state == BlockState::MeshRequested {
                    block.dirty = true;
                }
            }

            if !block.has_surface {
                if block.mesh.is_some() && block.state != BlockState::MeshRequested {
                    self.detach_mesh(id);
                }
                continue;
            }

            let wants_mesh = match block.state {
                BlockState::Generated => block.mesh.is_none() || block.dirty,
                BlockState::Visible => block.dirty,
                _ => false,
            };
            if wants_mesh && ready {
                self.request_mesh(id);
            }
        }
    }

    fn request_mesh(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get(&id) else {
            return;
        };
        let Some(grid) = block.grid.clone() else {
            return;
        };
        let parent = block.parent.and_then(|p| self.blocks.get(&p)).and_then(|parent| {
            parent.grid.clone().map(|grid| ParentSample {
                grid,
                octant: (block.position - parent.position * 2).as_ivec3(),
            })
        });
        let input = MeshInput {
            block: id,
            lod: block.lod,
            world_min: lod::block_world_min(&self.config, block.lod, block.position),
            voxel_size: self.config.voxel_size(block.lod),
            block_size: self.config.block_size as i32,
            grid,
            parent,
            transition_mask: block.transition_mask,
        };

        if let Some(block) = self.blocks.get_mut(&id) {
            block.state = BlockState::MeshRequested;
            block.pending_tasks += 1;
            block.dirty = false;
        }
        self.stats.mesh_requested += 1;
        self.workers.submit(Job::Mesh(input));
    }

    fn detach_mesh(&mut self, id: BlockId) {
        let Some(block) = self.blocks.get_mut(&id) else {
            return;
        };
        if block.mesh.take().is_none() {
            return;
        }
        block.state = BlockState::Generated;
        block.dirty = false;
        block.visible = false;
        if self.cull_tree.contains(id) {
            self.cull_tree.remove(id);
        }
        self.actions.push(SceneAction::Detach { block: id });
    }

    fn process_completions(&mut self) {
        for result in self.workers.drain() {
            let id = result.block();
            let Some(block) = self.blocks.get_mut(&id) else {
                self.stats.results_discarded += 1;
                continue;
            };
            block.pending_tasks = block.pending_tasks.saturating_sub(1);

            match result {
                JobResult::Generated { result, .. } => {
                    if block.state != BlockState::GenerationRequested {
                        self.stats.results_discarded += 1;
                        continue;
                    }
                    match result {
                        Ok(grid) => self.install_grid(id, grid),
                        Err(err) => {
                            block.state = BlockState::Created;
                            block.failed_generations += 1;
                            self.stats.generation_failed += 1;
                            tracing::warn!(
                                ?id,
                                lod = block.lod,
                                attempts = block.failed_generations,
                                error = %err,
                                "block generation failed"
                            );
                        }
                    }
                }
                JobResult::Meshed { result, .. } => {
                    if block.state != BlockState::MeshRequested {
                        self.stats.results_discarded += 1;
                        continue;
                    }
                    match result {
                        Ok(mesh) => self.install_mesh(id, mesh),
                        Err(err) => {
                            // keep the old mesh, if any, and try again next pass
                            block.state = if block.mesh.is_some() {
                                BlockState::Visible
                            } else {
                                BlockState::Generated
                            };
                            block.dirty = true;
                            self.stats.mesh_failed += 1;
                            tracing::warn!(?id, lod = block.lod, error = %err, "block meshing failed");
                        }
                    }
                }
                JobResult::PropsPlaced { .. } => {}
            }
        }
    }

    fn install_grid(&mut self, id: BlockId, mut grid: VoxelGrid) {
        let Some(block) = self.blocks.get_mut(&id) else {
            return;
        };
        let world_box = lod::grid_world_box(&self.config, block.lod, block.position);
        let voxel_size = self.config.voxel_size(block.lod);
        let shift = self.config.lowest_lod() - block.lod;
        let region = I64Vec3::new(
            block.position.x >> shift,
            block.position.y >> shift,
            block.position.z >> shift,
        );
        for edit in self.edit_log.edits(region).iter().filter(|e| e.bounds().intersects(&world_box)) {
            edit.apply_to_grid(&mut grid, world_box.min, voxel_size);
        }
        block.has_surface = !grid.is_uniform();
        block.grid = Some(grid);
        block.state = BlockState::Generated;
        self.stats.generation_completed += 1;
    }

    fn install_mesh(&mut self, id: BlockId, mesh: MeshData) {
        let place_props = self.workers.has_props();
        let Some(block) = self.blocks.get_mut(&id) else {
            return;
        };
        if block.mesh.is_some() {
            self.actions.push(SceneAction::Detach { block: id });
        }
        if block.visible && self.cull_tree.contains(id) {
            self.cull_tree.remove(id);
        }
        block.mesh_revision += 1;
        let handle = MeshHandle {
            revision: block.mesh_revision,
            data: Arc::new(mesh),
        };
        block.mesh = Some(handle.clone());
        block.state = BlockState::Visible;
        block.visible = false;
        self.actions.push(SceneAction::Attach {
            block: id,
            mesh: handle,
        });
        self.stats.mesh_completed += 1;

        if place_props && block.lod == 0 && !block.props_placed {
            if let Some(grid) = block.grid.clone() {
                block.props_placed = true;
                block.pending_tasks += 1;
                let placement = PropPlacement {
                    block: id,
                    world_box: lod::grid_world_box(&self.config, 0, block.position),
                    voxel_size: 1,
                    grid,
                };
                self.workers.submit(Job::Props(placement));
            }
        }
    }

    fn apply_queued_edits(&mut self) {
        let edits: Vec<VoxelEdit> = self.edit_rx.try_iter().collect();
        for edit in edits {
            self.apply_edit_now(edit);
        }
    }

    fn apply_edit_now(&mut self, edit: VoxelEdit) {
        let bounds = edit.bounds();
        let mut touched = Vec::new();
        for block in self.blocks.values_mut() {
            if !block.state.has_grid() {
                continue;
            }
            let Some(grid) = block.grid.as_mut() else {
                continue;
            };
            let world_box = lod::grid_world_box(&self.config, block.lod, block.position);
            if !world_box.intersects(&bounds) {
                continue;
            }
            edit.apply_to_grid(grid, world_box.min, self.config.voxel_size(block.lod));
            block.has_surface = !grid.is_uniform();
            block.dirty = true;
            touched.push(block.id);
        }

        for id in &touched {
            let neighbors = self.blocks.get(id).map(|b| b.neighbors).unwrap_or_default();
            for neighbor in neighbors.into_iter().flatten() {
                if let Some(neighbor) = self.blocks.get_mut(&neighbor) {
                    if neighbor.state.has_grid() {
                        neighbor.dirty = true;
                    }
                }
            }
        }

        tracing::debug!(?bounds, density = edit.density, blocks = touched.len(), "edit applied");
        let regions = self.edit_regions(&bounds);
        self.edit_log.record(edit, regions);
        self.stats.edits_applied += 1;
        self.stats.blocks_edited += touched.len();
    }

    /// Lowest-LOD regions, with their grid boxes, whose grids reach `bounds`.
    /// Every finer grid lies inside its region's grid box.
    fn edit_regions(&self, bounds: &AABox) -> Vec<(I64Vec3, AABox)> {
        let lowest = self.config.lowest_lod();
        let size = self.config.block_world_size(lowest);
        let reach = self.config.grid_edge() as i64 * self.config.voxel_size(lowest);
        let first = I64Vec3::new(
            bounds.min.x.saturating_sub(reach).div_euclid(size) + 1,
            bounds.min.y.saturating_sub(reach).div_euclid(size) + 1,
            bounds.min.z.saturating_sub(reach).div_euclid(size) + 1,
        )
        .max(I64Vec3::ZERO);
        let last = I64Vec3::new(
            bounds.max.x.div_euclid(size),
            bounds.max.y.div_euclid(size),
            bounds.max.z.div_euclid(size),
        )
        .min(self.config.max_discovery_bounds - I64Vec3::ONE);

        let mut regions = Vec::new();
        for z in first.z..=last.z {
            for y in first.y..=last.y {
                for x in first.x..=last.x {
                    let region = I64Vec3::new(x, y, z);
                    let region_box = lod::grid_world_box(&self.config, lowest, region);
                    if region_box.intersects(bounds) {
                        regions.push((region, region_box));
                    }
                }
            }
        }
        regions
    }

    /// Children fully replace their parent once each one is either meshed
    /// or known to be empty.
    fn children_cover(&self, block: &VoxelBlock) -> bool {
        let Some(children) = block.children else {
            return false;
        };
        children.iter().all(|c| {
            self.blocks.get(c).is_some_and(|child| {
                child.in_range
                    && child.state != BlockState::ToDelete
                    && (child.mesh.is_some() || (child.state.has_grid() && !child.has_surface))
            })
        })
    }

    fn update_visibility(&mut self) {
        let lowest = self.config.lowest_lod() as usize;
        let mut roots: Vec<BlockId> = self.lods[lowest].values().copied().collect();
        roots.sort();

        let mut stack: Vec<(BlockId, bool)> = Vec::new();
        for root in roots.into_iter().rev() {
            if let Some(children) = self.blocks.get(&root).and_then(|b| b.children) {
                stack.extend(children.iter().rev().map(|c| (*c, true)));
            }
        }

        while let Some((id, delegated)) = stack.pop() {
            let Some(block) = self.blocks.get(&id) else {
                continue;
            };
            let covered = self.children_cover(block);
            let visible = delegated
                && block.mesh.is_some()
                && block.in_range
                && block.state != BlockState::ToDelete
                && !covered;
            if let Some(children) = block.children {
                stack.extend(children.iter().rev().map(|c| (*c, delegated && covered)));
            }
            if visible != block.visible {
                self.set_visible(id, visible);
            }
        }
    }

    fn set_visible(&mut self, id: BlockId, visible: bool) {
        let Some(block) = self.blocks.get_mut(&id) else {
            return;
        };
        block.visible = visible;
        if visible {
            let sphere = lod::block_sphere(&self.config, block.lod, block.position);
            self.cull_tree.insert(id, sphere);
        } else if self.cull_tree.contains(id) {
            self.cull_tree.remove(id);
        }
        self.actions.push(SceneAction::SetVisible { block: id, visible });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use glam::DMat4;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;
    use strata_common::{AABox, ISphere, splitmix64};

    const GROUND: i64 = 20;

    fn test_config() -> TerrainConfig {
        TerrainConfig {
            block_size: 8,
            block_overlap: 2,
            lod_count: 3,
            setup_distance: 2,
            subdivide_distance: 1,
            merge_hysteresis: 1,
            max_discovery_bounds: I64Vec3::splat(6),
            rediscovery_distance: None,
            worker_threads: 0,
            non_solid_value: 0,
        }
    }

    /// Solid below `GROUND`, air above.
    fn flat_ground(r: &GenerationRequest) -> Result<VoxelGrid, GenerationError> {
        solid_below(GROUND, r)
    }

    fn solid_below(height: i64, r: &GenerationRequest) -> Result<VoxelGrid, GenerationError> {
        let mut grid = r.empty_grid(0);
        let below = height - r.world_box.min.y;
        let solid = (-(-below).div_euclid(r.voxel_size)).clamp(0, r.dims.y as i64) as i32;
        if solid > 0 {
            for z in 0..r.dims.z {
                for x in 0..r.dims.x {
                    grid.set_density_span(IVec3::new(x, 0, z), solid, 1);
                }
            }
        }
        Ok(grid)
    }

    fn center() -> DVec3 {
        DVec3::new(96.0, 20.0, 96.0)
    }

    fn run(manager: &mut TerrainManager, observer: DVec3, frames: usize) {
        for _ in 0..frames {
            manager.update(&observer);
        }
    }

    fn streamed() -> TerrainManager {
        let mut manager = TerrainManager::new(test_config(), flat_ground).unwrap();
        run(&mut manager, center(), 8);
        manager
    }

    fn count(manager: &TerrainManager, f: impl Fn(&VoxelBlock) -> bool) -> usize {
        manager.blocks().filter(|b| f(b)).count()
    }

    fn assert_links_consistent(manager: &TerrainManager) {
        for block in manager.blocks() {
            for face in Face::ALL {
                if let Some(n) = block.neighbor(face) {
                    let other = manager.block(n).expect("dangling neighbour");
                    assert_eq!(other.neighbor(face.opposite()), Some(block.id()));
                    assert_eq!(other.lod(), block.lod());
                }
            }
            if let Some(parent) = block.parent() {
                let parent = manager.block(parent).expect("dangling parent");
                assert!(parent.children().unwrap().contains(&block.id()));
            } else {
                assert_eq!(block.lod(), manager.config().lowest_lod());
            }
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = TerrainConfig {
            block_size: 6,
            ..test_config()
        };
        assert!(matches!(
            TerrainManager::new(config, flat_ground),
            Err(ConfigError::Invalid { field: "block_size", .. })
        ));
    }

    #[test]
    fn streams_lod_blocks_around_observer() {
        let mut manager = streamed();

        // discovery cube clamped to the 6x6x6 world
        assert_eq!(count(&manager, |b| b.lod() == 2), 6 * 5 * 6);
        assert_eq!(count(&manager, |b| b.lod() == 1), 9 * 8);
        assert_eq!(count(&manager, |b| b.lod() == 0), 9 * 8);
        assert_eq!(count(&manager, |b| b.lod() == 2 && b.is_visible()), 0);

        // finest blocks on the surface layer replace their parents
        assert_eq!(count(&manager, |b| b.lod() == 0 && b.is_visible()), 36);
        assert_eq!(count(&manager, |b| b.lod() == 1 && b.is_visible()), 27);
        for block in manager.blocks().filter(|b| b.is_visible()) {
            let mut parent = block.parent();
            while let Some(id) = parent {
                let p = manager.block(id).unwrap();
                assert!(!p.is_visible(), "{:?} and ancestor {id:?} both visible", block.id());
                parent = p.parent();
            }
        }

        let actions = manager.take_actions();
        let attached: HashSet<BlockId> = actions
            .iter()
            .filter_map(|a| match a {
                SceneAction::Attach { block, .. } => Some(*block),
                _ => None,
            })
            .collect();
        assert!(manager.blocks().filter(|b| b.is_visible()).all(|b| attached.contains(&b.id())));
        assert!(manager.take_actions().is_empty());

        assert_eq!(manager.stats().visible_blocks, 63);
        assert_eq!(manager.stats().pending_tasks, 0);
        assert_eq!(manager.frame_timer().count(), 8);
        assert_links_consistent(&manager);
    }

    #[test]
    fn stable_terrain_goes_quiet() {
        let mut manager = streamed();
        manager.take_actions();
        manager.update(&center());
        let stats = manager.stats();
        assert_eq!(stats.blocks_created, 0);
        assert_eq!(stats.generation_requested, 0);
        assert_eq!(stats.mesh_requested, 0);
        assert!(manager.take_actions().is_empty());
    }

    #[test]
    fn failed_generation_is_retried() {
        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        let generator = move |r: &GenerationRequest| -> Result<VoxelGrid, GenerationError> {
            if counter.fetch_add(1, Ordering::SeqCst) < 5 {
                return Err(GenerationError::failed("storage offline"));
            }
            flat_ground(r)
        };
        let mut manager = TerrainManager::new(test_config(), generator).unwrap();

        manager.update(&center());
        assert_eq!(manager.stats().generation_failed, 5);
        let retried: Vec<BlockId> = manager
            .blocks()
            .filter(|b| b.failed_generations() > 0)
            .map(|b| b.id())
            .collect();
        assert_eq!(retried.len(), 5);
        assert!(retried
            .iter()
            .all(|id| manager.block(*id).unwrap().state() == BlockState::Created));

        run(&mut manager, center(), 8);
        assert!(retried
            .iter()
            .all(|id| manager.block(*id).unwrap().state().has_grid()));
        assert_eq!(count(&manager, |b| b.lod() == 0 && b.is_visible()), 36);
    }

    #[test]
    fn generator_panic_is_contained() {
        let calls = AtomicUsize::new(0);
        let generator = move |r: &GenerationRequest| -> Result<VoxelGrid, GenerationError> {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("corrupt heightmap");
            }
            flat_ground(r)
        };
        let mut manager = TerrainManager::new(test_config(), generator).unwrap();
        manager.update(&center());
        assert_eq!(manager.stats().generation_failed, 1);
        run(&mut manager, center(), 8);
        assert_eq!(count(&manager, |b| b.lod() == 0 && b.is_visible()), 36);
    }

    #[test]
    fn box_edit_reaches_both_blocks_and_remeshes() {
        let mut manager = streamed();
        // spans LOD 0 blocks x = 10 (world 80..87) and x = 11 (world 88..95)
        let region = AABox::new(I64Vec3::new(86, 22, 84), I64Vec3::new(89, 23, 85));
        let left = manager.block_at(0, I64Vec3::new(10, 2, 10)).unwrap().id();
        let right = manager.block_at(0, I64Vec3::new(11, 2, 10)).unwrap().id();
        let revisions = [left, right].map(|id| manager.block(id).unwrap().mesh_revision());
        assert_eq!(manager.voxel_density(I64Vec3::new(86, 22, 84)), Some(0));

        manager.apply_edit(VoxelEdit::fill_box(region, 1));
        manager.update(&center());
        assert_eq!(manager.stats().edits_applied, 1);
        assert!(manager.stats().blocks_edited >= 2);
        assert!(manager.block(left).unwrap().is_dirty());
        assert!(manager.block(right).unwrap().is_dirty());

        manager.update(&center());
        for (id, before) in [left, right].into_iter().zip(revisions) {
            let block = manager.block(id).unwrap();
            assert!(!block.is_dirty());
            assert!(block.mesh_revision() > before);
        }
        for z in 84..=85 {
            for y in 22..=23 {
                for x in 86..=89 {
                    assert_eq!(manager.voxel_density(I64Vec3::new(x, y, z)), Some(1));
                }
            }
        }
        // the overlap of the left block saw the edit too
        let grid = manager.block(left).unwrap().grid().unwrap();
        assert_eq!(grid.density(IVec3::new(8, 6, 4)), 1);
        assert_eq!(manager.edit_log().recorded(), 1);
        assert_eq!(manager.edit_log().region_count(), 1);
    }

    #[test]
    fn edits_replay_onto_blocks_generated_later() {
        let mut manager = TerrainManager::new(test_config(), flat_ground).unwrap();
        let sphere = ISphere::new(I64Vec3::new(100, 19, 100), 3);
        manager.edit_sender().send(VoxelEdit::fill_sphere(sphere, 0));
        run(&mut manager, center(), 8);

        // LOD 0 blocks only exist after two subdivisions
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 19, 100)), Some(0));
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 16, 100)), Some(0));
        assert_eq!(manager.voxel_density(I64Vec3::new(103, 17, 100)), Some(1));
        assert_eq!(manager.voxel_density(I64Vec3::new(104, 19, 100)), Some(1));
    }

    #[test]
    fn edits_survive_leaving_and_returning() {
        let mut manager = streamed();
        let dig = AABox::new(I64Vec3::new(98, 16, 98), I64Vec3::new(101, 19, 101));
        manager.apply_edit(VoxelEdit::fill_box(dig, 0));
        manager.update(&center());
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 18, 100)), Some(0));

        run(&mut manager, DVec3::new(180.0, 20.0, 180.0), 10);
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 18, 100)), None);

        // the finest blocks come back freshly generated
        run(&mut manager, center(), 12);
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 18, 100)), Some(0));
        assert_eq!(manager.voxel_density(I64Vec3::new(104, 18, 100)), Some(1));
    }

    #[test]
    fn repeated_edits_on_one_spot_keep_the_log_small() {
        let mut manager = streamed();
        let spot = AABox::new(I64Vec3::new(98, 16, 98), I64Vec3::new(101, 19, 101));
        for i in 0..50 {
            manager.apply_edit(VoxelEdit::fill_box(spot, (i % 2) as u8));
        }
        manager.update(&center());
        assert_eq!(manager.stats().edits_applied, 50);
        assert_eq!(manager.edit_log().recorded(), 50);
        // regions x, z in 2..=3 reach the spot through their overlap
        assert_eq!(manager.edit_log().region_count(), 4);
        assert_eq!(manager.edit_log().len(), 4);
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 18, 100)), Some(1));
    }

    #[test]
    fn digging_through_an_empty_block_gives_it_a_surface() {
        let mut manager = streamed();
        let lod1 = manager.block_at(1, I64Vec3::new(6, 0, 6)).unwrap().id();
        assert!(!manager.block(lod1).unwrap().has_surface());

        let region = AABox::new(I64Vec3::new(100, 4, 100), I64Vec3::new(103, 19, 103));
        manager.apply_edit(VoxelEdit::fill_box(region, 0));
        manager.update(&center());
        assert!(manager.block(lod1).unwrap().has_surface());
    }

    #[test]
    fn leaving_an_area_releases_its_blocks() {
        let mut manager = streamed();
        manager.take_actions();
        let old_finest: Vec<BlockId> = manager
            .blocks()
            .filter(|b| b.lod() == 0)
            .map(|b| b.id())
            .collect();

        let far = DVec3::new(180.0, 20.0, 180.0);
        run(&mut manager, far, 10);

        assert!(old_finest.iter().all(|id| manager.block(*id).is_none()));
        assert!(manager.block_at(2, I64Vec3::new(0, 0, 0)).is_none());
        assert!(manager.block_at(2, I64Vec3::new(5, 0, 5)).is_some());
        assert!(count(&manager, |b| b.lod() == 0 && b.is_visible()) > 0);

        let actions = manager.take_actions();
        let detached: HashSet<BlockId> = actions
            .iter()
            .filter_map(|a| match a {
                SceneAction::Detach { block } => Some(*block),
                _ => None,
            })
            .collect();
        let old_visible = old_finest.iter().filter(|id| detached.contains(id)).count();
        assert_eq!(old_visible, 36);
        assert_links_consistent(&manager);
        assert!(manager.blocks().all(|b| b.state() != BlockState::ToDelete));
    }

    #[test]
    fn queries_resolve_through_owning_blocks() {
        let manager = streamed();
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 18, 100)), Some(1));
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 22, 100)), Some(0));
        // no LOD 0 block below the surface layer
        assert_eq!(manager.voxel_density(I64Vec3::new(100, 10, 100)), None);
        assert_eq!(manager.voxel_density_at_lod(2, I64Vec3::new(100, 10, 100)), Some(1));
        assert_eq!(manager.voxel_density_at_lod(7, I64Vec3::ZERO), None);

        let hit = manager
            .cast_ray(I64Vec3::new(100, 30, 100), I64Vec3::new(100, 16, 100))
            .unwrap();
        assert_eq!(hit.inside, I64Vec3::new(100, 19, 100));
        assert_eq!(hit.outside, I64Vec3::new(100, 20, 100));
        assert_eq!(hit.value, 1);

        // starting underground does not count as a hit
        assert_eq!(
            manager.cast_ray(I64Vec3::new(100, 18, 100), I64Vec3::new(100, 30, 100)),
            None
        );
        // nothing streamed there
        assert_eq!(manager.cast_ray(I64Vec3::new(0, 18, 0), I64Vec3::new(10, 18, 0)), None);
    }

    #[test]
    fn cull_returns_visible_blocks_in_view() {
        let mut manager = streamed();
        let visible: HashSet<BlockId> = manager
            .blocks()
            .filter(|b| b.is_visible())
            .map(|b| b.id())
            .collect();

        let view = DMat4::look_at_rh(
            DVec3::new(96.0, 96.0, 400.0),
            DVec3::new(96.0, 96.0, 0.0),
            DVec3::Y,
        );
        let everything = Frustum::from_view_projection(
            &(DMat4::orthographic_rh(-200.0, 200.0, -200.0, 200.0, 0.1, 1000.0) * view),
        );
        let all: HashSet<BlockId> = manager.cull(&everything).into_iter().collect();
        assert_eq!(all, visible);

        // a slab over world x 60..100
        let slab = Frustum::from_view_projection(
            &(DMat4::orthographic_rh(-36.0, 4.0, -200.0, 200.0, 0.1, 1000.0) * view),
        );
        let some: Vec<BlockId> = manager.cull(&slab);
        assert!(!some.is_empty());
        assert!(some.len() < visible.len());
        for id in &some {
            assert!(visible.contains(id));
        }
        for block in manager.blocks().filter(|b| b.is_visible()) {
            let sphere = lod::block_sphere(manager.config(), block.lod(), block.position());
            if sphere.center.x > 70.0 && sphere.center.x < 90.0 {
                assert!(some.contains(&block.id()));
            }
        }
    }

    #[test]
    fn props_are_placed_once_per_finest_block() {
        let placed = Arc::new(AtomicUsize::new(0));
        let counter = placed.clone();
        let props: Arc<dyn PropPlacer> = Arc::new(move |p: &PropPlacement| {
            assert_eq!(p.grid.dims(), IVec3::splat(10));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut manager = TerrainManager::with_delegates(
            test_config(),
            Arc::new(flat_ground),
            Arc::new(SurfaceMesher),
            Some(props),
        )
        .unwrap();
        run(&mut manager, center(), 8);
        assert_eq!(placed.load(Ordering::SeqCst), 36);

        // a re-mesh does not place props again
        manager.apply_edit(VoxelEdit::fill_box(
            AABox::new(I64Vec3::new(90, 21, 90), I64Vec3::new(91, 21, 91)),
            1,
        ));
        run(&mut manager, center(), 2);
        assert_eq!(placed.load(Ordering::SeqCst), 36);
    }

    #[test]
    fn surface_under_a_coarse_boundary_is_meshed() {
        // the lowest-LOD layer above y = 32 is empty and never subdivides
        let mut manager = TerrainManager::new(test_config(), |r: &GenerationRequest| solid_below(31, r)).unwrap();
        run(&mut manager, DVec3::new(96.0, 30.0, 96.0), 10);

        let surface: Vec<&VoxelBlock> = manager
            .blocks()
            .filter(|b| b.lod() == 0 && b.has_surface())
            .collect();
        assert_eq!(surface.len(), 36);
        for block in &surface {
            assert_eq!(block.position().y, 3);
            assert!(block.mesh().is_some(), "{:?} at {} never meshed", block.id(), block.position());
            assert!(block.is_visible());
            // nothing of its own LOD above it
            assert_ne!(block.transition_mask() & Face::PosY.transition_bit(), 0);
        }
        assert_eq!(manager.stats().pending_tasks, 0);
    }

    /// Panics on the first block it is asked to mesh.
    #[derive(Default)]
    struct FlakyMesher {
        tripped: AtomicBool,
        victim: AtomicU64,
    }

    impl Mesher for FlakyMesher {
        fn build(&self, input: &MeshInput) -> MeshData {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                self.victim.store(input.block.0, Ordering::SeqCst);
                panic!("vertex buffer overflow");
            }
            SurfaceMesher.build(input)
        }
    }

    #[test]
    fn mesher_panic_is_retried_and_nothing_leaks() {
        let mesher = Arc::new(FlakyMesher::default());
        let mut manager =
            TerrainManager::with_delegates(test_config(), Arc::new(flat_ground), mesher.clone(), None)
                .unwrap();
        let mut failed = 0;
        for _ in 0..10 {
            manager.update(&center());
            failed += manager.stats().mesh_failed;
        }
        assert_eq!(failed, 1);

        let victim = manager.block(BlockId(mesher.victim.load(Ordering::SeqCst))).unwrap();
        assert_eq!(victim.pending_tasks(), 0);
        assert!(victim.mesh().is_some());
        assert_eq!(count(&manager, |b| b.lod() == 0 && b.is_visible()), 36);

        run(&mut manager, DVec3::new(180.0, 20.0, 180.0), 10);
        assert!(manager
            .blocks()
            .all(|b| b.state() != BlockState::ToDelete && b.pending_tasks() == 0));
    }

    /// Generation takes a pseudo-random few milliseconds so completions
    /// arrive out of order.
    fn jittered(r: &GenerationRequest) -> Result<VoxelGrid, GenerationError> {
        let seed = r.world_box.min.x as u64 ^ (r.world_box.min.z as u64) << 20 ^ (r.lod as u64) << 40;
        std::thread::sleep(Duration::from_micros(splitmix64(seed) % 3000));
        flat_ground(r)
    }

    #[test]
    fn meshing_waits_for_neighbour_data() {
        let config = TerrainConfig {
            worker_threads: 4,
            ..test_config()
        };
        let mut manager = TerrainManager::new(config, jittered).unwrap();

        let check_requests = |manager: &TerrainManager, before: &HashMap<BlockId, BlockState>| {
            for block in manager.blocks() {
                let entered = block.state() == BlockState::MeshRequested
                    && before.get(&block.id()) != Some(&BlockState::MeshRequested);
                if !entered {
                    continue;
                }
                for n in block.neighbors().into_iter().flatten() {
                    let state = manager.block(n).unwrap().state();
                    assert!(state >= BlockState::Generated, "{:?} meshed next to {state:?}", block.id());
                }
            }
        };

        // two consecutive frames without any block activity
        let quiet = |stats: &TerrainStats| {
            stats.pending_tasks == 0
                && stats.blocks_created == 0
                && stats.blocks_deleted == 0
                && stats.subdivisions == 0
                && stats.merges == 0
                && stats.generation_requested == 0
                && stats.generation_completed == 0
                && stats.mesh_requested == 0
                && stats.mesh_completed == 0
        };
        for observer in [center(), DVec3::new(180.0, 20.0, 180.0), center()] {
            let mut quiet_frames = 0;
            for _ in 0..3000 {
                let before: HashMap<BlockId, BlockState> =
                    manager.blocks().map(|b| (b.id(), b.state())).collect();
                manager.update(&observer);
                check_requests(&manager, &before);
                assert_links_consistent(&manager);
                if quiet(manager.stats()) {
                    quiet_frames += 1;
                    if quiet_frames == 2 {
                        break;
                    }
                } else {
                    quiet_frames = 0;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            assert_eq!(quiet_frames, 2, "streaming did not settle around {observer}");
        }

        assert_eq!(count(&manager, |b| b.lod() == 0 && b.is_visible()), 36);
        manager.shutdown();
    }
}

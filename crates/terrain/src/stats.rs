use std::time::Duration;

/// Per-frame terrain streaming statistics for instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerrainStats {
    pub frame: u64,
    pub blocks_created: usize,
    pub blocks_deleted: usize,
    pub subdivisions: usize,
    pub merges: usize,
    pub generation_requested: usize,
    pub generation_completed: usize,
    pub generation_failed: usize,
    pub mesh_requested: usize,
    pub mesh_completed: usize,
    pub mesh_failed: usize,
    pub results_discarded: usize,
    pub edits_applied: usize,
    pub blocks_edited: usize,
    pub total_blocks: usize,
    pub visible_blocks: usize,
    pub pending_tasks: usize,
    /// Jobs waiting for a free worker queue slot.
    pub job_backlog: usize,
    pub frame_time: Duration,
}

/// Rolling window of frame times.
#[derive(Debug)]
pub struct FrameTimer {
    history: Vec<Duration>,
    capacity: usize,
    index: usize,
    filled: bool,
}

impl FrameTimer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "frame timer needs capacity");
        Self {
            history: vec![Duration::ZERO; capacity],
            capacity,
            index: 0,
            filled: false,
        }
    }

    pub fn record(&mut self, dt: Duration) {
        self.history[self.index] = dt;
        self.index = (self.index + 1) % self.capacity;
        if self.index == 0 {
            self.filled = true;
        }
    }

    fn recorded(&self) -> &[Duration] {
        let count = if self.filled { self.capacity } else { self.index };
        &self.history[..count]
    }

    pub fn average(&self) -> Duration {
        let recorded = self.recorded();
        if recorded.is_empty() {
            return Duration::ZERO;
        }
        recorded.iter().sum::<Duration>() / recorded.len() as u32
    }

    pub fn max(&self) -> Duration {
        self.recorded().iter().copied().max().unwrap_or(Duration::ZERO)
    }

    pub fn count(&self) -> usize {
        self.recorded().len()
    }
}

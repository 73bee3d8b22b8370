use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use strata_voxel::VoxelGrid;

use crate::block::BlockId;
use crate::delegate::{GenerationRequest, PropPlacement, PropPlacer, VoxelGenerator};
use crate::error::GenerationError;
use crate::mesh::{MeshData, MeshInput, Mesher};

/// Queue slots per worker thread, for both jobs and results.
const QUEUE_SLOTS_PER_THREAD: usize = 32;

pub(crate) enum Job {
    Generate(GenerationRequest),
    Mesh(MeshInput),
    Props(PropPlacement),
}

pub(crate) enum JobResult {
    Generated {
        block: BlockId,
        result: Result<VoxelGrid, GenerationError>,
    },
    Meshed {
        block: BlockId,
        result: Result<MeshData, GenerationError>,
    },
    PropsPlaced {
        block: BlockId,
    },
}

impl JobResult {
    pub(crate) fn block(&self) -> BlockId {
        match self {
            JobResult::Generated { block, .. }
            | JobResult::Meshed { block, .. }
            | JobResult::PropsPlaced { block } => *block,
        }
    }
}

struct Delegates {
    generator: Arc<dyn VoxelGenerator>,
    mesher: Arc<dyn Mesher>,
    props: Option<Arc<dyn PropPlacer>>,
}

impl Delegates {
    fn run(&self, job: Job) -> JobResult {
        match job {
            Job::Generate(request) => JobResult::Generated {
                block: request.block,
                result: self.generate(&request),
            },
            Job::Mesh(input) => JobResult::Meshed {
                block: input.block,
                result: catch_unwind(AssertUnwindSafe(|| self.mesher.build(&input)))
                    .map_err(GenerationError::from_panic),
            },
            Job::Props(placement) => {
                if let Some(props) = &self.props {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| props.place_props(&placement))) {
                        tracing::warn!(
                            block = ?placement.block,
                            error = %GenerationError::from_panic(payload),
                            "prop placement panicked"
                        );
                    }
                }
                JobResult::PropsPlaced {
                    block: placement.block,
                }
            }
        }
    }

    fn generate(&self, request: &GenerationRequest) -> Result<VoxelGrid, GenerationError> {
        let grid = catch_unwind(AssertUnwindSafe(|| self.generator.generate(request)))
            .map_err(GenerationError::from_panic)??;
        if grid.dims() != request.dims {
            return Err(GenerationError::WrongDimensions {
                expected: request.dims,
                actual: grid.dims(),
            });
        }
        Ok(grid.with_non_solid_value(request.non_solid_value))
    }
}

/// Runs generation, meshing and prop jobs on background threads.
///
/// Jobs and results travel over bounded channels. Jobs that do not fit wait
/// in a local backlog that is flushed on every submit and drain, so the
/// caller never blocks; a worker facing a full result queue waits for the
/// next drain. With zero threads, or after shutdown, every job runs inline
/// on submit and its result is held for the next drain, which keeps tests
/// deterministic.
pub(crate) struct WorkerPool {
    delegates: Arc<Delegates>,
    tx_job: Option<Sender<Job>>,
    backlog: VecDeque<Job>,
    rx_done: Option<Receiver<JobResult>>,
    inline_done: Vec<JobResult>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(
        threads: usize,
        generator: Arc<dyn VoxelGenerator>,
        mesher: Arc<dyn Mesher>,
        props: Option<Arc<dyn PropPlacer>>,
    ) -> Self {
        let delegates = Arc::new(Delegates {
            generator,
            mesher,
            props,
        });
        let mut pool = Self {
            delegates,
            tx_job: None,
            backlog: VecDeque::new(),
            rx_done: None,
            inline_done: Vec::new(),
            handles: Vec::new(),
        };
        if threads > 0 {
            pool.spawn_workers(threads);
        }
        pool
    }

    fn spawn_workers(&mut self, threads: usize) {
        let capacity = threads * QUEUE_SLOTS_PER_THREAD;
        let (tx_job, rx_job) = bounded::<Job>(capacity);
        let (tx_done, rx_done) = bounded::<JobResult>(capacity);
        for i in 0..threads {
            let delegates = self.delegates.clone();
            let rx_job = rx_job.clone();
            let tx_done = tx_done.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("terrain-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx_job.recv() {
                        if tx_done.send(delegates.run(job)).is_err() {
                            break;
                        }
                    }
                });
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(err) => {
                    tracing::warn!(%err, spawned = i, "failed to spawn terrain worker");
                    break;
                }
            }
        }
        if !self.handles.is_empty() {
            self.tx_job = Some(tx_job);
            self.rx_done = Some(rx_done);
        }
        tracing::debug!(threads = self.handles.len(), capacity, "terrain worker pool started");
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn has_props(&self) -> bool {
        self.delegates.props.is_some()
    }

    /// Jobs waiting for a free queue slot.
    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub(crate) fn submit(&mut self, job: Job) {
        if self.tx_job.is_none() {
            self.inline_done.push(self.delegates.run(job));
            return;
        }
        self.backlog.push_back(job);
        self.flush_backlog();
    }

    // oldest first, until the job queue is full
    fn flush_backlog(&mut self) {
        let Some(tx) = &self.tx_job else {
            return;
        };
        while let Some(job) = self.backlog.pop_front() {
            match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) => {
                    self.backlog.push_front(job);
                    return;
                }
                Err(TrySendError::Disconnected(job)) => {
                    self.backlog.push_front(job);
                    break;
                }
            }
        }
        if !self.backlog.is_empty() {
            // every worker is gone
            tracing::warn!(jobs = self.backlog.len(), "terrain workers exited, running jobs inline");
            self.tx_job = None;
            self.run_backlog_inline();
        }
    }

    fn run_backlog_inline(&mut self) {
        while let Some(job) = self.backlog.pop_front() {
            self.inline_done.push(self.delegates.run(job));
        }
    }

    /// Collect all finished results without blocking.
    pub(crate) fn drain(&mut self) -> Vec<JobResult> {
        let mut results = std::mem::take(&mut self.inline_done);
        if let Some(rx) = &self.rx_done {
            results.extend(rx.try_iter());
        }
        self.flush_backlog();
        results
    }

    /// Stop accepting jobs and join the workers. Queued and backlogged jobs
    /// still run; their results are kept for the next drain.
    pub(crate) fn shutdown(&mut self) {
        self.tx_job = None;
        // workers may be waiting on a full result queue
        while self.handles.iter().any(|h| !h.is_finished()) {
            if let Some(rx) = &self.rx_done {
                self.inline_done.extend(rx.try_iter());
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("terrain worker exited with a panic");
            }
        }
        if let Some(rx) = self.rx_done.take() {
            self.inline_done.extend(rx.try_iter());
        }
        self.run_backlog_inline();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // nobody is left to read backlogged results
        self.backlog.clear();
        self.shutdown();
    }
}

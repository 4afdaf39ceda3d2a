//! Thread pools: a FIFO of blocks with pending jobs and the workers that
//! drain it.

use crate::graph::{BlockId, PoolId};
use crate::trigger::{Job, JobList, TriggerId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;

/// A thread pool as configured on the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSpec {
    pub name: String,
    /// Upper bound on worker threads; 0 runs the pool on the thread that
    /// calls `wait()`.
    pub max_threads: usize,
}

/// Scheduling state of one block.
#[derive(Debug, Default)]
pub(crate) struct BlockSched {
    pub(crate) jobs: JobList,
    /// A worker is inside one of the block's callbacks.
    pub(crate) busy: bool,
    /// The block sits in the ready FIFO.
    pub(crate) in_ready: bool,
}

/// Everything guarded by the pool mutex.
#[derive(Debug, Default)]
pub(crate) struct PoolState {
    pub(crate) ready: VecDeque<BlockId>,
    pub(crate) sched: HashMap<BlockId, BlockSched>,
    pub(crate) num_threads: usize,
    pub(crate) idle: usize,
    pub(crate) handles: Vec<JoinHandle<()>>,
}

impl PoolState {
    /// Add a job for `block`. Returns `None` if the job coalesced, else
    /// whether the block just entered the ready FIFO.
    pub(crate) fn enqueue(&mut self, block: BlockId, job: Job) -> Option<bool> {
        let sched = self.sched.get_mut(&block)?;
        if !sched.jobs.push(job) {
            return None;
        }
        if sched.busy || sched.in_ready {
            return Some(false);
        }
        sched.in_ready = true;
        self.ready.push_back(block);
        Some(true)
    }
}

/// A pool of worker threads for one run.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    pub(crate) id: PoolId,
    pub(crate) name: String,
    pub(crate) max_threads: usize,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) cond: Condvar,
}

impl ThreadPool {
    /// Build a pool serving `blocks`, arming each block's live triggers.
    pub(crate) fn new<'a>(
        id: PoolId,
        spec: &PoolSpec,
        blocks: impl IntoIterator<Item = (BlockId, &'a [TriggerId])>,
    ) -> Self {
        let mut state = PoolState::default();
        for (block, triggers) in blocks {
            let sched = state.sched.entry(block).or_default();
            for t in triggers {
                sched.jobs.arm(*t);
            }
        }
        Self {
            id,
            name: spec.name.clone(),
            max_threads: spec.max_threads,
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    /// Runs on the caller of `wait()` instead of its own threads.
    pub(crate) fn is_inline(&self) -> bool {
        self.max_threads == 0
    }

    /// Whether queued work outnumbers idle workers and a thread may be added.
    pub(crate) fn wants_thread(&self, state: &PoolState) -> bool {
        state.ready.len() > state.idle && state.num_threads < self.max_threads
    }

    /// Start a worker. Failure to spawn is fatal.
    pub(crate) fn spawn(
        &self,
        state: &mut PoolState,
        prefix: &str,
        body: impl FnOnce() + Send + 'static,
    ) {
        let name = format!("{prefix}-{}-{}", self.name, state.handles.len());
        match std::thread::Builder::new().name(name.clone()).spawn(body) {
            Ok(handle) => {
                state.num_threads += 1;
                state.handles.push(handle);
                tracing::debug!(pool = %self.name, thread = %name, "spawned worker");
            }
            Err(e) => {
                tracing::error!(pool = %self.name, error = %e, "failed to spawn worker");
                panic!("failed to spawn worker thread {name}: {e}");
            }
        }
    }

    /// Wake every waiting worker. The caller must not hold this pool's lock.
    pub(crate) fn broadcast(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    pub(crate) fn take_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.state.lock().handles)
    }

    /// Triggers freed during the run.
    pub(crate) fn freed_triggers(&self) -> Vec<TriggerId> {
        self.state
            .lock()
            .sched
            .values()
            .flat_map(|s| s.jobs.freed())
            .collect()
    }
}

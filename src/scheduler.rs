//! Scheduler: the worker loop, the stream-flow loop and job dispatch.
//!
//! Workers pop blocks from their pool's ready FIFO, mark them busy and
//! drain their job lists with no lock held around block callbacks. Lock
//! order is pool, then the run counters; no path holds two pool locks.

use crate::block::{Flow, FlowIo, ParamPort, Span, TriggerContext};
use crate::config::RuntimeConfig;
use crate::error::{Error, Stage};
use crate::graph::{BlockId, PoolId};
use crate::invariant_ppt::{
    invariant_violation, BLOCK_SINGLE_ENTRY, PROMISE_PROGRESS, TRIGGER_ORDER,
};
use crate::parameter::ParamTable;
use crate::plan::{CursorId, HopId};
use crate::pool::{PoolState, ThreadPool};
use crate::ring::{Ring, RingId};
use crate::trigger::{Job, TriggerAction, TriggerId, TriggerKind, TriggerSpec};
use crate::Block;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// A logical position in a ring. Only its owner advances `total`.
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    pub(crate) total: AtomicUsize,
    /// The reading block finished; it no longer holds back writers.
    pub(crate) closed: AtomicBool,
    /// The writing block finished; no more data follows `total`.
    pub(crate) finished: AtomicBool,
}

/// One writer and the inputs reading from it.
#[derive(Debug)]
pub(crate) struct Hop {
    pub(crate) ring: RingId,
    pub(crate) writer: BlockId,
    pub(crate) writer_cursor: CursorId,
    /// (reader, its cursor, its read promise)
    pub(crate) readers: Vec<(BlockId, CursorId, usize)>,
}

#[derive(Debug)]
pub(crate) struct RingRun {
    pub(crate) ring: Ring,
    pub(crate) origin: BlockId,
    /// Every input cursor on the ring, pass-through chains included.
    pub(crate) readers: Vec<CursorId>,
}

#[derive(Debug, Clone)]
pub(crate) struct InputBinding {
    pub(crate) hop: HopId,
    pub(crate) cursor: CursorId,
    pub(crate) threshold: usize,
    pub(crate) max_read: usize,
    pub(crate) pass_to: Option<usize>,
}

#[derive(Debug, Clone)]
pub(crate) struct OutputBinding {
    pub(crate) hop: HopId,
    pub(crate) cursor: CursorId,
    pub(crate) max_write: usize,
    pub(crate) pass_from: Option<usize>,
}

/// A block as seen by the workers of one run.
pub(crate) struct BlockRun {
    pub(crate) name: String,
    pub(crate) pool: PoolId,
    pub(crate) block: Arc<Mutex<Box<dyn Block>>>,
    pub(crate) inputs: Vec<InputBinding>,
    pub(crate) outputs: Vec<OutputBinding>,
    /// Has outputs and no inputs.
    pub(crate) source: bool,
    /// Trigger jobs waiting in this block's list.
    pub(crate) control: AtomicUsize,
    pub(crate) finished: AtomicBool,
}

impl BlockRun {
    pub(crate) fn is_stream(&self) -> bool {
        !self.inputs.is_empty() || !self.outputs.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    /// Blocks in a ready FIFO or busy, across all pools.
    pub(crate) pending: usize,
    /// Unfinished stream sources plus armed source triggers.
    pub(crate) live_sources: usize,
    pub(crate) finished: bool,
    pub(crate) halted: bool,
    /// Bumped whenever an inline pool gets work.
    pub(crate) inline_epoch: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RunStats {
    pub(crate) flow_calls: AtomicU64,
    pub(crate) drains: AtomicU64,
    pub(crate) threads_spawned: AtomicU64,
}

/// Shared state of one run.
pub(crate) struct RunState {
    pub(crate) config: RuntimeConfig,
    pub(crate) blocks: Vec<Option<BlockRun>>,
    pub(crate) rings: Vec<RingRun>,
    pub(crate) hops: Vec<Hop>,
    pub(crate) cursors: Vec<Cursor>,
    pub(crate) pools: Vec<ThreadPool>,
    pub(crate) triggers: Vec<Option<TriggerSpec>>,
    pub(crate) params: ParamTable,
    pub(crate) counters: Mutex<RunCounters>,
    pub(crate) cond: Condvar,
    /// Finished or halted; workers exit and nothing new is queued.
    pub(crate) stopping: AtomicBool,
    pub(crate) failure: Mutex<Option<Error>>,
    pub(crate) stats: RunStats,
}

impl RunState {
    fn block(&self, id: BlockId) -> Option<&BlockRun> {
        self.blocks.get(id.0).and_then(|b| b.as_ref())
    }

    fn cursor(&self, id: CursorId) -> &Cursor {
        &self.cursors[id.0]
    }

    /// Queue `job` for `block`, waking or spawning a worker.
    pub(crate) fn queue(self: &Arc<Self>, block: BlockId, job: Job) -> bool {
        if self.stopping.load(Ordering::Acquire) {
            return false;
        }
        let Some(run) = self.block(block) else {
            return false;
        };
        let pool = &self.pools[run.pool.0];
        let mut ps = pool.state.lock();
        let Some(became_ready) = ps.enqueue(block, job) else {
            return false;
        };
        if let Job::Trigger(_) = job {
            run.control.fetch_add(1, Ordering::AcqRel);
        }
        if became_ready {
            self.counters.lock().pending += 1;
        }
        self.wake(pool, &mut ps);
        true
    }

    fn wake(self: &Arc<Self>, pool: &ThreadPool, ps: &mut PoolState) {
        if pool.is_inline() {
            self.counters.lock().inline_epoch += 1;
            self.cond.notify_all();
            return;
        }
        if ps.idle > 0 {
            pool.cond.notify_one();
        }
        if pool.wants_thread(ps) && !self.stopping.load(Ordering::Acquire) {
            let state = Arc::clone(self);
            let id = pool.id;
            pool.spawn(ps, &self.config.thread_name, move || worker_loop(state, id));
            self.stats.threads_spawned.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue a signal or event trigger if its check passes.
    pub(crate) fn fire(self: &Arc<Self>, trigger: TriggerId) -> bool {
        let Some(spec) = self.triggers.get(trigger.0).and_then(|t| t.as_ref()) else {
            return false;
        };
        spec.passes_check() && self.queue(spec.block, Job::Trigger(trigger))
    }

    /// Stop triggering; in-flight callbacks complete.
    pub(crate) fn halt(&self) {
        {
            let mut counters = self.counters.lock();
            if counters.halted || counters.finished {
                return;
            }
            counters.halted = true;
            self.stopping.store(true, Ordering::Release);
        }
        tracing::debug!("run halted");
        self.broadcast();
    }

    /// Record a block failure and halt the run. The first failure wins.
    pub(crate) fn fail(&self, error: Error) {
        tracing::error!(%error, "block failed");
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.halt();
    }

    /// Wake every worker and the thread in `wait()`. No pool lock may be
    /// held by the caller.
    pub(crate) fn broadcast(&self) {
        for pool in &self.pools {
            pool.broadcast();
        }
        let _counters = self.counters.lock();
        self.cond.notify_all();
    }

    /// Drop pending blocks and live sources. Returns true when this
    /// finishes the run; the caller must then broadcast.
    fn release(&self, pending: usize, sources: usize) -> bool {
        let mut counters = self.counters.lock();
        counters.pending -= pending;
        counters.live_sources -= sources;
        if counters.pending == 0 && counters.live_sources == 0 && !counters.finished {
            counters.finished = true;
            self.stopping.store(true, Ordering::Release);
            return true;
        }
        false
    }

    fn available(&self, input: &InputBinding) -> usize {
        let writer = self.hops[input.hop.0].writer_cursor;
        let written = self.cursor(writer).total.load(Ordering::Acquire);
        written - self.cursor(input.cursor).total.load(Ordering::Relaxed)
    }

    fn feeder_finished(&self, input: &InputBinding) -> bool {
        let writer = self.hops[input.hop.0].writer_cursor;
        self.cursor(writer).finished.load(Ordering::Acquire)
    }

    fn clogged(&self, output: &OutputBinding) -> bool {
        let hop = &self.hops[output.hop.0];
        let written = self.cursor(output.cursor).total.load(Ordering::Acquire);
        if output.pass_from.is_some() {
            return hop.readers.iter().any(|&(_, c, max_read)| {
                let cursor = self.cursor(c);
                !cursor.closed.load(Ordering::Acquire)
                    && written - cursor.total.load(Ordering::Acquire) >= max_read
            });
        }
        let ring = &self.rings[hop.ring.0];
        let oldest = ring
            .readers
            .iter()
            .map(|c| self.cursor(*c))
            .filter(|c| !c.closed.load(Ordering::Acquire))
            .map(|c| c.total.load(Ordering::Acquire))
            .min();
        match oldest {
            Some(oldest) => written - oldest + output.max_write > ring.ring.map_length(),
            None => false,
        }
    }

    /// Queue everything whose readiness may have changed after `block`
    /// moved its cursors.
    fn wake_neighbours(self: &Arc<Self>, run: &BlockRun) {
        let mut peers: Vec<BlockId> = Vec::new();
        for output in &run.outputs {
            peers.extend(self.hops[output.hop.0].readers.iter().map(|(b, _, _)| *b));
        }
        for input in &run.inputs {
            let hop = &self.hops[input.hop.0];
            peers.push(hop.writer);
            peers.push(self.rings[hop.ring.0].origin);
        }
        peers.sort();
        peers.dedup();
        for peer in peers {
            let live = self
                .block(peer)
                .is_some_and(|b| !b.finished.load(Ordering::Acquire));
            if live {
                self.queue(peer, Job::Stream);
            }
        }
    }

    fn finish_block(self: &Arc<Self>, run: &BlockRun) {
        if run.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        for output in &run.outputs {
            self.cursor(output.cursor).finished.store(true, Ordering::Release);
        }
        for input in &run.inputs {
            self.cursor(input.cursor).closed.store(true, Ordering::Release);
        }
        tracing::debug!(block = %run.name, "stream finished");
        self.wake_neighbours(run);
        if run.source && self.release(0, 1) {
            self.broadcast();
        }
    }

    fn queue_wakes(self: &Arc<Self>, wakes: Vec<TriggerId>) {
        for t in wakes {
            if let Some(spec) = self.triggers.get(t.0).and_then(|s| s.as_ref()) {
                self.queue(spec.block, Job::Trigger(t));
            }
        }
    }
}

/// Halts the run if a worker unwinds and gives back a pool thread's slot.
struct WorkerGuard<'a> {
    state: &'a RunState,
    pool: Option<&'a ThreadPool>,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("worker panicked, halting run");
            self.state.halt();
        }
        if let Some(pool) = self.pool {
            pool.state.lock().num_threads -= 1;
            tracing::debug!(pool = %pool.name, "worker exiting");
        }
    }
}

/// Body of a pool worker thread.
pub(crate) fn worker_loop(state: Arc<RunState>, pool: PoolId) {
    let pool = &state.pools[pool.0];
    let _guard = WorkerGuard {
        state: &state,
        pool: Some(pool),
    };
    let mut ps = pool.state.lock();
    loop {
        if state.stopping.load(Ordering::Acquire) {
            break;
        }
        if let Some(block) = ps.ready.pop_front() {
            service(&state, &mut ps, block);
            continue;
        }
        ps.idle += 1;
        pool.cond.wait(&mut ps);
        ps.idle -= 1;
    }
}

/// Run the inline pools on the calling thread until the run finishes or
/// halts.
pub(crate) fn drive_inline(state: &Arc<RunState>) {
    let _guard = WorkerGuard { state, pool: None };
    loop {
        let epoch = {
            let counters = state.counters.lock();
            if counters.finished || counters.halted {
                return;
            }
            counters.inline_epoch
        };
        let mut worked = false;
        for pool in state.pools.iter().filter(|p| p.is_inline()) {
            let mut ps = pool.state.lock();
            while let Some(block) = ps.ready.pop_front() {
                service(state, &mut ps, block);
                worked = true;
            }
        }
        if !worked {
            let mut counters = state.counters.lock();
            while counters.inline_epoch == epoch && !counters.finished && !counters.halted {
                state.cond.wait(&mut counters);
            }
        }
    }
}

/// One scheduling pass over a block: drain up to `drain_batch` jobs.
fn service(state: &Arc<RunState>, ps: &mut MutexGuard<'_, PoolState>, id: BlockId) {
    let Some(run) = state.block(id) else { return };
    let Some(sched) = ps.sched.get_mut(&id) else {
        return;
    };
    sched.in_ready = false;
    if sched.busy {
        invariant_violation(BLOCK_SINGLE_ENTRY, "block entered twice", &run.name);
    }
    sched.busy = true;
    state.stats.drains.fetch_add(1, Ordering::Relaxed);

    let mut sources_done = 0;
    for _ in 0..state.config.drain_batch {
        if state.stopping.load(Ordering::Acquire) {
            break;
        }
        let Some(sched) = ps.sched.get_mut(&id) else { break };
        let Some(job) = sched.jobs.pop() else { break };
        match job {
            Job::Trigger(_) => {
                run.control.fetch_sub(1, Ordering::AcqRel);
            }
            Job::Stream => {
                if !sched.jobs.is_empty() {
                    invariant_violation(
                        TRIGGER_ORDER,
                        "stream job ran ahead of control jobs",
                        &run.name,
                    );
                }
            }
        }
        let settled = MutexGuard::unlocked(ps, || run_job(state, id, run, job));
        if let Some((trigger, action)) = settled {
            if let Some(sched) = ps.sched.get_mut(&id) {
                let (left_live, dropped) = sched.jobs.settle(trigger, action);
                run.control.fetch_sub(dropped, Ordering::AcqRel);
                let is_source = state
                    .triggers
                    .get(trigger.0)
                    .and_then(|t| t.as_ref())
                    .is_some_and(|t| t.is_source);
                if left_live && is_source {
                    sources_done += 1;
                }
            }
        }
    }

    let Some(sched) = ps.sched.get_mut(&id) else {
        return;
    };
    sched.busy = false;
    let mut pending_done = 0;
    if sched.jobs.is_empty() {
        pending_done = 1;
    } else {
        sched.in_ready = true;
        ps.ready.push_back(id);
    }
    if (pending_done > 0 || sources_done > 0) && state.release(pending_done, sources_done) {
        MutexGuard::unlocked(ps, || state.broadcast());
    }
}

/// Run one job. Returns the trigger outcome for trigger jobs.
fn run_job(
    state: &Arc<RunState>,
    id: BlockId,
    run: &BlockRun,
    job: Job,
) -> Option<(TriggerId, TriggerAction)> {
    match job {
        Job::Stream => {
            run_stream(state, id, run);
            None
        }
        Job::Trigger(t) => Some((t, run_trigger(state, id, run, t))),
    }
}

fn run_trigger(state: &Arc<RunState>, id: BlockId, run: &BlockRun, t: TriggerId) -> TriggerAction {
    let Some(spec) = state.triggers.get(t.0).and_then(|s| s.as_ref()) else {
        return TriggerAction::Keep;
    };
    if let TriggerKind::Parameter(param) = spec.kind {
        let Ok(link) = state.params.link(param) else {
            return TriggerAction::Keep;
        };
        if let Some((_, inbox)) = &link.inbox {
            let mut block = run.block.lock();
            for value in inbox.try_iter() {
                if let Err(source) = block.set_parameter(param, &value) {
                    state.fail(Error::Block {
                        block: run.name.clone(),
                        stage: Stage::Parameter,
                        source,
                    });
                    break;
                }
            }
        }
        return TriggerAction::Keep;
    }

    let mut ctx = TriggerContext {
        kind: spec.kind,
        block: &run.name,
        params: ParamPort {
            table: &state.params,
            owner: id,
            wakes: Vec::new(),
        },
        halt: false,
    };
    let result = run.block.lock().trigger(t, &mut ctx);
    let halt = ctx.halt;
    state.queue_wakes(std::mem::take(&mut ctx.params.wakes));
    if halt {
        state.halt();
    }
    match result {
        Ok(action) => action,
        Err(source) => {
            state.fail(Error::Block {
                block: run.name.clone(),
                stage: Stage::Trigger,
                source,
            });
            TriggerAction::Keep
        }
    }
}

/// The stream-flow loop for one block.
fn run_stream(state: &Arc<RunState>, id: BlockId, run: &BlockRun) {
    if run.finished.load(Ordering::Acquire) || !run.is_stream() {
        return;
    }
    for _ in 0..state.config.flow_batch {
        if state.stopping.load(Ordering::Acquire) {
            return;
        }
        if run.control.load(Ordering::Acquire) > 0 {
            state.queue(id, Job::Stream);
            return;
        }
        let flushing =
            !run.inputs.is_empty() && run.inputs.iter().all(|i| state.feeder_finished(i));
        let avail: Vec<usize> = run.inputs.iter().map(|i| state.available(i)).collect();
        if run.outputs.iter().any(|o| state.clogged(o)) {
            return;
        }
        let full = run
            .inputs
            .iter()
            .zip(&avail)
            .any(|(i, a)| *a >= i.max_read);
        let met = run
            .inputs
            .iter()
            .zip(&avail)
            .any(|(i, a)| *a >= i.threshold);
        if !flushing && !run.source && !met {
            return;
        }

        let mut io = present(state, id, run, &avail, flushing);
        let result = {
            let mut block = run.block.lock();
            if flushing {
                block.flush(&mut io)
            } else {
                block.flow(&mut io)
            }
        };
        state.stats.flow_calls.fetch_add(1, Ordering::Relaxed);
        let wakes = std::mem::take(&mut io.params.wakes);
        let progress = commit(state, run, &io);
        drop(io);
        state.queue_wakes(wakes);

        let flow = match result {
            Ok(flow) => flow,
            Err(source) => {
                state.fail(Error::Block {
                    block: run.name.clone(),
                    stage: if flushing { Stage::Flush } else { Stage::Flow },
                    source,
                });
                return;
            }
        };
        if progress {
            state.wake_neighbours(run);
        }
        if flow == Flow::Finished {
            state.finish_block(run);
            return;
        }
        if !progress {
            if flushing {
                state.finish_block(run);
            } else if run.source || full {
                invariant_violation(
                    PROMISE_PROGRESS,
                    "flow made no progress with a full read promise or as a source",
                    &run.name,
                );
            }
            return;
        }
    }
    state.queue(id, Job::Stream);
}

/// Build the spans for one flow call.
fn present<'a>(
    state: &'a RunState,
    id: BlockId,
    run: &'a BlockRun,
    avail: &[usize],
    flushing: bool,
) -> FlowIo<'a> {
    let mut inputs = Vec::with_capacity(run.inputs.len());
    for (n, input) in run.inputs.iter().enumerate() {
        let ring = &state.rings[state.hops[input.hop.0].ring.0].ring;
        let len = avail[n].min(input.max_read);
        let total = state.cursor(input.cursor).total.load(Ordering::Relaxed);
        inputs.push(Span {
            ptr: ring.span_ptr(total, len),
            len,
            counter: n,
            passed: input.pass_to.is_some(),
        });
    }
    let mut counters = inputs.len();
    let mut outputs = Vec::with_capacity(run.outputs.len());
    for output in &run.outputs {
        let span = match output.pass_from {
            Some(i) => Span {
                passed: false,
                ..inputs[i]
            },
            None => {
                let ring = &state.rings[state.hops[output.hop.0].ring.0].ring;
                let total = state.cursor(output.cursor).total.load(Ordering::Relaxed);
                let span = Span {
                    ptr: ring.span_ptr(total, output.max_write),
                    len: output.max_write,
                    counter: counters,
                    passed: false,
                };
                counters += 1;
                span
            }
        };
        outputs.push(span);
    }
    FlowIo {
        inputs,
        outputs,
        advanced: vec![0; counters],
        flushing,
        block: &run.name,
        params: ParamPort {
            table: &state.params,
            owner: id,
            wakes: Vec::new(),
        },
        _memory: PhantomData,
    }
}

/// Mirror written spans and publish cursor advances. Returns whether any
/// port moved.
fn commit(state: &RunState, run: &BlockRun, io: &FlowIo<'_>) -> bool {
    let mut progress = false;
    for (n, input) in run.inputs.iter().enumerate() {
        let bytes = io.consumed(n);
        if bytes == 0 {
            continue;
        }
        progress = true;
        let cursor = state.cursor(input.cursor);
        if input.pass_to.is_some() {
            let ring = &state.rings[state.hops[input.hop.0].ring.0].ring;
            ring.commit(cursor.total.load(Ordering::Relaxed), bytes);
        }
        cursor.total.fetch_add(bytes, Ordering::Release);
    }
    for (n, output) in run.outputs.iter().enumerate() {
        if output.pass_from.is_some() {
            continue;
        }
        let bytes = io.produced(n);
        if bytes == 0 {
            continue;
        }
        progress = true;
        let ring = &state.rings[state.hops[output.hop.0].ring.0].ring;
        let cursor = state.cursor(output.cursor);
        ring.commit(cursor.total.load(Ordering::Relaxed), bytes);
        cursor.total.fetch_add(bytes, Ordering::Release);
    }
    progress
}

//! RT module: the graph lifecycle.
//!
//! `run()` validates the topology, starts the blocks, maps the rings and
//! hands an immutable [`RunState`] to the pools. `wait()` drives inline
//! pools, joins every worker, stops the blocks and unmaps the rings.

use crate::block::{StartContext, StopContext};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result, Stage};
use crate::graph::{BlockId, BlockKind, Graph, PoolId};
use crate::invariant_ppt::{assert_invariant, RUN_TEARDOWN};
use crate::plan::{topo_sort, BlockPromises, BufferPlan, InputPromise, OutputPromise};
use crate::pool::ThreadPool;
use crate::ring::Ring;
use crate::scheduler::{
    drive_inline, BlockRun, Cursor, Hop, InputBinding, OutputBinding, RingRun, RunCounters,
    RunState, RunStats,
};
use crate::signal::SignalRelay;
use crate::states::GraphState;
use crate::trigger::{Job, TriggerId};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

/// Per-graph runtime context: configuration and the thread that owns the
/// graph.
#[derive(Debug, Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    main_thread: ThreadId,
}

impl Runtime {
    pub(crate) fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            main_thread: std::thread::current().id(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn check_main_thread(&self, operation: &'static str) -> Result<()> {
        if std::thread::current().id() == self.main_thread {
            Ok(())
        } else {
            Err(Error::NotMainThread(operation))
        }
    }
}

/// Where handles find the current run, if any.
#[derive(Default)]
pub(crate) struct RunHub {
    current: RwLock<Weak<RunState>>,
}

impl RunHub {
    fn get(&self) -> Option<Arc<RunState>> {
        self.current.read().upgrade()
    }

    fn set(&self, state: Weak<RunState>) {
        *self.current.write() = state;
    }
}

/// Halts the graph's current run from any thread.
#[derive(Clone)]
pub struct HaltHandle {
    hub: Arc<RunHub>,
}

impl HaltHandle {
    pub(crate) fn new(hub: Arc<RunHub>) -> Self {
        Self { hub }
    }

    /// Stop triggering. Returns false when no run is active.
    pub fn halt(&self) -> bool {
        match self.hub.get() {
            Some(state) => {
                state.halt();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for HaltHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HaltHandle").finish_non_exhaustive()
    }
}

/// Fires one event trigger from any thread.
#[derive(Clone)]
pub struct EventHandle {
    hub: Arc<RunHub>,
    trigger: TriggerId,
}

impl EventHandle {
    pub(crate) fn new(hub: Arc<RunHub>, trigger: TriggerId) -> Self {
        Self { hub, trigger }
    }

    pub fn trigger(&self) -> TriggerId {
        self.trigger
    }

    /// Queue the trigger if its check passes. Returns whether it was
    /// queued; events coalesce with an already queued job.
    pub fn fire(&self) -> bool {
        self.hub
            .get()
            .is_some_and(|state| state.fire(self.trigger))
    }
}

impl std::fmt::Debug for EventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandle")
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

pub(crate) struct ActiveRun {
    pub(crate) state: Arc<RunState>,
    relay: Option<SignalRelay>,
}

/// Counters of a finished run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunReport {
    pub flow_calls: u64,
    pub drains: u64,
    pub threads_spawned: u64,
}

struct Teardown {
    report: RunReport,
    failure: Option<Error>,
    panic: Option<Box<dyn Any + Send>>,
}

/// Shape of one simple block for this run.
struct Shape {
    id: BlockId,
    pool: PoolId,
    inputs: usize,
    outputs: usize,
}

impl Graph {
    /// Start a run.
    pub fn run(&mut self) -> Result<()> {
        self.runtime.check_main_thread("run")?;
        self.require_editable("run")?;
        if self.pools.is_empty() {
            return Err(Error::NoThreadPool);
        }

        let (counts, violations) = self.port_counts();
        if violations > 0 {
            tracing::warn!(violations, "stream ports are not densely connected");
            return Err(Error::UnconnectedPorts { count: violations });
        }
        let mut shapes = Vec::new();
        for id in self.simple_ids() {
            let simple = self.simple(id)?;
            let (inputs, outputs) = counts.get(&id).copied().unwrap_or((0, 0));
            for &(input, output) in &simple.declared.pass_through {
                if (input < inputs) != (output < outputs) {
                    return Err(Error::InvalidPassThrough {
                        block: self.slot(id)?.name.clone(),
                        input,
                        output,
                        reason: "both sides must be connected",
                    });
                }
            }
            shapes.push(Shape {
                id,
                pool: simple.pool.unwrap_or(PoolId(0)),
                inputs,
                outputs,
            });
        }

        let stream_sources: Vec<BlockId> = shapes
            .iter()
            .filter(|s| s.inputs == 0 && s.outputs > 0)
            .map(|s| s.id)
            .collect();
        let trigger_sources = self
            .triggers
            .iter()
            .flatten()
            .filter(|t| t.arms_source())
            .count();
        if stream_sources.is_empty() && trigger_sources == 0 {
            return Err(Error::NoSource);
        }

        let mut layout: Vec<Option<BlockPromises>> = vec![None; self.blocks.len()];
        for shape in &shapes {
            layout[shape.id.0] = Some(BlockPromises::default());
        }
        topo_sort(&layout, &self.edges)?;

        let promises = self.default_promises(&shapes)?;
        self.construct_blocks(&shapes)?;
        let promises = self.start_blocks(&shapes, promises)?;

        let state = match self.build_run(&shapes, &promises, stream_sources.len() + trigger_sources)
        {
            Ok(state) => Arc::new(state),
            Err(e) => {
                self.stop_quietly(&shapes);
                self.state = GraphState::Paused;
                return Err(e);
            }
        };
        self.hub.set(Arc::downgrade(&state));
        let relay = match SignalRelay::start(&state) {
            Ok(relay) => relay,
            Err(e) => {
                self.hub.set(Weak::new());
                drop(state);
                self.stop_quietly(&shapes);
                self.state = GraphState::Paused;
                return Err(e);
            }
        };

        self.state = GraphState::Flowing;
        tracing::info!(
            blocks = shapes.len(),
            rings = state.rings.len(),
            pools = state.pools.len(),
            "graph flowing"
        );
        for source in stream_sources {
            state.queue(source, Job::Stream);
        }
        self.active = Some(ActiveRun { state, relay });
        Ok(())
    }

    /// Promises every connected port starts with, before `start()`.
    fn default_promises(&self, shapes: &[Shape]) -> Result<Vec<Option<BlockPromises>>> {
        let config = self.runtime.config();
        let mut promises: Vec<Option<BlockPromises>> = vec![None; self.blocks.len()];
        for shape in shapes {
            let simple = self.simple(shape.id)?;
            let name = self.slot(shape.id)?.name.clone();
            let max_write = self
                .params
                .get(simple.max_write)?
                .as_int()
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v > 0)
                .ok_or_else(|| Error::InvalidPromise {
                    block: name.clone(),
                    detail: "OutputMaxWrite must be a positive integer".to_string(),
                })?;
            let inputs = (0..shape.inputs)
                .map(|i| InputPromise {
                    max_read: config.default_max_read,
                    threshold: config.default_threshold,
                    pass_to: simple.declared.passed_to(i),
                })
                .collect();
            let outputs = (0..shape.outputs)
                .map(|o| OutputPromise {
                    max_write,
                    pass_from: simple.declared.passed_from(o),
                })
                .collect();
            promises[shape.id.0] = Some(BlockPromises {
                name,
                inputs,
                outputs,
            });
        }
        Ok(promises)
    }

    fn construct_blocks(&mut self, shapes: &[Shape]) -> Result<()> {
        for shape in shapes {
            let slot = self.slot_mut(shape.id)?;
            let BlockKind::Simple(simple) = &mut slot.kind else {
                continue;
            };
            if simple.constructed {
                continue;
            }
            let result = simple.block.lock().construct();
            if let Err(source) = result {
                let error = Error::Block {
                    block: slot.name.clone(),
                    stage: Stage::Construct,
                    source,
                };
                tracing::error!(%error, "construct failed");
                self.state = GraphState::Failed;
                return Err(error);
            }
            simple.constructed = true;
        }
        Ok(())
    }

    fn start_blocks(
        &mut self,
        shapes: &[Shape],
        mut promises: Vec<Option<BlockPromises>>,
    ) -> Result<Vec<Option<BlockPromises>>> {
        for (n, shape) in shapes.iter().enumerate() {
            let Some(p) = promises[shape.id.0].as_mut() else {
                continue;
            };
            let simple = self.simple(shape.id)?;
            let mut ctx = StartContext {
                name: &p.name,
                inputs: &mut p.inputs,
                outputs: &mut p.outputs,
            };
            let result = simple.block.lock().start(&mut ctx);
            if let Err(source) = result {
                let error = Error::Block {
                    block: p.name.clone(),
                    stage: Stage::Start,
                    source,
                };
                tracing::error!(%error, "start failed");
                self.stop_quietly(&shapes[..n]);
                self.state = GraphState::Failed;
                return Err(error);
            }
        }
        Ok(promises)
    }

    /// Stop blocks after a failed launch; errors are only logged.
    fn stop_quietly(&self, shapes: &[Shape]) {
        for shape in shapes {
            let Ok(simple) = self.simple(shape.id) else {
                continue;
            };
            let mut ctx = StopContext {
                read: vec![0; shape.inputs],
                written: vec![0; shape.outputs],
            };
            if let Err(e) = simple.block.lock().stop(&mut ctx) {
                tracing::warn!(block = ?shape.id, error = %e, "stop failed during aborted run");
            }
        }
    }

    fn build_run(
        &self,
        shapes: &[Shape],
        promises: &[Option<BlockPromises>],
        live_sources: usize,
    ) -> Result<RunState> {
        let plan = BufferPlan::compile(promises, &self.edges)?;
        let read_promise = |block: BlockId, input: usize| {
            promises[block.0]
                .as_ref()
                .and_then(|p| p.inputs.get(input))
                .map_or(0, |i| i.max_read)
        };

        let mut rings = Vec::with_capacity(plan.rings.len());
        for rp in &plan.rings {
            let ring = Ring::new(rp.map_length, rp.overhang)?;
            tracing::debug!(
                ring = rp.id.0,
                map_length = rp.map_length,
                overhang = rp.overhang,
                "mapped ring"
            );
            let readers = plan
                .hops
                .iter()
                .filter(|h| h.ring == rp.id)
                .flat_map(|h| h.readers.iter().map(|&(_, _, c)| c))
                .collect();
            rings.push(RingRun {
                ring,
                origin: rp.origin.0,
                readers,
            });
        }
        let hops = plan
            .hops
            .iter()
            .map(|h| Hop {
                ring: h.ring,
                writer: h.writer.0,
                writer_cursor: h.writer_cursor,
                readers: h
                    .readers
                    .iter()
                    .map(|&(b, i, c)| (b, c, read_promise(b, i)))
                    .collect(),
            })
            .collect();

        let mut blocks: Vec<Option<BlockRun>> = (0..self.blocks.len()).map(|_| None).collect();
        let mut armed: HashMap<BlockId, Vec<TriggerId>> = HashMap::new();
        for (n, spec) in self.triggers.iter().enumerate() {
            if let Some(spec) = spec.as_ref().filter(|s| !s.freed) {
                armed.entry(spec.block).or_default().push(TriggerId(n));
            }
        }
        for shape in shapes {
            let simple = self.simple(shape.id)?;
            let Some(p) = promises[shape.id.0].as_ref() else {
                continue;
            };
            let unplanned = || Error::InvalidPromise {
                block: p.name.clone(),
                detail: "port missing from the buffer plan".to_string(),
            };
            let mut inputs = Vec::with_capacity(p.inputs.len());
            for (i, promise) in p.inputs.iter().enumerate() {
                let &(hop, cursor) = plan.inputs.get(&(shape.id, i)).ok_or_else(unplanned)?;
                inputs.push(InputBinding {
                    hop,
                    cursor,
                    threshold: promise.threshold,
                    max_read: promise.max_read,
                    pass_to: promise.pass_to,
                });
            }
            let mut outputs = Vec::with_capacity(p.outputs.len());
            for (o, promise) in p.outputs.iter().enumerate() {
                let &(hop, cursor) = plan.outputs.get(&(shape.id, o)).ok_or_else(unplanned)?;
                outputs.push(OutputBinding {
                    hop,
                    cursor,
                    max_write: promise.max_write,
                    pass_from: promise.pass_from,
                });
            }
            blocks[shape.id.0] = Some(BlockRun {
                name: p.name.clone(),
                pool: shape.pool,
                block: Arc::clone(&simple.block),
                source: inputs.is_empty() && !outputs.is_empty(),
                inputs,
                outputs,
                control: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
            });
        }

        let pools = self
            .pools
            .iter()
            .enumerate()
            .map(|(n, spec)| {
                let members = shapes.iter().filter(|s| s.pool == PoolId(n)).map(|s| {
                    let triggers = armed.get(&s.id).map_or(&[][..], Vec::as_slice);
                    (s.id, triggers)
                });
                ThreadPool::new(PoolId(n), spec, members)
            })
            .collect();

        Ok(RunState {
            config: self.runtime.config().clone(),
            blocks,
            rings,
            hops,
            cursors: (0..plan.cursor_count).map(|_| Cursor::default()).collect(),
            pools,
            triggers: self.triggers.clone(),
            params: self.params.snapshot(),
            counters: Mutex::new(RunCounters {
                live_sources,
                ..RunCounters::default()
            }),
            cond: parking_lot::Condvar::new(),
            stopping: AtomicBool::new(false),
            failure: Mutex::new(None),
            stats: RunStats::default(),
        })
    }

    /// Block until the run finishes or halts, then tear it down.
    ///
    /// Returns the first block failure of the run, if any. A worker panic
    /// is resumed on this thread after teardown.
    pub fn wait(&mut self) -> Result<RunReport> {
        self.runtime.check_main_thread("wait")?;
        let Some(active) = self.active.as_ref() else {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "wait",
                required: "Flowing",
            });
        };
        let state = Arc::clone(&active.state);
        drive_inline(&state);
        drop(state);

        let teardown = self.finish_run();
        if let Some(payload) = teardown.panic {
            std::panic::resume_unwind(payload);
        }
        match teardown.failure {
            Some(error) => Err(error),
            None => {
                tracing::info!(
                    flow_calls = teardown.report.flow_calls,
                    drains = teardown.report.drains,
                    "run complete"
                );
                Ok(teardown.report)
            }
        }
    }

    /// Join the workers, stop the blocks and drop the run state.
    fn finish_run(&mut self) -> Teardown {
        let mut teardown = Teardown {
            report: RunReport::default(),
            failure: None,
            panic: None,
        };
        let Some(active) = self.active.take() else {
            return teardown;
        };
        let state = active.state;
        state.stopping.store(true, Ordering::Release);
        state.broadcast();
        loop {
            let handles: Vec<_> = state.pools.iter().flat_map(|p| p.take_handles()).collect();
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(payload) = handle.join() {
                    teardown.panic.get_or_insert(payload);
                }
            }
        }
        if let Some(relay) = active.relay {
            relay.stop();
        }
        self.hub.set(Weak::new());

        for pool in &state.pools {
            for trigger in pool.freed_triggers() {
                if let Some(Some(spec)) = self.triggers.get_mut(trigger.0) {
                    spec.freed = true;
                }
            }
        }
        let undelivered = self.params.drain_inboxes();
        if undelivered > 0 {
            tracing::debug!(undelivered, "dropped setter values queued at teardown");
        }

        let mut stop_error = None;
        for run in state.blocks.iter().flatten() {
            let mut ctx = StopContext {
                read: run
                    .inputs
                    .iter()
                    .map(|i| state.cursors[i.cursor.0].total.load(Ordering::Acquire))
                    .collect(),
                written: run
                    .outputs
                    .iter()
                    .map(|o| state.cursors[o.cursor.0].total.load(Ordering::Acquire))
                    .collect(),
            };
            if let Err(source) = run.block.lock().stop(&mut ctx) {
                let error = Error::Block {
                    block: run.name.clone(),
                    stage: Stage::Stop,
                    source,
                };
                tracing::error!(%error, "stop failed");
                stop_error.get_or_insert(error);
            }
        }

        teardown.report = RunReport {
            flow_calls: state.stats.flow_calls.load(Ordering::Relaxed),
            drains: state.stats.drains.load(Ordering::Relaxed),
            threads_spawned: state.stats.threads_spawned.load(Ordering::Relaxed),
        };
        teardown.failure = state.failure.lock().take();
        assert_invariant(
            RUN_TEARDOWN,
            state.pools.iter().all(|p| p.state.lock().num_threads == 0),
            "every worker exited before teardown",
            Some("wait"),
        );
        drop(state);

        self.state = if stop_error.is_some() {
            GraphState::Failed
        } else {
            GraphState::Paused
        };
        if teardown.failure.is_none() {
            teardown.failure = stop_error;
        }
        teardown
    }

    /// Stop triggering; in-flight callbacks complete. `wait()` still has to
    /// be called to tear the run down.
    pub fn halt(&self) -> Result<()> {
        match self.run_state() {
            Some(state) => {
                state.halt();
                Ok(())
            }
            None => Err(Error::InvalidState {
                state: self.state,
                operation: "halt",
                required: "Flowing",
            }),
        }
    }

    /// Whether the current run has finished or halted and `wait()` would
    /// return without blocking on worker pools.
    pub fn is_done(&self) -> bool {
        self.run_state().map_or(true, |state| {
            let counters = state.counters.lock();
            counters.finished || counters.halted
        })
    }

    /// Destroy every constructed block. Only a graph that is not flowing
    /// can be destroyed.
    pub fn destroy(&mut self) -> Result<()> {
        self.runtime.check_main_thread("destroy")?;
        if !matches!(
            self.state,
            GraphState::Created | GraphState::Paused | GraphState::Failed
        ) {
            return Err(Error::InvalidState {
                state: self.state,
                operation: "destroy",
                required: "Created, Paused or Failed",
            });
        }
        let destroyed = self.destroy_blocks();
        self.state = GraphState::Destroyed;
        tracing::info!(destroyed, "graph destroyed");
        Ok(())
    }

    fn destroy_blocks(&mut self) -> usize {
        let mut destroyed = 0;
        for slot in self.blocks.iter_mut().flatten() {
            if let BlockKind::Simple(simple) = &mut slot.kind {
                if simple.constructed {
                    simple.block.lock().destroy();
                    simple.constructed = false;
                    destroyed += 1;
                }
            }
        }
        destroyed
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.state.halt();
        }
        if self.active.is_some() {
            let teardown = self.finish_run();
            if teardown.panic.is_some() {
                tracing::error!("worker panicked during a run dropped without wait()");
            }
        }
        if self.state != GraphState::Destroyed {
            self.destroy_blocks();
        }
    }
}

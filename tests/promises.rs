//! Promise enforcement: over-reads, over-writes and stalls abort the run at
//! the offending call.

mod common;

use common::{payload, Forward, Sink, Source};
use flowkernel::invariant_ppt::{
    contract_test, GRAPH_LEGALITY, PLAN_SOUNDNESS, RUN_TEARDOWN,
};
use flowkernel::{
    Block, BlockError, Declare, Error, Flow, FlowIo, Graph, GraphState, StartContext,
    OUTPUT_MAX_WRITE,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Writes ten bytes per call and over-advances on call `fail_at`.
struct Breaker {
    calls: Arc<AtomicUsize>,
    fail_at: usize,
    max_write: usize,
}

impl Block for Breaker {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_outputs(1, 1);
        Ok(())
    }

    fn start(&mut self, ctx: &mut StartContext<'_>) -> Result<(), BlockError> {
        self.max_write = ctx.max_write(0).unwrap_or(0);
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_at {
            io.advance_output(0, self.max_write + 8);
        }
        io.output(0)[..10].fill(call as u8);
        io.advance_output(0, 10);
        Ok(Flow::Continue)
    }
}

/// A source that never produces.
struct Stall;

impl Block for Stall {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_outputs(1, 1);
        Ok(())
    }

    fn flow(&mut self, _io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        Ok(Flow::Continue)
    }
}

/// Reads one byte more than it was shown.
struct Greedy;

impl Block for Greedy {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_inputs(1, 1);
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        let n = io.input(0).len();
        io.advance_input(0, n + 1);
        Ok(Flow::Continue)
    }
}

fn source_to(graph: &mut Graph, source: impl Block, sink: impl Block, threads: usize) {
    let src = graph.add_block("src", source).unwrap();
    let snk = graph.add_block("sink", sink).unwrap();
    graph.connect(src, 0, snk, 0).unwrap();
    graph.add_pool("main", threads).unwrap();
}

#[test]
fn over_write_aborts_at_the_offending_call() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();
    let breaker = Breaker {
        calls: Arc::clone(&calls),
        fail_at: 5,
        max_write: 0,
    };
    source_to(&mut graph, breaker, Sink::default(), 0);
    graph.run().unwrap();

    let outcome = catch_unwind(AssertUnwindSafe(|| graph.wait()));
    let message = match outcome {
        Err(payload) => payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default(),
        Ok(_) => panic!("the run should have aborted"),
    };
    assert!(message.contains("Invariant 6 failed"), "{message}");
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // the halted run is still torn down cleanly
    graph.wait().unwrap();
    assert_eq!(graph.state(), GraphState::Paused);
}

#[test]
#[should_panic(expected = "Invariant 6 failed")]
fn worker_panics_resume_in_wait() {
    let mut graph = Graph::new();
    let breaker = Breaker {
        calls: Arc::new(AtomicUsize::new(0)),
        fail_at: 3,
        max_write: 0,
    };
    source_to(&mut graph, breaker, Sink::default(), 2);
    graph.run().unwrap();
    let _ = graph.wait();
}

#[test]
#[should_panic(expected = "Invariant 7 failed")]
fn stalled_source_is_fatal() {
    let mut graph = Graph::new();
    source_to(&mut graph, Stall, Sink::default(), 0);
    graph.run().unwrap();
    let _ = graph.wait();
}

#[test]
#[should_panic(expected = "Invariant 5 failed")]
fn over_read_is_fatal() {
    let mut graph = Graph::new();
    source_to(&mut graph, Source::new(payload(2, 100)), Greedy, 0);
    graph.run().unwrap();
    let _ = graph.wait();
}

#[test]
fn lifecycle_invariants_are_exercised() {
    let mut graph = Graph::new();
    let src = graph.add_block("src", Source::new(payload(4, 2048))).unwrap();
    let fwd = graph.add_block("fwd", Forward::default()).unwrap();
    let sink = Sink::default();
    let snk = graph.add_block("sink", sink.clone()).unwrap();
    graph.connect(src, 0, fwd, 0).unwrap();
    graph.connect(fwd, 0, snk, 0).unwrap();
    graph.add_pool("main", 1).unwrap();
    graph.run().unwrap();
    graph.wait().unwrap();
    assert_eq!(sink.take().len(), 2048);
    contract_test(
        "stream lifecycle",
        &[GRAPH_LEGALITY, PLAN_SOUNDNESS, RUN_TEARDOWN],
    );
}

#[test]
fn oversized_write_promises_fail_the_run_cleanly() {
    let mut graph = Graph::new();
    let src = graph.add_block("src", Source::new(payload(12, 4096))).unwrap();
    let sink = Sink::default();
    let snk = graph.add_block("sink", sink.clone()).unwrap();
    graph.connect(src, 0, snk, 0).unwrap();
    graph.add_pool("main", 1).unwrap();
    let max_write = graph.parameter(src, OUTPUT_MAX_WRITE).unwrap();

    // the ring length fits but ring plus overhang does not
    graph.set_parameter(max_write, 6_148_914_691_236_517_206i64).unwrap();
    assert!(matches!(graph.run(), Err(Error::Map { .. })));
    assert_eq!(graph.state(), GraphState::Paused);

    graph.set_parameter(max_write, 256i64).unwrap();
    graph.run().unwrap();
    graph.wait().unwrap();
    assert_eq!(sink.take(), payload(12, 4096));
}

#[test]
fn oversized_read_promises_fail_the_run_cleanly() {
    let mut graph = Graph::new();
    let src = graph.add_block("src", Source::new(payload(13, 100))).unwrap();
    let snk = graph
        .add_block("sink", Sink::with_max_read(usize::MAX))
        .unwrap();
    graph.connect(src, 0, snk, 0).unwrap();
    graph.add_pool("main", 0).unwrap();
    assert!(matches!(graph.run(), Err(Error::InvalidPromise { .. })));
    assert_eq!(graph.state(), GraphState::Paused);
}

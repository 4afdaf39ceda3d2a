//! Parameter delivery: Getter fan-out, Setters set while flowing and
//! Constants set while paused.

mod common;

use common::{Listener, Sink};
use flowkernel::{
    Block, BlockError, Declare, Error, Flow, FlowIo, Graph, ParamError, ParamId, ParamType,
    ParamValue, TriggerAction, TriggerContext, TriggerId, TriggerKind,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// A stream source that publishes its call count through a Getter.
struct Ticker {
    ticks: i64,
    limit: i64,
    getter: Option<ParamId>,
}

impl Ticker {
    fn new(limit: i64) -> Self {
        Self {
            ticks: 0,
            limit,
            getter: None,
        }
    }
}

impl Block for Ticker {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_outputs(1, 1);
        self.getter = Some(decl.getter("tick", ParamType::Int, 1)?);
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        if self.ticks == self.limit {
            return Ok(Flow::Finished);
        }
        if let Some(getter) = self.getter {
            io.push(getter, self.ticks)?;
        }
        self.ticks += 1;
        io.output(0)[0] = 1;
        io.advance_output(0, 1);
        Ok(Flow::Continue)
    }
}

/// Keeps a run alive until its event fires, then pushes once and frees
/// the trigger.
#[derive(Default)]
struct Holder {
    getter: Option<ParamId>,
}

impl Block for Holder {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        self.getter = Some(decl.getter("out", ParamType::Int, 1)?);
        decl.event(true);
        Ok(())
    }

    fn trigger(
        &mut self,
        _id: TriggerId,
        ctx: &mut TriggerContext<'_>,
    ) -> Result<TriggerAction, BlockError> {
        if let Some(getter) = self.getter {
            ctx.push(getter, 99i64)?;
        }
        Ok(TriggerAction::Free)
    }
}

/// Records Constant deliveries.
#[derive(Default, Clone)]
struct Tuned {
    seen: Arc<Mutex<Vec<f64>>>,
}

impl Block for Tuned {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.constant("gain", ParamValue::Double(vec![1.0]))?;
        Ok(())
    }

    fn set_parameter(&mut self, _id: ParamId, value: &ParamValue) -> Result<(), BlockError> {
        if let Some(v) = value.as_double() {
            self.seen.lock().push(v);
        }
        Ok(())
    }
}

fn ticker_group(graph: &mut Graph, name: &str, limit: i64) -> Vec<Listener> {
    let ticker = graph.add_block(name, Ticker::new(limit)).unwrap();
    let sink = graph.add_block(&format!("{name}-sink"), Sink::default()).unwrap();
    graph.connect(ticker, 0, sink, 0).unwrap();
    let tick = graph.parameter(ticker, "tick").unwrap();
    (0..3)
        .map(|n| {
            let listener = Listener::default();
            let id = graph
                .add_block(&format!("{name}-listener-{n}"), listener.clone())
                .unwrap();
            let value = graph.parameter(id, "value").unwrap();
            graph.connect_parameters(tick, value).unwrap();
            listener
        })
        .collect()
}

#[test]
fn getter_reaches_every_setter_once() {
    let mut graph = Graph::new();
    let listeners = ticker_group(&mut graph, "ticker", 500);
    graph.add_pool("main", 2).unwrap();
    graph.run().unwrap();
    graph.wait().unwrap();
    let expected: Vec<i64> = (0..500).collect();
    for listener in listeners {
        assert_eq!(*listener.values.lock(), expected);
    }
}

#[test]
fn concurrent_getters_stay_separate() {
    let mut graph = Graph::new();
    let first = ticker_group(&mut graph, "a", 300);
    let second = ticker_group(&mut graph, "b", 400);
    let sources = graph.add_pool("sources", 4).unwrap();
    let sinks = graph.add_pool("listeners", 3).unwrap();
    for name in ["a", "b", "a-sink", "b-sink"] {
        let id = graph.block_id(name).unwrap();
        graph.assign(id, sources).unwrap();
    }
    for name in ["a", "b"] {
        for n in 0..3 {
            let id = graph.block_id(&format!("{name}-listener-{n}")).unwrap();
            graph.assign(id, sinks).unwrap();
        }
    }
    graph.run().unwrap();
    graph.wait().unwrap();
    for listener in first {
        assert_eq!(*listener.values.lock(), (0..300).collect::<Vec<i64>>());
    }
    for listener in second {
        assert_eq!(*listener.values.lock(), (0..400).collect::<Vec<i64>>());
    }
}

#[test]
fn setters_and_trigger_pushes_while_flowing() {
    let mut graph = Graph::new();
    let holder = graph.add_block("holder", Holder::default()).unwrap();
    let direct = Listener::default();
    let pushed = Listener::default();
    let direct_id = graph.add_block("direct", direct.clone()).unwrap();
    let pushed_id = graph.add_block("pushed", pushed.clone()).unwrap();
    let out = graph.parameter(holder, "out").unwrap();
    let pushed_value = graph.parameter(pushed_id, "value").unwrap();
    graph.connect_parameters(out, pushed_value).unwrap();
    let direct_value = graph.parameter(direct_id, "value").unwrap();
    graph.add_pool("main", 2).unwrap();

    let event = graph
        .triggers_of(holder)
        .unwrap()
        .into_iter()
        .find(|(_, kind)| *kind == TriggerKind::Event)
        .map(|(id, _)| id)
        .unwrap();
    let event = graph.event_handle(event).unwrap();
    assert!(!event.fire());

    graph.run().unwrap();
    graph.set_parameter(direct_value, 42i64).unwrap();
    assert!(matches!(
        graph.set_parameter(out, 1i64),
        Err(Error::Param(ParamError::WrongKind { .. }))
    ));
    assert!(event.fire());
    graph.wait().unwrap();

    assert_eq!(*direct.values.lock(), vec![42]);
    assert_eq!(*pushed.values.lock(), vec![99]);
    assert_eq!(graph.get_parameter(direct_value).unwrap().as_int(), Some(42));
}

#[test]
fn constants_are_set_only_while_paused() {
    let mut graph = Graph::new();
    let tuned = Tuned::default();
    let a = graph.add_block("a", tuned.clone()).unwrap();
    let b = graph.add_block("b", tuned.clone()).unwrap();
    let gain_a = graph.parameter(a, "gain").unwrap();
    let gain_b = graph.parameter(b, "gain").unwrap();
    graph.connect_parameters(gain_a, gain_b).unwrap();

    graph.set_parameter(gain_a, 0.25).unwrap();
    assert_eq!(*tuned.seen.lock(), vec![0.25, 0.25]);
    assert_eq!(graph.get_parameter(gain_b).unwrap().as_double(), Some(0.25));
    assert!(graph.set_parameter(gain_a, 3i64).is_err());

    let ticker = graph.add_block("ticker", Ticker::new(10_000)).unwrap();
    let sink = graph.add_block("sink", Sink::default()).unwrap();
    graph.connect(ticker, 0, sink, 0).unwrap();
    graph.add_pool("main", 1).unwrap();
    graph.run().unwrap();
    let flowing = graph.set_parameter(gain_a, 0.5);
    graph.halt().unwrap();
    graph.wait().unwrap();
    assert!(matches!(
        flowing,
        Err(Error::Param(ParamError::NotPaused))
    ));
    graph.set_parameter(gain_b, 0.75).unwrap();
    assert_eq!(*tuned.seen.lock(), vec![0.25, 0.25, 0.75, 0.75]);
}

#[test]
fn paused_setter_write_stays_out_of_its_getter_group() {
    let mut graph = Graph::new();
    let holder = graph.add_block("g", Holder::default()).unwrap();
    let a = Listener::default();
    let b = Listener::default();
    let a_id = graph.add_block("a", a.clone()).unwrap();
    let b_id = graph.add_block("b", b.clone()).unwrap();
    let out = graph.parameter(holder, "out").unwrap();
    let a_value = graph.parameter(a_id, "value").unwrap();
    let b_value = graph.parameter(b_id, "value").unwrap();
    graph.connect_parameters(out, a_value).unwrap();
    graph.connect_parameters(out, b_value).unwrap();

    graph.set_parameter(a_value, 5i64).unwrap();
    assert_eq!(*a.values.lock(), vec![5]);
    assert!(b.values.lock().is_empty());
    assert_eq!(graph.get_parameter(a_value).unwrap().as_int(), Some(5));
    assert_eq!(graph.get_parameter(b_value).unwrap().as_int(), Some(0));
    assert_eq!(graph.get_parameter(out).unwrap().as_int(), Some(0));
}

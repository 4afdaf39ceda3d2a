//! Scheduling: a block is never entered twice at once and every run
//! reaches its end whatever the pool layout.

mod common;

use common::{payload, CopyBlock, Forward, Sink, Source};
use flowkernel::{Graph, OUTPUT_MAX_WRITE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::Ordering;

const LEN: usize = 20_000;

fn copy_chain(graph: &mut Graph, len: usize, seed: u64) -> (Vec<CopyBlock>, Sink) {
    let src = graph.add_block("src", Source::new(payload(seed, LEN))).unwrap();
    let mut last = src;
    let mut copies = Vec::new();
    for n in 0..len {
        let copy = CopyBlock::default();
        let entered = copy.entered.clone();
        let overlaps = copy.overlaps.clone();
        let id = graph.add_block(&format!("copy-{n}"), copy).unwrap();
        graph.connect(last, 0, id, 0).unwrap();
        copies.push(CopyBlock { entered, overlaps });
        last = id;
    }
    let sink = Sink::with_max_read(97);
    let snk = graph.add_block("sink", sink.clone()).unwrap();
    graph.connect(last, 0, snk, 0).unwrap();
    (copies, sink)
}

#[test]
fn blocks_are_never_entered_twice() {
    let mut graph = Graph::new();
    let (copies, sink) = copy_chain(&mut graph, 6, 21);
    let wide = graph.add_pool("wide", 8).unwrap();
    let narrow = graph.add_pool("narrow", 2).unwrap();
    for n in 0..6 {
        let id = graph.block_id(&format!("copy-{n}")).unwrap();
        graph.assign(id, if n % 2 == 0 { wide } else { narrow }).unwrap();
    }
    graph.run().unwrap();
    graph.wait().unwrap();
    assert_eq!(sink.take(), payload(21, LEN));
    for copy in copies {
        assert_eq!(copy.overlaps.load(Ordering::Relaxed), 0);
    }
}

#[test]
fn single_thread_reaches_the_end() {
    let mut graph = Graph::new();
    let src = graph.add_block("src", Source::new(payload(8, LEN))).unwrap();
    let fwd = graph.add_block("fwd", Forward::default()).unwrap();
    let copy = graph.add_block("copy", CopyBlock::default()).unwrap();
    let sink = Sink::with_max_read(13);
    let snk = graph.add_block("sink", sink.clone()).unwrap();
    graph.connect(src, 0, fwd, 0).unwrap();
    graph.connect(fwd, 0, copy, 0).unwrap();
    graph.connect(copy, 0, snk, 0).unwrap();
    let max_write = graph.parameter(src, OUTPUT_MAX_WRITE).unwrap();
    graph.set_parameter(max_write, 7i64).unwrap();
    graph.add_pool("main", 1).unwrap();
    graph.run().unwrap();
    let report = graph.wait().unwrap();
    assert_eq!(sink.take(), payload(8, LEN));
    assert_eq!(report.threads_spawned, 1);
    // every byte moves at most seven at a time out of the source
    assert!(report.flow_calls >= (LEN / 7) as u64);
}

#[test]
fn one_source_one_sink_drains_are_bounded() {
    let mut graph = Graph::new();
    let src = graph.add_block("src", Source::new(payload(2, 8000))).unwrap();
    let sink = Sink::default();
    let snk = graph.add_block("sink", sink.clone()).unwrap();
    graph.connect(src, 0, snk, 0).unwrap();
    graph.add_pool("main", 1).unwrap();
    graph.run().unwrap();
    let report = graph.wait().unwrap();
    assert_eq!(sink.take(), payload(2, 8000));
    // eight 1024-byte writes, each hop handing off at most a few times
    assert!(report.drains <= 64, "{} drains", report.drains);
}

#[test]
fn random_layouts_deliver_every_byte() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..12u64 {
        let mut graph = Graph::new();
        let depth = rng.gen_range(1..5);
        let (copies, sink) = copy_chain(&mut graph, depth, round);
        let pools: Vec<_> = (0..rng.gen_range(1..4))
            .map(|n| graph.add_pool(&format!("pool-{n}"), rng.gen_range(0..4)).unwrap())
            .collect();
        let mut names = vec!["src".to_owned(), "sink".to_owned()];
        names.extend((0..depth).map(|n| format!("copy-{n}")));
        for name in &names {
            let id = graph.block_id(name).unwrap();
            let pool = pools[rng.gen_range(0..pools.len())];
            graph.assign(id, pool).unwrap();
        }
        let src = graph.block_id("src").unwrap();
        let max_write = graph.parameter(src, OUTPUT_MAX_WRITE).unwrap();
        graph
            .set_parameter(max_write, rng.gen_range(1..600i64))
            .unwrap();

        graph.run().unwrap();
        graph.wait().unwrap();
        assert_eq!(sink.take(), payload(round, LEN), "round {round}");
        for copy in copies {
            assert_eq!(copy.overlaps.load(Ordering::Relaxed), 0);
        }
    }
}

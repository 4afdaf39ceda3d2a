//! Plan module: size the stream rings and bind ports to cursors.
//!
//! One ring serves an origin output, every input it feeds, and every
//! pass-through chain hanging off those inputs. A pass-through output writes
//! in place over its input's span, so it shares the input's cursor and adds a
//! hop to the same ring instead of getting memory of its own.

use crate::error::{Error, Result};
use crate::graph::BlockId;
use crate::invariant_ppt::{assert_invariant, PLAN_SOUNDNESS};
use crate::ring::RingId;
use std::collections::{HashMap, VecDeque};

/// Handle to a logical cursor within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CursorId(pub usize);

/// Handle to a hop: one writer and the inputs it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HopId(pub usize);

/// Read side of a port as configured by `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPromise {
    pub max_read: usize,
    pub threshold: usize,
    /// Output this input is passed through to, if any.
    pub pass_to: Option<usize>,
}

/// Write side of a port as configured by `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputPromise {
    pub max_write: usize,
    /// Input this output writes in place over, if any.
    pub pass_from: Option<usize>,
}

/// Promises of one block's connected ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockPromises {
    pub name: String,
    pub inputs: Vec<InputPromise>,
    pub outputs: Vec<OutputPromise>,
}

/// A stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamEdge {
    pub from: BlockId,
    pub output: usize,
    pub to: BlockId,
    pub input: usize,
}

/// Size of one ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingPlan {
    pub id: RingId,
    pub map_length: usize,
    pub overhang: usize,
    /// The origin output that owns the ring.
    pub origin: (BlockId, usize),
}

/// One writer and its readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopPlan {
    pub id: HopId,
    pub ring: RingId,
    pub writer: (BlockId, usize),
    pub writer_cursor: CursorId,
    pub readers: Vec<(BlockId, usize, CursorId)>,
    /// Whether the writer is the ring's origin output.
    pub origin: bool,
}

/// The compiled buffer plan for one run.
#[derive(Debug, Clone, Default)]
pub struct BufferPlan {
    /// Blocks in topological order.
    pub order: Vec<BlockId>,
    pub rings: Vec<RingPlan>,
    pub hops: Vec<HopPlan>,
    pub cursor_count: usize,
    /// (block, input) -> (hop it reads from, its cursor).
    pub inputs: HashMap<(BlockId, usize), (HopId, CursorId)>,
    /// (block, output) -> (hop it writes, its cursor).
    pub outputs: HashMap<(BlockId, usize), (HopId, CursorId)>,
}

impl BufferPlan {
    /// Compile a plan from per-block promises (indexed by `BlockId`) and
    /// the stream connections between them.
    pub fn compile(blocks: &[Option<BlockPromises>], edges: &[StreamEdge]) -> Result<Self> {
        let order = topo_sort(blocks, edges)?;
        let sizer = Sizer::new(blocks, edges)?;
        let mut plan = BufferPlan {
            order,
            ..Default::default()
        };

        for (b, promises) in blocks.iter().enumerate() {
            let Some(promises) = promises else { continue };
            for (o, out) in promises.outputs.iter().enumerate() {
                if out.pass_from.is_some() {
                    continue;
                }
                let origin = (BlockId(b), o);
                let map_length = sizer
                    .extent(origin)
                    .and_then(|extent| extent.checked_add(out.max_write))
                    .ok_or_else(|| Error::InvalidPromise {
                        block: promises.name.clone(),
                        detail: format!("output {o}: ring size overflows with these promises"),
                    })?;
                let overhang = sizer.largest_op(origin);
                let ring = RingId(plan.rings.len());
                plan.rings.push(RingPlan {
                    id: ring,
                    map_length,
                    overhang,
                    origin,
                });
                let cursor = plan.new_cursor();
                plan.bind_hop(&sizer, ring, origin, cursor, true);
            }
        }

        assert_invariant(
            PLAN_SOUNDNESS,
            plan.rings.iter().all(|r| r.overhang <= r.map_length),
            "every ring fits its overhang",
            Some("compile"),
        );
        Ok(plan)
    }

    fn new_cursor(&mut self) -> CursorId {
        let id = CursorId(self.cursor_count);
        self.cursor_count += 1;
        id
    }

    fn bind_hop(
        &mut self,
        sizer: &Sizer<'_>,
        ring: RingId,
        writer: (BlockId, usize),
        writer_cursor: CursorId,
        origin: bool,
    ) {
        let hop = HopId(self.hops.len());
        self.outputs.insert(writer, (hop, writer_cursor));
        self.hops.push(HopPlan {
            id: hop,
            ring,
            writer,
            writer_cursor,
            readers: Vec::new(),
            origin,
        });
        for &(block, input) in sizer.readers(writer) {
            let cursor = self.new_cursor();
            self.inputs.insert((block, input), (hop, cursor));
            self.hops[hop.0].readers.push((block, input, cursor));
            if let Some(out) = sizer.input(block, input).pass_to {
                self.bind_hop(sizer, ring, (block, out), cursor, false);
            }
        }
    }
}

struct Sizer<'a> {
    blocks: &'a [Option<BlockPromises>],
    readers: HashMap<(BlockId, usize), Vec<(BlockId, usize)>>,
}

impl<'a> Sizer<'a> {
    fn new(blocks: &'a [Option<BlockPromises>], edges: &[StreamEdge]) -> Result<Self> {
        let mut readers: HashMap<(BlockId, usize), Vec<(BlockId, usize)>> = HashMap::new();
        for edge in edges {
            readers
                .entry((edge.from, edge.output))
                .or_default()
                .push((edge.to, edge.input));
        }
        for list in readers.values_mut() {
            list.sort();
        }
        let sizer = Self { blocks, readers };
        sizer.validate(edges)?;
        Ok(sizer)
    }

    fn validate(&self, edges: &[StreamEdge]) -> Result<()> {
        for (b, promises) in self.blocks.iter().enumerate() {
            let Some(p) = promises else { continue };
            let block = BlockId(b);
            for (i, input) in p.inputs.iter().enumerate() {
                if input.max_read == 0 || input.threshold == 0 || input.threshold > input.max_read
                {
                    return Err(Error::InvalidPromise {
                        block: p.name.clone(),
                        detail: format!(
                            "input {i}: threshold {} with max_read {}",
                            input.threshold, input.max_read
                        ),
                    });
                }
                if let Some(o) = input.pass_to {
                    let reject = |reason| Error::InvalidPassThrough {
                        block: p.name.clone(),
                        input: i,
                        output: o,
                        reason,
                    };
                    let paired = p.outputs.get(o).and_then(|out| out.pass_from) == Some(i);
                    let feeder = edges.iter().find(|e| e.to == block && e.input == i);
                    let feeds = self.readers.contains_key(&(block, o));
                    if !paired || feeder.is_none() || !feeds {
                        return Err(reject("both sides must be connected"));
                    }
                    // in-place writes would race with sibling readers
                    if let Some(e) = feeder {
                        if self.readers((e.from, e.output)).len() > 1 {
                            return Err(reject("the feeding output must not fan out"));
                        }
                    }
                }
            }
            for (o, output) in p.outputs.iter().enumerate() {
                if output.pass_from.is_none() && output.max_write == 0 {
                    return Err(Error::InvalidPromise {
                        block: p.name.clone(),
                        detail: format!("output {o}: max_write must be at least 1"),
                    });
                }
            }
        }
        Ok(())
    }

    fn input(&self, block: BlockId, input: usize) -> InputPromise {
        self.blocks[block.0]
            .as_ref()
            .map(|p| p.inputs[input])
            .unwrap_or(InputPromise {
                max_read: 0,
                threshold: 0,
                pass_to: None,
            })
    }

    fn readers(&self, writer: (BlockId, usize)) -> &[(BlockId, usize)] {
        self.readers.get(&writer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Largest single write this hop may make.
    fn write_promise(&self, writer: (BlockId, usize)) -> usize {
        let Some(p) = self.blocks[writer.0 .0].as_ref() else {
            return 0;
        };
        let out = p.outputs[writer.1];
        match out.pass_from {
            Some(i) => p.inputs[i].max_read,
            None => out.max_write,
        }
    }

    /// Bytes of ring this hop and every chain below it need, or `None` if
    /// that does not fit a `usize`.
    fn extent(&self, writer: (BlockId, usize)) -> Option<usize> {
        let readers = self.readers(writer);
        let max_read = readers
            .iter()
            .map(|&(b, i)| self.input(b, i).max_read)
            .max()
            .unwrap_or(0);
        let mut below = 0;
        for &(b, i) in readers {
            if let Some(o) = self.input(b, i).pass_to {
                below = below.max(self.extent((b, o))?);
            }
        }
        self.write_promise(writer).max(max_read).checked_add(below)
    }

    /// Largest single read or write anywhere in the chain.
    fn largest_op(&self, writer: (BlockId, usize)) -> usize {
        self.readers(writer)
            .iter()
            .map(|&(b, i)| {
                let input = self.input(b, i);
                let below = input.pass_to.map(|o| self.largest_op((b, o))).unwrap_or(0);
                input.max_read.max(below)
            })
            .fold(self.write_promise(writer), usize::max)
    }
}

/// Kahn topological sort over blocks and stream edges.
pub(crate) fn topo_sort(blocks: &[Option<BlockPromises>], edges: &[StreamEdge]) -> Result<Vec<BlockId>> {
    let mut in_degree = vec![0; blocks.len()];
    let mut adj: Vec<Vec<BlockId>> = vec![vec![]; blocks.len()];

    for edge in edges {
        adj[edge.from.0].push(edge.to);
        in_degree[edge.to.0] += 1;
    }

    let mut queue = VecDeque::new();
    for (i, &deg) in in_degree.iter().enumerate() {
        if deg == 0 && blocks[i].is_some() {
            queue.push_back(BlockId(i));
        }
    }

    let mut order = Vec::new();
    while let Some(block) = queue.pop_front() {
        order.push(block);
        for &next in &adj[block.0] {
            in_degree[next.0] -= 1;
            if in_degree[next.0] == 0 {
                queue.push_back(next);
            }
        }
    }

    let live = blocks.iter().filter(|b| b.is_some()).count();
    if order.len() == live {
        Ok(order)
    } else {
        Err(Error::StreamLoop(live - order.len()))
    }
}

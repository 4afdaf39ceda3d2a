//! Graph module: blocks, stream connections, thread pools and parameters.
//!
//! The graph owns every block. Simple blocks carry a user [`Block`]; super
//! blocks group other blocks and export some of their ports and parameters
//! under their own name, resolved recursively on use.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use crate::block::{Block, Declare, Declared};
use crate::config::RuntimeConfig;
use crate::error::{Error, ParamError, PortDir, Result, Stage};
use crate::invariant_ppt::{assert_invariant, GRAPH_LEGALITY, GRAPH_REJECTS_INVALID};
use crate::parameter::{
    ParamId, ParamInfo, ParamKind, ParamRegistry, ParamValue, OUTPUT_MAX_WRITE,
};
use crate::plan::StreamEdge;
use crate::pool::PoolSpec;
use crate::rt::{ActiveRun, EventHandle, HaltHandle, RunHub, Runtime};
use crate::scheduler::RunState;
use crate::states::GraphState;
use crate::trigger::{Job, TriggerId, TriggerKind, TriggerSpec};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Unique identifier for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub usize);

/// Unique identifier for a thread pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(pub usize);

pub(crate) struct SimpleBlock {
    pub(crate) block: Arc<Mutex<Box<dyn Block>>>,
    pub(crate) declared: Declared,
    pub(crate) pool: Option<PoolId>,
    pub(crate) constructed: bool,
    pub(crate) max_write: ParamId,
}

#[derive(Default)]
pub(crate) struct SuperBlock {
    pub(crate) children: Vec<BlockId>,
    pub(crate) inputs: Vec<(BlockId, usize)>,
    pub(crate) outputs: Vec<(BlockId, usize)>,
    pub(crate) params: HashMap<String, ParamId>,
}

pub(crate) enum BlockKind {
    Simple(SimpleBlock),
    Super(SuperBlock),
}

pub(crate) struct BlockSlot {
    pub(crate) name: String,
    pub(crate) parent: Option<BlockId>,
    pub(crate) kind: BlockKind,
}

/// A dataflow graph: blocks joined by byte streams and parameter groups.
pub struct Graph {
    pub(crate) runtime: Runtime,
    pub(crate) state: GraphState,
    pub(crate) blocks: Vec<Option<BlockSlot>>,
    pub(crate) names: HashMap<String, BlockId>,
    pub(crate) edges: Vec<StreamEdge>,
    pub(crate) pools: Vec<PoolSpec>,
    pub(crate) params: ParamRegistry,
    pub(crate) triggers: Vec<Option<TriggerSpec>>,
    pub(crate) hub: Arc<RunHub>,
    pub(crate) active: Option<ActiveRun>,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("state", &self.state)
            .field("blocks", &self.names.len())
            .field("edges", &self.edges)
            .field("pools", &self.pools)
            .finish()
    }
}

impl Graph {
    /// Create an empty graph with the default configuration.
    pub fn new() -> Self {
        Self::from_runtime(Runtime::new(RuntimeConfig::default()))
    }

    /// Create an empty graph with a validated configuration.
    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_runtime(Runtime::new(config)))
    }

    fn from_runtime(runtime: Runtime) -> Self {
        Self {
            runtime,
            state: GraphState::Created,
            blocks: Vec::new(),
            names: HashMap::new(),
            edges: Vec::new(),
            pools: Vec::new(),
            params: ParamRegistry::default(),
            triggers: Vec::new(),
            hub: Arc::new(RunHub::default()),
            active: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GraphState {
        self.state
    }

    /// The runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        self.runtime.config()
    }

    /// Stream connections, in connection order.
    pub fn edges(&self) -> &[StreamEdge] {
        &self.edges
    }

    pub(crate) fn require_editable(&self, operation: &'static str) -> Result<()> {
        if self.state.is_editable() {
            Ok(())
        } else {
            Err(Error::InvalidState {
                state: self.state,
                operation,
                required: "Created or Paused",
            })
        }
    }

    pub(crate) fn slot(&self, id: BlockId) -> Result<&BlockSlot> {
        self.blocks
            .get(id.0)
            .and_then(|b| b.as_ref())
            .ok_or(Error::InvalidBlock(id))
    }

    pub(crate) fn simple(&self, id: BlockId) -> Result<&SimpleBlock> {
        let slot = self.slot(id)?;
        match &slot.kind {
            BlockKind::Simple(simple) => Ok(simple),
            BlockKind::Super(_) => Err(Error::SuperBlock(slot.name.clone())),
        }
    }

    fn super_mut(&mut self, id: BlockId) -> Result<&mut SuperBlock> {
        let slot = self
            .blocks
            .get_mut(id.0)
            .and_then(|b| b.as_mut())
            .ok_or(Error::InvalidBlock(id))?;
        match &mut slot.kind {
            BlockKind::Super(sup) => Ok(sup),
            BlockKind::Simple(_) => Err(Error::InvalidBlock(id)),
        }
    }

    /// Simple blocks that are still in the graph.
    pub(crate) fn simple_ids(&self) -> Vec<BlockId> {
        self.blocks
            .iter()
            .enumerate()
            .filter_map(|(n, slot)| match slot {
                Some(BlockSlot {
                    kind: BlockKind::Simple(_),
                    ..
                }) => Some(BlockId(n)),
                _ => None,
            })
            .collect()
    }

    /// Look a block up by name.
    pub fn block_id(&self, name: &str) -> Option<BlockId> {
        self.names.get(name).copied()
    }

    /// Name of a block.
    pub fn block_name(&self, id: BlockId) -> Result<&str> {
        Ok(&self.slot(id)?.name)
    }

    /// Add a block; its `declare` runs immediately.
    pub fn add_block(&mut self, name: &str, block: impl Block) -> Result<BlockId> {
        self.insert_block(None, name, Box::new(block))
    }

    /// Add a block inside a super block.
    pub fn add_block_to(
        &mut self,
        parent: BlockId,
        name: &str,
        block: impl Block,
    ) -> Result<BlockId> {
        self.super_mut(parent)?;
        self.insert_block(Some(parent), name, Box::new(block))
    }

    /// Add an empty super block.
    pub fn add_super_block(&mut self, name: &str) -> Result<BlockId> {
        self.insert_super(None, name)
    }

    /// Add a super block nested in another.
    pub fn add_super_block_to(&mut self, parent: BlockId, name: &str) -> Result<BlockId> {
        self.super_mut(parent)?;
        self.insert_super(Some(parent), name)
    }

    fn claim_name(&self, name: &str) -> Result<BlockId> {
        self.require_editable("add_block")?;
        if self.names.contains_key(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        Ok(BlockId(self.blocks.len()))
    }

    fn place(&mut self, id: BlockId, parent: Option<BlockId>, name: &str, kind: BlockKind) {
        self.blocks.push(Some(BlockSlot {
            name: name.to_string(),
            parent,
            kind,
        }));
        self.names.insert(name.to_string(), id);
        if let Some(parent) = parent {
            if let Ok(sup) = self.super_mut(parent) {
                sup.children.push(id);
            }
        }
    }

    fn insert_super(&mut self, parent: Option<BlockId>, name: &str) -> Result<BlockId> {
        let id = self.claim_name(name)?;
        self.place(id, parent, name, BlockKind::Super(SuperBlock::default()));
        Ok(id)
    }

    fn insert_block(
        &mut self,
        parent: Option<BlockId>,
        name: &str,
        mut block: Box<dyn Block>,
    ) -> Result<BlockId> {
        let id = self.claim_name(name)?;
        let default_write = self.runtime.config().default_max_write as i64;
        let max_write = self.params.declare(
            id,
            name,
            OUTPUT_MAX_WRITE,
            ParamKind::Constant,
            ParamValue::Int(vec![default_write]),
        )?;
        let mark = self.triggers.len();
        let mut decl = Declare {
            block: id,
            name,
            params: &mut self.params,
            triggers: &mut self.triggers,
            declared: Declared::default(),
        };
        let declared = match block.declare(&mut decl) {
            Ok(()) => decl.declared,
            Err(source) => {
                self.params.remove_block(id)?;
                self.triggers.truncate(mark);
                return Err(Error::Block {
                    block: name.to_string(),
                    stage: Stage::Declare,
                    source,
                });
            }
        };
        if let Err(e) = check_pass_through(name, &declared) {
            self.params.remove_block(id)?;
            self.triggers.truncate(mark);
            return Err(e);
        }
        tracing::debug!(block = name, ?id, "added block");
        self.place(
            id,
            parent,
            name,
            BlockKind::Simple(SimpleBlock {
                block: Arc::new(Mutex::new(block)),
                declared,
                pool: None,
                constructed: false,
                max_write,
            }),
        );
        Ok(id)
    }

    /// Remove a block, its connections and parameters. Removing a super
    /// block removes everything inside it.
    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        self.require_editable("remove_block")?;
        self.slot(id)?;
        let Some(slot) = self.blocks[id.0].take() else {
            return Err(Error::InvalidBlock(id));
        };
        self.names.remove(&slot.name);
        if let Some(parent) = slot.parent {
            if let Ok(sup) = self.super_mut(parent) {
                sup.children.retain(|c| *c != id);
            }
        }
        match slot.kind {
            BlockKind::Super(sup) => {
                for child in sup.children {
                    // children are detached from the removed parent already
                    if let Some(Some(child_slot)) = self.blocks.get_mut(child.0) {
                        child_slot.parent = None;
                    }
                    self.remove_block(child)?;
                }
            }
            BlockKind::Simple(simple) => {
                self.edges.retain(|e| e.from != id && e.to != id);
                self.params.remove_block(id)?;
                for trigger in self.triggers.iter_mut() {
                    if trigger.as_ref().is_some_and(|t| t.block == id) {
                        *trigger = None;
                    }
                }
                if simple.constructed {
                    simple.block.lock().destroy();
                }
            }
        }
        tracing::debug!(block = %slot.name, "removed block");
        Ok(())
    }

    fn is_within(&self, block: BlockId, ancestor: BlockId) -> bool {
        let mut current = self.slot(block).ok().and_then(|s| s.parent);
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.slot(p).ok().and_then(|s| s.parent);
        }
        false
    }

    /// Expose an input of a block inside `sup` as the next input of `sup`.
    pub fn export_input(&mut self, sup: BlockId, inner: BlockId, port: usize) -> Result<usize> {
        self.require_editable("export_input")?;
        self.super_mut(sup)?;
        if !self.is_within(inner, sup) {
            return Err(Error::InvalidBlock(inner));
        }
        self.resolve_input(inner, port)?;
        let sup = self.super_mut(sup)?;
        sup.inputs.push((inner, port));
        Ok(sup.inputs.len() - 1)
    }

    /// Expose an output of a block inside `sup` as the next output of `sup`.
    pub fn export_output(&mut self, sup: BlockId, inner: BlockId, port: usize) -> Result<usize> {
        self.require_editable("export_output")?;
        self.super_mut(sup)?;
        if !self.is_within(inner, sup) {
            return Err(Error::InvalidBlock(inner));
        }
        self.resolve_output(inner, port)?;
        let sup = self.super_mut(sup)?;
        sup.outputs.push((inner, port));
        Ok(sup.outputs.len() - 1)
    }

    /// Expose a parameter of a block inside `sup` under `alias`.
    pub fn export_parameter(&mut self, sup: BlockId, param: ParamId, alias: &str) -> Result<()> {
        self.require_editable("export_parameter")?;
        let owner = self.params.info(param)?.block;
        self.super_mut(sup)?;
        if !self.is_within(owner, sup) {
            return Err(Error::InvalidBlock(owner));
        }
        let name = self.slot(sup)?.name.clone();
        let sup = self.super_mut(sup)?;
        if sup.params.contains_key(alias) {
            return Err(ParamError::Duplicate(format!("{name}:{alias}")).into());
        }
        sup.params.insert(alias.to_string(), param);
        Ok(())
    }

    pub(crate) fn resolve_input(&self, block: BlockId, port: usize) -> Result<(BlockId, usize)> {
        let slot = self.slot(block)?;
        let invalid = || Error::InvalidPort {
            block: slot.name.clone(),
            dir: PortDir::Input,
            port,
        };
        match &slot.kind {
            BlockKind::Simple(simple) if port < simple.declared.inputs.max => Ok((block, port)),
            BlockKind::Simple(_) => Err(invalid()),
            BlockKind::Super(sup) => {
                let &(inner, p) = sup.inputs.get(port).ok_or_else(invalid)?;
                self.resolve_input(inner, p)
            }
        }
    }

    pub(crate) fn resolve_output(&self, block: BlockId, port: usize) -> Result<(BlockId, usize)> {
        let slot = self.slot(block)?;
        let invalid = || Error::InvalidPort {
            block: slot.name.clone(),
            dir: PortDir::Output,
            port,
        };
        match &slot.kind {
            BlockKind::Simple(simple) if port < simple.declared.outputs.max => Ok((block, port)),
            BlockKind::Simple(_) => Err(invalid()),
            BlockKind::Super(sup) => {
                let &(inner, p) = sup.outputs.get(port).ok_or_else(invalid)?;
                self.resolve_output(inner, p)
            }
        }
    }

    /// Add a thread pool. `max_threads == 0` runs the pool on the thread
    /// that calls [`Graph::wait`].
    pub fn add_pool(&mut self, name: &str, max_threads: usize) -> Result<PoolId> {
        self.require_editable("add_pool")?;
        self.pools.push(PoolSpec {
            name: name.to_string(),
            max_threads,
        });
        Ok(PoolId(self.pools.len() - 1))
    }

    /// Run a block (or every block in a super block) on `pool`.
    pub fn assign(&mut self, block: BlockId, pool: PoolId) -> Result<()> {
        self.require_editable("assign")?;
        if pool.0 >= self.pools.len() {
            return Err(Error::InvalidPool(pool));
        }
        let children = match &mut self.slot_mut(block)?.kind {
            BlockKind::Simple(simple) => {
                simple.pool = Some(pool);
                return Ok(());
            }
            BlockKind::Super(sup) => sup.children.clone(),
        };
        for child in children {
            self.assign(child, pool)?;
        }
        Ok(())
    }

    pub(crate) fn slot_mut(&mut self, id: BlockId) -> Result<&mut BlockSlot> {
        self.blocks
            .get_mut(id.0)
            .and_then(|b| b.as_mut())
            .ok_or(Error::InvalidBlock(id))
    }

    /// Connect an output to an input, validating ports and rejecting loops.
    pub fn connect(
        &mut self,
        from: BlockId,
        output: usize,
        to: BlockId,
        input: usize,
    ) -> Result<()> {
        self.require_editable("connect")?;
        let (from, output) = self.resolve_output(from, output)?;
        let (to, input) = self.resolve_input(to, input)?;

        if self.edges.iter().any(|e| e.to == to && e.input == input) {
            return Err(Error::PortAlreadyConnected {
                block: self.slot(to)?.name.clone(),
                port: input,
            });
        }

        if self.would_create_cycle(from, to) {
            assert_invariant(
                GRAPH_REJECTS_INVALID,
                self.would_create_cycle(from, to),
                "Cycle detected, rejecting",
                Some("connect"),
            );
            return Err(Error::CycleDetected {
                from: self.slot(from)?.name.clone(),
                to: self.slot(to)?.name.clone(),
            });
        }

        self.edges.push(StreamEdge {
            from,
            output,
            to,
            input,
        });

        assert_invariant(
            GRAPH_LEGALITY,
            true,
            "Edge added successfully, graph remains legal",
            Some("connect"),
        );
        Ok(())
    }

    /// Remove the connection feeding an input.
    pub fn disconnect(&mut self, to: BlockId, input: usize) -> Result<()> {
        self.require_editable("disconnect")?;
        let (to, input) = self.resolve_input(to, input)?;
        let before = self.edges.len();
        self.edges.retain(|e| !(e.to == to && e.input == input));
        if self.edges.len() == before {
            return Err(Error::NotConnected {
                block: self.slot(to)?.name.clone(),
                port: input,
            });
        }
        Ok(())
    }

    fn would_create_cycle(&self, from: BlockId, to: BlockId) -> bool {
        let mut visited = vec![false; self.blocks.len()];
        self.dfs(to, from, &mut visited)
    }

    fn dfs(&self, current: BlockId, target: BlockId, visited: &mut [bool]) -> bool {
        if current == target {
            return true;
        }
        if visited[current.0] {
            return false;
        }
        visited[current.0] = true;
        for edge in &self.edges {
            if edge.from == current && self.dfs(edge.to, target, visited) {
                return true;
            }
        }
        false
    }

    /// Connected input and output counts per simple block, plus the number
    /// of port violations (gaps and missing required ports).
    pub(crate) fn port_counts(&self) -> (HashMap<BlockId, (usize, usize)>, usize) {
        let mut counts = HashMap::new();
        let mut violations = 0;
        for id in self.simple_ids() {
            let Ok(simple) = self.simple(id) else { continue };
            let inputs: BTreeSet<usize> = self
                .edges
                .iter()
                .filter(|e| e.to == id)
                .map(|e| e.input)
                .collect();
            let outputs: BTreeSet<usize> = self
                .edges
                .iter()
                .filter(|e| e.from == id)
                .map(|e| e.output)
                .collect();
            let mut count = |ports: &BTreeSet<usize>, min: usize| {
                let n = ports.iter().next_back().map_or(0, |p| p + 1);
                violations += n - ports.len();
                violations += min.saturating_sub(n);
                n
            };
            let n_in = count(&inputs, simple.declared.inputs.min);
            let n_out = count(&outputs, simple.declared.outputs.min);
            counts.insert(id, (n_in, n_out));
        }
        (counts, violations)
    }

    /// Look up a parameter by block and name; super blocks resolve their
    /// exported aliases.
    pub fn parameter(&self, block: BlockId, name: &str) -> Result<ParamId> {
        let slot = self.slot(block)?;
        let found = match &slot.kind {
            BlockKind::Simple(_) => self.params.lookup(block, name),
            BlockKind::Super(sup) => sup.params.get(name).copied(),
        };
        found.ok_or_else(|| {
            ParamError::Unknown {
                block: slot.name.clone(),
                name: name.to_string(),
            }
            .into()
        })
    }

    /// Describe a parameter.
    pub fn parameter_info(&self, id: ParamId) -> Result<ParamInfo> {
        Ok(self.params.info(id)?)
    }

    /// Every parameter a simple block declared, the implicit
    /// `OutputMaxWrite` included.
    pub fn parameters_of(&self, block: BlockId) -> Result<Vec<ParamInfo>> {
        self.simple(block)?;
        self.params
            .for_block(block)
            .into_iter()
            .map(|id| Ok(self.params.info(id)?))
            .collect()
    }

    /// Join the groups of two parameters.
    pub fn connect_parameters(&mut self, a: ParamId, b: ParamId) -> Result<()> {
        self.require_editable("connect_parameters")?;
        Ok(self.params.connect(a, b)?)
    }

    /// Take a parameter out of its group.
    pub fn disconnect_parameter(&mut self, id: ParamId) -> Result<()> {
        self.require_editable("disconnect_parameter")?;
        Ok(self.params.disconnect(id)?)
    }

    /// Set a parameter.
    ///
    /// While paused, Constants and Setters are set together with their
    /// group and delivered on this thread. While flowing only Setters may
    /// be set; the value is delivered on the owning block's worker.
    pub fn set_parameter(&mut self, id: ParamId, value: impl Into<ParamValue>) -> Result<()> {
        let value = value.into();
        match self.state {
            GraphState::Flowing => {
                let Some(active) = &self.active else {
                    return Err(Error::InvalidState {
                        state: self.state,
                        operation: "set_parameter",
                        required: "an active run",
                    });
                };
                let (link, trigger) = active.state.params.prepare_setter(id, &value)?;
                active.state.queue(link.info.block, Job::Trigger(trigger));
                Ok(())
            }
            GraphState::Created | GraphState::Paused => {
                for member in self.params.set_paused(id, &value)? {
                    let owner = self.params.info(member)?.block;
                    let simple = self.simple(owner)?;
                    let result = simple.block.lock().set_parameter(member, &value);
                    result.map_err(|source| Error::Block {
                        block: self.slot(owner).map(|s| s.name.clone()).unwrap_or_default(),
                        stage: Stage::Parameter,
                        source,
                    })?;
                }
                Ok(())
            }
            state => Err(Error::InvalidState {
                state,
                operation: "set_parameter",
                required: "Created, Paused or Flowing",
            }),
        }
    }

    /// Current value of a parameter.
    pub fn get_parameter(&self, id: ParamId) -> Result<ParamValue> {
        Ok(self.params.get(id)?)
    }

    /// Triggers a simple block declared, with their kinds.
    pub fn triggers_of(&self, block: BlockId) -> Result<Vec<(TriggerId, TriggerKind)>> {
        self.simple(block)?;
        Ok(self
            .triggers
            .iter()
            .enumerate()
            .filter_map(|(n, t)| {
                t.as_ref()
                    .filter(|t| t.block == block && !t.freed)
                    .map(|t| (TriggerId(n), t.kind))
            })
            .collect())
    }

    /// A handle that fires an event trigger from any thread.
    pub fn event_handle(&self, trigger: TriggerId) -> Result<EventHandle> {
        match self.triggers.get(trigger.0).and_then(|t| t.as_ref()) {
            Some(spec) if spec.kind == TriggerKind::Event => {
                Ok(EventHandle::new(Arc::clone(&self.hub), trigger))
            }
            _ => Err(Error::InvalidTrigger(trigger)),
        }
    }

    /// A handle that halts the current run from any thread.
    pub fn halt_handle(&self) -> HaltHandle {
        HaltHandle::new(Arc::clone(&self.hub))
    }

    pub(crate) fn run_state(&self) -> Option<&Arc<RunState>> {
        self.active.as_ref().map(|a| &a.state)
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

fn check_pass_through(name: &str, declared: &Declared) -> Result<()> {
    let mut seen_in = BTreeSet::new();
    let mut seen_out = BTreeSet::new();
    for &(input, output) in &declared.pass_through {
        let reject = |reason| Error::InvalidPassThrough {
            block: name.to_string(),
            input,
            output,
            reason,
        };
        if input >= declared.inputs.max || output >= declared.outputs.max {
            return Err(reject("port out of the declared range"));
        }
        if !seen_in.insert(input) || !seen_out.insert(output) {
            return Err(reject("port used by two pass-throughs"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BlockError;
    use crate::parameter::ParamType;
    use proptest::prelude::*;

    struct Ports {
        inputs: (usize, usize),
        outputs: (usize, usize),
        pass: Option<(usize, usize)>,
    }

    impl Ports {
        fn new(inputs: usize, outputs: usize) -> Self {
            Self {
                inputs: (inputs, inputs),
                outputs: (outputs, outputs),
                pass: None,
            }
        }
    }

    impl Block for Ports {
        fn declare(&mut self, decl: &mut Declare<'_>) -> std::result::Result<(), BlockError> {
            decl.set_num_inputs(self.inputs.0, self.inputs.1);
            decl.set_num_outputs(self.outputs.0, self.outputs.1);
            if let Some((i, o)) = self.pass {
                decl.pass_through(i, o);
            }
            Ok(())
        }
    }

    struct Knob;

    impl Block for Knob {
        fn declare(&mut self, decl: &mut Declare<'_>) -> std::result::Result<(), BlockError> {
            decl.setter("gain", ParamType::Double, 1)?;
            Ok(())
        }
    }

    #[test]
    fn graph_cycle_detection() {
        let mut graph = Graph::new();
        let a = graph.add_block("a", Ports::new(1, 1)).unwrap();
        let b = graph.add_block("b", Ports::new(1, 1)).unwrap();
        graph.connect(a, 0, b, 0).unwrap();
        assert!(matches!(
            graph.connect(b, 0, a, 0),
            Err(Error::CycleDetected { .. })
        ));
        assert!(matches!(
            graph.connect(a, 0, a, 0),
            Err(Error::CycleDetected { .. })
        ));
    }

    #[test]
    fn graph_rejects_bad_ports() {
        let mut graph = Graph::new();
        let src = graph.add_block("src", Ports::new(0, 1)).unwrap();
        let sink = graph.add_block("sink", Ports::new(1, 0)).unwrap();
        assert!(matches!(
            graph.connect(src, 1, sink, 0),
            Err(Error::InvalidPort {
                dir: PortDir::Output,
                ..
            })
        ));
        graph.connect(src, 0, sink, 0).unwrap();
        assert!(matches!(
            graph.connect(src, 0, sink, 0),
            Err(Error::PortAlreadyConnected { .. })
        ));
        graph.disconnect(sink, 0).unwrap();
        assert!(matches!(
            graph.disconnect(sink, 0),
            Err(Error::NotConnected { .. })
        ));
    }

    #[test]
    fn names_are_unique() {
        let mut graph = Graph::new();
        graph.add_block("x", Ports::new(0, 1)).unwrap();
        assert!(matches!(
            graph.add_block("x", Ports::new(0, 1)),
            Err(Error::DuplicateName(_))
        ));
        assert!(graph.block_id("x").is_some());
    }

    #[test]
    fn port_gaps_are_counted() {
        let mut graph = Graph::new();
        let src = graph.add_block("src", Ports::new(0, 1)).unwrap();
        let mut wide = Ports::new(0, 0);
        wide.inputs = (2, 3);
        let sink = graph.add_block("sink", wide).unwrap();
        graph.connect(src, 0, sink, 2).unwrap();
        let (counts, violations) = graph.port_counts();
        // inputs 0 and 1 are missing
        assert_eq!(violations, 2);
        assert_eq!(counts[&sink], (3, 0));
    }

    #[test]
    fn bad_pass_through_rejected_at_declare() {
        let mut graph = Graph::new();
        let mut block = Ports::new(1, 1);
        block.pass = Some((0, 3));
        assert!(matches!(
            graph.add_block("p", block),
            Err(Error::InvalidPassThrough { .. })
        ));
        // the failed block left nothing behind
        assert!(graph.block_id("p").is_none());
        assert!(graph.add_block("p", Ports::new(1, 1)).is_ok());
    }

    #[test]
    fn super_block_exports_resolve_recursively() {
        let mut graph = Graph::new();
        let outer = graph.add_super_block("outer").unwrap();
        let inner = graph.add_super_block_to(outer, "inner").unwrap();
        let gain = graph.add_block_to(inner, "gain", Ports::new(1, 1)).unwrap();
        let knob = graph.add_block_to(inner, "knob", Knob).unwrap();
        assert_eq!(graph.export_input(inner, gain, 0).unwrap(), 0);
        assert_eq!(graph.export_output(inner, gain, 0).unwrap(), 0);
        graph.export_input(outer, inner, 0).unwrap();
        graph.export_output(outer, inner, 0).unwrap();
        let param = graph.parameter(knob, "gain").unwrap();
        graph.export_parameter(outer, param, "level").unwrap();

        let src = graph.add_block("src", Ports::new(0, 1)).unwrap();
        graph.connect(src, 0, outer, 0).unwrap();
        assert_eq!(graph.edges()[0].to, gain);
        assert_eq!(graph.parameter(outer, "level").unwrap(), param);
        assert!(graph.export_input(outer, src, 0).is_err());

        graph.remove_block(outer).unwrap();
        assert!(graph.edges().is_empty());
        assert!(graph.block_id("gain").is_none());
        assert!(graph.get_parameter(param).is_err());
    }

    #[test]
    fn every_block_has_output_max_write() {
        let mut graph = Graph::new();
        let b = graph.add_block("b", Ports::new(0, 1)).unwrap();
        let id = graph.parameter(b, OUTPUT_MAX_WRITE).unwrap();
        assert_eq!(graph.get_parameter(id).unwrap().as_int(), Some(1024));
        graph.set_parameter(id, 256i64).unwrap();
        assert_eq!(graph.get_parameter(id).unwrap().as_int(), Some(256));
        assert!(graph.set_parameter(id, 1.5).is_err());
    }

    #[test]
    fn assign_checks_pool() {
        let mut graph = Graph::new();
        let b = graph.add_block("b", Ports::new(0, 1)).unwrap();
        assert!(matches!(
            graph.assign(b, PoolId(0)),
            Err(Error::InvalidPool(_))
        ));
        let pool = graph.add_pool("main", 2).unwrap();
        graph.assign(b, pool).unwrap();
        assert_eq!(graph.simple(b).unwrap().pool, Some(pool));
    }

    proptest! {
        #[test]
        fn accepted_edges_never_form_loops(
            pairs in prop::collection::vec((0usize..6, 0usize..6), 1..30),
        ) {
            let mut graph = Graph::new();
            let mut ids = Vec::new();
            for n in 0..6 {
                let mut block = Ports::new(0, 0);
                block.inputs = (0, 8);
                block.outputs = (0, 8);
                ids.push(graph.add_block(&format!("b{n}"), block).unwrap());
            }
            let mut next_in = [0usize; 6];
            for (from, to) in pairs {
                if next_in[to] >= 8 {
                    continue;
                }
                if graph.connect(ids[from], 0, ids[to], next_in[to]).is_ok() {
                    next_in[to] += 1;
                }
            }
            let promises: Vec<Option<crate::plan::BlockPromises>> =
                (0..6).map(|_| Some(Default::default())).collect();
            prop_assert!(crate::plan::topo_sort(&promises, graph.edges()).is_ok());
        }
    }
}

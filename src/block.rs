//! The block contract: the trait user blocks implement and the contexts the
//! engine hands to each callback.
//!
//! A block runs on exactly one worker at a time. Its callbacks are:
//!
//! - `declare` when it is added to a graph, on the main thread;
//! - `construct` once, at its first run;
//! - `start` / `stop` around every run, where stream promises are set;
//! - `flow` / `flush` whenever stream data or space is available;
//! - `trigger` for signal and event triggers;
//! - `set_parameter` for Setter and Constant delivery;
//! - `destroy` once, when the graph is destroyed.

use crate::error::{BlockError, ParamError};
use crate::graph::BlockId;
use crate::invariant_ppt::{invariant_violation, PROMISE_READ, PROMISE_WRITE};
use crate::parameter::{ParamId, ParamKind, ParamRegistry, ParamType, ParamValue};
use crate::plan::{InputPromise, OutputPromise};
use crate::trigger::{TriggerId, TriggerKind, TriggerSpec};
use std::marker::PhantomData;
use std::sync::Arc;

/// Result of a `flow` or `flush` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Call again when data or space arrives.
    Continue,
    /// This block's stream is over; its outputs finish.
    Finished,
}

/// A processing unit in a graph.
pub trait Block: Send + 'static {
    /// Declare stream ports, pass-throughs, parameters and triggers.
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError>;

    fn construct(&mut self) -> Result<(), BlockError> {
        Ok(())
    }

    /// Configure stream promises for the coming run.
    fn start(&mut self, _ctx: &mut StartContext<'_>) -> Result<(), BlockError> {
        Ok(())
    }

    fn stop(&mut self, _ctx: &mut StopContext) -> Result<(), BlockError> {
        Ok(())
    }

    /// Consume from inputs and produce to outputs.
    ///
    /// When an input presents its full `max_read`, or the block is a stream
    /// source, the call must advance at least one port or return
    /// [`Flow::Finished`].
    fn flow(&mut self, _io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        Ok(Flow::Finished)
    }

    /// Called instead of `flow` once every feeder has finished, until it
    /// makes no progress.
    fn flush(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        self.flow(io)
    }

    fn trigger(
        &mut self,
        _id: TriggerId,
        _ctx: &mut TriggerContext<'_>,
    ) -> Result<TriggerAction, BlockError> {
        Ok(TriggerAction::Keep)
    }

    /// A Setter or Constant of this block received a value.
    fn set_parameter(&mut self, _id: ParamId, _value: &ParamValue) -> Result<(), BlockError> {
        Ok(())
    }

    fn destroy(&mut self) {}
}

pub use crate::trigger::TriggerAction;

/// Accepted number of stream ports in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortRange {
    pub min: usize,
    pub max: usize,
}

/// What a block declared about itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct Declared {
    pub(crate) inputs: PortRange,
    pub(crate) outputs: PortRange,
    pub(crate) pass_through: Vec<(usize, usize)>,
    pub(crate) triggers: Vec<TriggerId>,
    pub(crate) setters: Vec<(ParamId, TriggerId)>,
}

impl Declared {
    pub(crate) fn passed_to(&self, input: usize) -> Option<usize> {
        self.pass_through
            .iter()
            .find(|(i, _)| *i == input)
            .map(|(_, o)| *o)
    }

    pub(crate) fn passed_from(&self, output: usize) -> Option<usize> {
        self.pass_through
            .iter()
            .find(|(_, o)| *o == output)
            .map(|(i, _)| *i)
    }
}

/// Declaration context passed to [`Block::declare`].
pub struct Declare<'a> {
    pub(crate) block: BlockId,
    pub(crate) name: &'a str,
    pub(crate) params: &'a mut ParamRegistry,
    pub(crate) triggers: &'a mut Vec<Option<TriggerSpec>>,
    pub(crate) declared: Declared,
}

impl<'a> Declare<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn set_num_inputs(&mut self, min: usize, max: usize) {
        self.declared.inputs = PortRange {
            min,
            max: max.max(min),
        };
    }

    pub fn set_num_outputs(&mut self, min: usize, max: usize) {
        self.declared.outputs = PortRange {
            min,
            max: max.max(min),
        };
    }

    /// Make `output` write in place over the memory of `input`.
    pub fn pass_through(&mut self, input: usize, output: usize) {
        self.declared.pass_through.push((input, output));
    }

    /// Declare a Constant; its type and length come from `value`.
    pub fn constant(
        &mut self,
        name: &str,
        value: impl Into<ParamValue>,
    ) -> Result<ParamId, ParamError> {
        self.params
            .declare(self.block, self.name, name, ParamKind::Constant, value.into())
    }

    /// Declare a Getter this block pushes from `flow` or a trigger.
    pub fn getter(&mut self, name: &str, ty: ParamType, len: usize) -> Result<ParamId, ParamError> {
        self.params.declare(
            self.block,
            self.name,
            name,
            ParamKind::Getter,
            ParamValue::zero(ty, len),
        )
    }

    /// Declare a Setter delivered through [`Block::set_parameter`].
    pub fn setter(&mut self, name: &str, ty: ParamType, len: usize) -> Result<ParamId, ParamError> {
        let id = self.params.declare(
            self.block,
            self.name,
            name,
            ParamKind::Setter,
            ParamValue::zero(ty, len),
        )?;
        let trigger = self.add_trigger(TriggerKind::Parameter(id), false);
        self.params.bind_trigger(id, trigger);
        self.declared.setters.push((id, trigger));
        Ok(id)
    }

    /// Trigger on an OS signal. A source trigger keeps the run alive until
    /// it is stopped or freed.
    pub fn signal(&mut self, signum: i32, is_source: bool) -> TriggerId {
        let id = self.add_trigger(TriggerKind::Signal(signum), is_source);
        self.declared.triggers.push(id);
        id
    }

    /// Trigger fired through an [`EventHandle`](crate::rt::EventHandle).
    pub fn event(&mut self, is_source: bool) -> TriggerId {
        let id = self.add_trigger(TriggerKind::Event, is_source);
        self.declared.triggers.push(id);
        id
    }

    /// Only queue `trigger` when `check` returns true.
    pub fn check(&mut self, trigger: TriggerId, check: impl Fn() -> bool + Send + Sync + 'static) {
        if let Some(Some(spec)) = self.triggers.get_mut(trigger.0) {
            if spec.block == self.block {
                spec.check = Some(Arc::new(check));
            }
        }
    }

    fn add_trigger(&mut self, kind: TriggerKind, is_source: bool) -> TriggerId {
        let id = TriggerId(self.triggers.len());
        self.triggers.push(Some(TriggerSpec {
            block: self.block,
            kind,
            is_source,
            check: None,
            freed: false,
        }));
        id
    }
}

/// Promise configuration passed to [`Block::start`].
pub struct StartContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) inputs: &'a mut [InputPromise],
    pub(crate) outputs: &'a mut [OutputPromise],
}

impl<'a> StartContext<'a> {
    pub fn name(&self) -> &str {
        self.name
    }

    /// Connected inputs this run.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Connected outputs this run.
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn max_read(&self, input: usize) -> Option<usize> {
        self.inputs.get(input).map(|p| p.max_read)
    }

    pub fn max_write(&self, output: usize) -> Option<usize> {
        self.outputs.get(output).map(|p| p.max_write)
    }

    pub fn set_max_read(&mut self, input: usize, bytes: usize) -> Result<(), BlockError> {
        let name = self.name;
        let port = self
            .inputs
            .get_mut(input)
            .ok_or_else(|| BlockError::msg(format!("{name}: no input {input}")))?;
        port.max_read = bytes;
        port.threshold = port.threshold.min(bytes.max(1));
        Ok(())
    }

    pub fn set_threshold(&mut self, input: usize, bytes: usize) -> Result<(), BlockError> {
        let name = self.name;
        let port = self
            .inputs
            .get_mut(input)
            .ok_or_else(|| BlockError::msg(format!("{name}: no input {input}")))?;
        port.threshold = bytes;
        Ok(())
    }

    /// Pass-through outputs take their write promise from their input.
    pub fn set_max_write(&mut self, output: usize, bytes: usize) -> Result<(), BlockError> {
        let name = self.name;
        let port = self
            .outputs
            .get_mut(output)
            .ok_or_else(|| BlockError::msg(format!("{name}: no output {output}")))?;
        if port.pass_from.is_some() {
            return Err(BlockError::msg(format!(
                "{name}: output {output} is a pass-through"
            )));
        }
        port.max_write = bytes;
        Ok(())
    }
}

/// Run totals passed to [`Block::stop`].
#[derive(Debug, Clone, Default)]
pub struct StopContext {
    pub(crate) read: Vec<usize>,
    pub(crate) written: Vec<usize>,
}

impl StopContext {
    /// Bytes consumed on `input` during the run.
    pub fn bytes_read(&self, input: usize) -> usize {
        self.read.get(input).copied().unwrap_or(0)
    }

    /// Bytes produced on `output` during the run.
    pub fn bytes_written(&self, output: usize) -> usize {
        self.written.get(output).copied().unwrap_or(0)
    }
}

/// Getter pushes made from inside a callback.
pub(crate) struct ParamPort<'a> {
    pub(crate) table: &'a crate::parameter::ParamTable,
    pub(crate) owner: BlockId,
    pub(crate) wakes: Vec<TriggerId>,
}

impl<'a> ParamPort<'a> {
    fn push(&mut self, id: ParamId, value: ParamValue) -> Result<(), ParamError> {
        let targets = self.table.prepare_push(self.owner, id, &value)?;
        self.wakes.extend(targets.into_iter().map(|(_, t)| t));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Span {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
    /// Index into the advance counters; a pass-through pair shares one.
    pub(crate) counter: usize,
    /// An input whose memory is also presented as an output.
    pub(crate) passed: bool,
}

/// Stream spans presented to one `flow` or `flush` call.
///
/// A pass-through output presents the same memory as its input, so the two
/// are never borrowed at once: [`FlowIo::input`] and [`FlowIo::output`] take
/// `&self` and `&mut self`, and [`FlowIo::split`] hides passed-through
/// inputs.
pub struct FlowIo<'a> {
    pub(crate) inputs: Vec<Span>,
    pub(crate) outputs: Vec<Span>,
    pub(crate) advanced: Vec<usize>,
    pub(crate) flushing: bool,
    pub(crate) block: &'a str,
    pub(crate) params: ParamPort<'a>,
    pub(crate) _memory: PhantomData<&'a mut [u8]>,
}

impl<'a> FlowIo<'a> {
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// True when called through `flush`.
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Readable bytes on `input`.
    ///
    /// # Panics
    ///
    /// Panics if the input does not exist.
    pub fn input(&self, input: usize) -> &[u8] {
        let span = self.input_span(input);
        // SAFETY: the span lies inside a live ring and is owned by this
        // block's cursor until the scheduler publishes its advance.
        unsafe { std::slice::from_raw_parts(span.ptr, span.len) }
    }

    /// Writable bytes on `output`; for a pass-through this is the input's
    /// data, modified in place.
    ///
    /// # Panics
    ///
    /// Panics if the output does not exist.
    pub fn output(&mut self, output: usize) -> &mut [u8] {
        let span = self.output_span(output);
        // SAFETY: as for `input`, plus `&mut self` excludes every other
        // span borrowed from this call.
        unsafe { std::slice::from_raw_parts_mut(span.ptr, span.len) }
    }

    /// Borrow all non-passed inputs and all outputs at once.
    pub fn split(&mut self) -> (Inputs<'_>, Outputs<'_>) {
        (
            Inputs {
                spans: &self.inputs,
            },
            Outputs {
                spans: &self.outputs,
                _memory: PhantomData,
            },
        )
    }

    /// Mark `bytes` of `input` consumed.
    pub fn advance_input(&mut self, input: usize, bytes: usize) {
        let span = self.input_span(input);
        let total = self.advanced[span.counter] + bytes;
        if total > span.len {
            invariant_violation(
                PROMISE_READ,
                "read past the presented span",
                &format!(
                    "block '{}' input {input}: advanced {total} of {}",
                    self.block, span.len
                ),
            );
        }
        self.advanced[span.counter] = total;
    }

    /// Mark `bytes` of `output` produced.
    ///
    /// A pass-through pair has one counter; advance either side, not both.
    pub fn advance_output(&mut self, output: usize, bytes: usize) {
        let span = self.output_span(output);
        let total = self.advanced[span.counter] + bytes;
        if total > span.len {
            invariant_violation(
                PROMISE_WRITE,
                "wrote past the write promise",
                &format!(
                    "block '{}' output {output}: advanced {total} of {}",
                    self.block, span.len
                ),
            );
        }
        self.advanced[span.counter] = total;
    }

    /// Push a Getter value to its connected Setters.
    pub fn push(&mut self, param: ParamId, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        self.params.push(param, value.into())
    }

    pub(crate) fn consumed(&self, input: usize) -> usize {
        self.advanced[self.inputs[input].counter]
    }

    pub(crate) fn produced(&self, output: usize) -> usize {
        self.advanced[self.outputs[output].counter]
    }

    fn input_span(&self, input: usize) -> Span {
        match self.inputs.get(input) {
            Some(span) => *span,
            None => invariant_violation(
                PROMISE_READ,
                "no such input",
                &format!("block '{}' input {input}", self.block),
            ),
        }
    }

    fn output_span(&self, output: usize) -> Span {
        match self.outputs.get(output) {
            Some(span) => *span,
            None => invariant_violation(
                PROMISE_WRITE,
                "no such output",
                &format!("block '{}' output {output}", self.block),
            ),
        }
    }
}

/// Read-only view of the inputs from [`FlowIo::split`].
pub struct Inputs<'b> {
    spans: &'b [Span],
}

impl<'b> Inputs<'b> {
    /// `None` for a missing or passed-through input.
    pub fn get(&self, input: usize) -> Option<&'b [u8]> {
        let span = self.spans.get(input).filter(|s| !s.passed)?;
        // SAFETY: see `FlowIo::input`; passed inputs are hidden so no output
        // aliases this memory.
        Some(unsafe { std::slice::from_raw_parts(span.ptr, span.len) })
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Mutable view of the outputs from [`FlowIo::split`].
pub struct Outputs<'b> {
    spans: &'b [Span],
    _memory: PhantomData<&'b mut [u8]>,
}

impl<'b> Outputs<'b> {
    pub fn get_mut(&mut self, output: usize) -> Option<&mut [u8]> {
        let span = self.spans.get(output)?;
        // SAFETY: see `FlowIo::output`.
        Some(unsafe { std::slice::from_raw_parts_mut(span.ptr, span.len) })
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// Context passed to [`Block::trigger`].
pub struct TriggerContext<'a> {
    pub(crate) kind: TriggerKind,
    pub(crate) block: &'a str,
    pub(crate) params: ParamPort<'a>,
    pub(crate) halt: bool,
}

impl<'a> TriggerContext<'a> {
    pub fn kind(&self) -> TriggerKind {
        self.kind
    }

    pub fn block_name(&self) -> &str {
        self.block
    }

    /// Push a Getter value to its connected Setters.
    pub fn push(&mut self, param: ParamId, value: impl Into<ParamValue>) -> Result<(), ParamError> {
        self.params.push(param, value.into())
    }

    /// Halt the whole run once this callback returns.
    pub fn halt(&mut self) {
        self.halt = true;
    }
}

//! Blocks shared by the integration tests.

#![allow(dead_code)]

use flowkernel::{
    Block, BlockError, Declare, Flow, FlowIo, ParamId, ParamType, ParamValue, StartContext,
    StopContext,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic test payload.
pub fn payload(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Lowest start and highest end address of the spans a block was shown.
#[derive(Default, Clone)]
pub struct AddressRange(Arc<Mutex<Option<(usize, usize)>>>);

impl AddressRange {
    pub fn record(&self, span: &[u8]) {
        let start = span.as_ptr() as usize;
        let end = start + span.len();
        let mut range = self.0.lock();
        *range = Some(match *range {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }

    pub fn get(&self) -> Option<(usize, usize)> {
        *self.0.lock()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.get().is_some_and(|(lo, hi)| lo <= addr && addr < hi)
    }
}

/// Writes a fixed payload, as much per call as the write promise allows.
pub struct Source {
    data: Vec<u8>,
    sent: usize,
    /// Where this source's output spans lay.
    pub written: AddressRange,
}

impl Source {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            sent: 0,
            written: AddressRange::default(),
        }
    }
}

impl Block for Source {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_outputs(1, 1);
        Ok(())
    }

    fn start(&mut self, _ctx: &mut StartContext<'_>) -> Result<(), BlockError> {
        self.sent = 0;
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        if self.sent == self.data.len() {
            return Ok(Flow::Finished);
        }
        let out = io.output(0);
        self.written.record(out);
        let n = out.len().min(self.data.len() - self.sent);
        out[..n].copy_from_slice(&self.data[self.sent..self.sent + n]);
        io.advance_output(0, n);
        self.sent += n;
        Ok(Flow::Continue)
    }
}

/// Pass-through block that forwards its input in place and checks that
/// both sides present the same memory.
#[derive(Default, Clone)]
pub struct Forward {
    pub calls: Arc<AtomicUsize>,
    pub aliased: Arc<AtomicUsize>,
    /// Start address of every span this block was shown.
    pub starts: Arc<Mutex<Vec<usize>>>,
    /// XOR applied in place; 0 leaves data untouched.
    pub mask: u8,
}

impl Block for Forward {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_inputs(1, 1);
        decl.set_num_outputs(1, 1);
        decl.pass_through(0, 0);
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        let in_ptr = io.input(0).as_ptr() as usize;
        let out = io.output(0);
        let n = out.len();
        let out_ptr = out.as_ptr() as usize;
        for byte in out.iter_mut() {
            *byte ^= self.mask;
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.starts.lock().push(out_ptr);
        if in_ptr == out_ptr {
            self.aliased.fetch_add(1, Ordering::Relaxed);
        }
        io.advance_output(0, n);
        Ok(Flow::Continue)
    }
}

/// Copies input to output through separate rings.
#[derive(Default)]
pub struct CopyBlock {
    pub entered: Arc<AtomicBool>,
    pub overlaps: Arc<AtomicUsize>,
}

impl Block for CopyBlock {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_inputs(1, 1);
        decl.set_num_outputs(1, 1);
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        if self.entered.swap(true, Ordering::AcqRel) {
            self.overlaps.fetch_add(1, Ordering::Relaxed);
        }
        let n = {
            let (inputs, mut outputs) = io.split();
            let (Some(input), Some(output)) = (inputs.get(0), outputs.get_mut(0)) else {
                return Err(BlockError::msg("copy block lost a port"));
            };
            let n = input.len().min(output.len());
            output[..n].copy_from_slice(&input[..n]);
            n
        };
        io.advance_input(0, n);
        io.advance_output(0, n);
        self.entered.store(false, Ordering::Release);
        Ok(Flow::Continue)
    }
}

/// Collects everything it reads.
#[derive(Default, Clone)]
pub struct Sink {
    pub received: Arc<Mutex<Vec<u8>>>,
    /// Read promise set at start; `None` keeps the default.
    pub max_read: Option<usize>,
    pub stopped_with: Arc<AtomicUsize>,
}

impl Sink {
    pub fn with_max_read(max_read: usize) -> Self {
        Self {
            max_read: Some(max_read),
            ..Self::default()
        }
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.received.lock())
    }
}

impl Block for Sink {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        decl.set_num_inputs(1, 1);
        Ok(())
    }

    fn start(&mut self, ctx: &mut StartContext<'_>) -> Result<(), BlockError> {
        if let Some(max_read) = self.max_read {
            ctx.set_max_read(0, max_read)?;
        }
        Ok(())
    }

    fn flow(&mut self, io: &mut FlowIo<'_>) -> Result<Flow, BlockError> {
        let data = io.input(0);
        let n = data.len();
        self.received.lock().extend_from_slice(data);
        io.advance_input(0, n);
        Ok(Flow::Continue)
    }

    fn stop(&mut self, ctx: &mut StopContext) -> Result<(), BlockError> {
        self.stopped_with.store(ctx.bytes_read(0), Ordering::Release);
        Ok(())
    }
}

/// A block with a single Setter that records every value it receives.
#[derive(Default, Clone)]
pub struct Listener {
    pub values: Arc<Mutex<Vec<i64>>>,
    pub param: Option<ParamId>,
}

impl Block for Listener {
    fn declare(&mut self, decl: &mut Declare<'_>) -> Result<(), BlockError> {
        self.param = Some(decl.setter("value", ParamType::Int, 1)?);
        Ok(())
    }

    fn set_parameter(&mut self, id: ParamId, value: &ParamValue) -> Result<(), BlockError> {
        if Some(id) == self.param {
            let v = value
                .as_int()
                .ok_or_else(|| BlockError::msg("expected an integer"))?;
            self.values.lock().push(v);
        }
        Ok(())
    }
}

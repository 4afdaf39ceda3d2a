//! flowkernel: a trigger-driven dataflow kernel.
//!
//! Blocks exchange byte streams through shared ring buffers and discrete
//! values through parameter groups; thread pools run their callbacks
//! whenever data, space, a signal or a parameter change arrives.

pub mod block;
pub mod config;
pub mod dsl;
pub mod error;
pub mod graph;
#[doc(hidden)]
pub mod invariant_ppt;
pub mod parameter;
pub mod plan;
mod pool;
pub mod ring;
pub mod rt;
mod scheduler;
mod signal;
pub mod states;
pub mod trigger;

pub use block::{
    Block, Declare, Flow, FlowIo, Inputs, Outputs, PortRange, StartContext, StopContext,
    TriggerContext,
};
pub use config::RuntimeConfig;
pub use dsl::{DslError, GraphBuilder};
pub use error::{BlockError, Error, ParamError, PortDir, Result, Stage};
pub use graph::{BlockId, Graph, PoolId};
pub use parameter::{ParamId, ParamInfo, ParamKind, ParamType, ParamValue, OUTPUT_MAX_WRITE};
pub use pool::PoolSpec;
pub use rt::{EventHandle, HaltHandle, RunReport};
pub use states::{GraphState, TriggerState};
pub use trigger::{TriggerAction, TriggerId, TriggerKind};

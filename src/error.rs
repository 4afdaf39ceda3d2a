//! Error types for flowkernel.

use crate::graph::{BlockId, PoolId};
use crate::parameter::ParamType;
use crate::states::GraphState;
use crate::trigger::TriggerId;
use thiserror::Error;

/// Direction of a stream port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDir {
    /// Input port (reader).
    Input,
    /// Output port (writer).
    Output,
}

impl std::fmt::Display for PortDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortDir::Input => write!(f, "input"),
            PortDir::Output => write!(f, "output"),
        }
    }
}

/// Block lifecycle stage an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Declare,
    Construct,
    Start,
    Flow,
    Flush,
    Trigger,
    Parameter,
    Stop,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Declare => "declare",
            Stage::Construct => "construct",
            Stage::Start => "start",
            Stage::Flow => "flow",
            Stage::Flush => "flush",
            Stage::Trigger => "trigger",
            Stage::Parameter => "set_parameter",
            Stage::Stop => "stop",
        };
        f.write_str(name)
    }
}

/// Error type for graph construction and lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("graph is {state:?}, {operation} requires {required}")]
    InvalidState {
        state: GraphState,
        operation: &'static str,
        required: &'static str,
    },

    #[error("{0} must be called from the graph's main thread")]
    NotMainThread(&'static str),

    #[error("unknown block {0:?}")]
    InvalidBlock(BlockId),

    #[error("block name '{0}' is already in use")]
    DuplicateName(String),

    #[error("block '{block}' has no {dir} port {port}")]
    InvalidPort {
        block: String,
        dir: PortDir,
        port: usize,
    },

    #[error("input port {port} of block '{block}' is already connected")]
    PortAlreadyConnected { block: String, port: usize },

    #[error("input port {port} of block '{block}' is not connected")]
    NotConnected { block: String, port: usize },

    #[error("connecting '{from}' to '{to}' would create a stream loop")]
    CycleDetected { from: String, to: String },

    #[error("stream topology contains a loop through {0} block(s)")]
    StreamLoop(usize),

    #[error("{count} stream port connection violation(s)")]
    UnconnectedPorts { count: usize },

    #[error("block '{block}': invalid pass-through {input} -> {output}: {reason}")]
    InvalidPassThrough {
        block: String,
        input: usize,
        output: usize,
        reason: &'static str,
    },

    #[error("block '{block}': invalid stream promise: {detail}")]
    InvalidPromise { block: String, detail: String },

    #[error("graph has no thread pool")]
    NoThreadPool,

    #[error("unknown thread pool {0:?}")]
    InvalidPool(PoolId),

    #[error("trigger {0:?} cannot be fired from outside the graph")]
    InvalidTrigger(TriggerId),

    #[error("graph has no source block or source trigger")]
    NoSource,

    #[error("'{0}' is a super block and cannot be used here")]
    SuperBlock(String),

    #[error("block '{block}' failed in {stage}: {source}")]
    Block {
        block: String,
        stage: Stage,
        #[source]
        source: BlockError,
    },

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error("failed to map ring buffer of {len} bytes: {source}")]
    Map {
        len: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to register signal relay: {0}")]
    Signal(#[source] std::io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by block callbacks.
///
/// Returning one from `flow`, `flush` or a trigger callback fails the whole
/// run; from `construct`, `start` or `stop` it moves the graph to `Failed`.
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BlockError {
    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        BlockError::Message(message.into())
    }
}

/// Errors from the parameter model.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("block '{block}' has no parameter '{name}'")]
    Unknown { block: String, name: String },

    #[error("parameter '{0}' is declared twice")]
    Duplicate(String),

    #[error("parameter '{name}' expects {expected:?}[{len}], got {got:?}[{got_len}]")]
    TypeMismatch {
        name: String,
        expected: ParamType,
        len: usize,
        got: ParamType,
        got_len: usize,
    },

    #[error("parameter '{name}' cannot be {operation} (it is a {kind})")]
    WrongKind {
        name: String,
        kind: &'static str,
        operation: &'static str,
    },

    #[error("constants may only be set while the graph is paused")]
    NotPaused,

    #[error("cannot connect '{a}' and '{b}': {reason}")]
    BadConnection {
        a: String,
        b: String,
        reason: &'static str,
    },

    #[error("parameter id {0} is not known to this graph")]
    InvalidId(usize),
}

//! Lifecycle state definitions for graphs and triggers.

/// Graph lifecycle state.
///
/// `Created` → `Paused` ⇄ `Flowing` → `Destroyed`. A graph enters `Failed`
/// when a block's `construct`, `start` or `stop` callback errors; from there
/// only `destroy` is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    /// Built but never run.
    Created,
    /// Stopped between runs; the topology may be edited.
    Paused,
    /// Workers are running.
    Flowing,
    /// A block lifecycle callback failed.
    Failed,
    /// Torn down.
    Destroyed,
}

impl GraphState {
    /// Whether the topology and constants may be edited.
    pub fn is_editable(self) -> bool {
        matches!(self, GraphState::Created | GraphState::Paused)
    }
}

/// Trigger state within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Armed, waiting for its event.
    Waiting,
    /// Sitting in its block's job list.
    Queued,
    /// Disabled for the rest of this run.
    Stopped,
    /// Deregistered permanently.
    Freed,
}

impl TriggerState {
    /// Whether the trigger may still fire in this run.
    pub fn is_live(self) -> bool {
        matches!(self, TriggerState::Waiting | TriggerState::Queued)
    }
}

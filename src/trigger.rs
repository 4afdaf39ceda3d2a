//! Triggers: events bound to block callbacks, and the jobs they queue.

#![forbid(unsafe_code)]

use crate::graph::BlockId;
use crate::parameter::ParamId;
use crate::states::TriggerState;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Handle to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerId(pub usize);

/// Event source of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// Stream readiness; implicit, one per stream block.
    Stream,
    /// An OS signal relayed by the signal thread.
    Signal(i32),
    /// A value arriving at a Setter.
    Parameter(ParamId),
    /// Fired through an [`EventHandle`](crate::rt::EventHandle).
    Event,
}

/// What happens to a trigger after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerAction {
    /// Re-arm.
    #[default]
    Keep,
    /// Disable for the rest of this run.
    Stop,
    /// Deregister for good.
    Free,
}

/// Predicate evaluated before a trigger is queued.
pub type TriggerCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// A declared trigger.
#[derive(Clone)]
pub(crate) struct TriggerSpec {
    pub(crate) block: BlockId,
    pub(crate) kind: TriggerKind,
    pub(crate) is_source: bool,
    pub(crate) check: Option<TriggerCheck>,
    pub(crate) freed: bool,
}

impl std::fmt::Debug for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerSpec")
            .field("block", &self.block)
            .field("kind", &self.kind)
            .field("is_source", &self.is_source)
            .field("check", &self.check.is_some())
            .field("freed", &self.freed)
            .finish()
    }
}

impl TriggerSpec {
    /// Whether the trigger counts as a live source when armed.
    pub(crate) fn arms_source(&self) -> bool {
        self.is_source && !self.freed
    }

    pub(crate) fn passes_check(&self) -> bool {
        self.check.as_ref().map_or(true, |check| check())
    }
}

/// Work queued for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    Stream,
    Trigger(TriggerId),
}

/// Per-block job list and trigger states, guarded by the pool mutex.
#[derive(Debug, Default)]
pub(crate) struct JobList {
    jobs: VecDeque<Job>,
    stream_queued: bool,
    states: HashMap<TriggerId, TriggerState>,
}

impl JobList {
    pub(crate) fn arm(&mut self, trigger: TriggerId) {
        self.states.insert(trigger, TriggerState::Waiting);
    }

    pub(crate) fn state(&self, trigger: TriggerId) -> Option<TriggerState> {
        self.states.get(&trigger).copied()
    }

    /// Queue a job. Returns false when the request coalesces into an
    /// already queued job or the trigger is not armed.
    pub(crate) fn push(&mut self, job: Job) -> bool {
        match job {
            Job::Stream => {
                if self.stream_queued {
                    return false;
                }
                self.stream_queued = true;
                self.jobs.push_back(job);
            }
            Job::Trigger(t) => {
                match self.states.get_mut(&t) {
                    Some(state @ TriggerState::Waiting) => *state = TriggerState::Queued,
                    _ => return false,
                }
                self.jobs.push_front(job);
            }
        }
        true
    }

    /// Take the next job. A popped trigger goes back to Waiting so events
    /// arriving during its callback queue it again.
    pub(crate) fn pop(&mut self) -> Option<Job> {
        let job = self.jobs.pop_front()?;
        match job {
            Job::Stream => self.stream_queued = false,
            Job::Trigger(t) => {
                if let Some(state) = self.states.get_mut(&t) {
                    *state = TriggerState::Waiting;
                }
            }
        }
        Some(job)
    }

    /// Apply a callback outcome. Returns whether the trigger left the live
    /// states, and how many of its queued jobs were dropped.
    pub(crate) fn settle(&mut self, trigger: TriggerId, action: TriggerAction) -> (bool, usize) {
        let next = match action {
            TriggerAction::Keep => return (false, 0),
            TriggerAction::Stop => TriggerState::Stopped,
            TriggerAction::Free => TriggerState::Freed,
        };
        let Some(state) = self.states.get_mut(&trigger) else {
            return (false, 0);
        };
        let was_live = state.is_live();
        *state = next;
        let before = self.jobs.len();
        self.jobs.retain(|j| *j != Job::Trigger(trigger));
        (was_live, before - self.jobs.len())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    pub(crate) fn freed(&self) -> impl Iterator<Item = TriggerId> + '_ {
        self.states
            .iter()
            .filter(|(_, s)| **s == TriggerState::Freed)
            .map(|(t, _)| *t)
    }
}

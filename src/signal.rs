//! Signal relay: a dedicated thread that turns OS signals into trigger jobs.

use crate::error::{Error, Result};
use crate::scheduler::RunState;
use crate::trigger::{TriggerId, TriggerKind};
use signal_hook::iterator::{Handle, Signals};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Relays the signals a run's triggers listen for.
pub(crate) struct SignalRelay {
    handle: Handle,
    thread: JoinHandle<()>,
}

impl SignalRelay {
    /// Start a relay for every armed signal trigger, or `None` if the run
    /// has none.
    pub(crate) fn start(state: &Arc<RunState>) -> Result<Option<Self>> {
        let mut routes: HashMap<i32, Vec<TriggerId>> = HashMap::new();
        for (n, spec) in state.triggers.iter().enumerate() {
            if let Some(spec) = spec.as_ref().filter(|s| !s.freed) {
                if let TriggerKind::Signal(signum) = spec.kind {
                    routes.entry(signum).or_default().push(TriggerId(n));
                }
            }
        }
        if routes.is_empty() {
            return Ok(None);
        }

        let mut signals = Signals::new(routes.keys().copied()).map_err(Error::Signal)?;
        let handle = signals.handle();
        let run = Arc::downgrade(state);
        let thread = std::thread::Builder::new()
            .name(format!("{}-signals", state.config.thread_name))
            .spawn(move || {
                for signum in signals.forever() {
                    let Some(state) = run.upgrade() else { break };
                    tracing::debug!(signum, "relaying signal");
                    for trigger in routes.get(&signum).into_iter().flatten() {
                        state.fire(*trigger);
                    }
                }
            })
            .map_err(Error::Signal)?;
        tracing::debug!("signal relay started");
        Ok(Some(Self { handle, thread }))
    }

    /// Unregister the signals and join the relay thread.
    pub(crate) fn stop(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            tracing::warn!("signal relay thread panicked");
        }
        tracing::debug!("signal relay stopped");
    }
}

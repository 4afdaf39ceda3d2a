//! PPT Invariant System: invariant enforcement with contract tracking.
//!
//! Promise violations and scheduler invariants are fatal. They funnel through
//! [`assert_invariant`], which logs the failure and panics. With the `ppt`
//! feature every passing check is recorded so tests can verify which
//! invariants a scenario actually exercised.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use parking_lot::Mutex;
#[cfg(feature = "ppt")]
use std::collections::HashSet;

pub const GRAPH_LEGALITY: u32 = 1;
pub const GRAPH_REJECTS_INVALID: u32 = 2;
pub const PLAN_SOUNDNESS: u32 = 3;
pub const RING_COHERENT: u32 = 4;
pub const PROMISE_READ: u32 = 5;
pub const PROMISE_WRITE: u32 = 6;
pub const PROMISE_PROGRESS: u32 = 7;
pub const BLOCK_SINGLE_ENTRY: u32 = 8;
pub const TRIGGER_ORDER: u32 = 9;
pub const PARAM_GROUP_VALID: u32 = 10;
pub const RUN_TEARDOWN: u32 = 11;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref INVARIANT_LOG: Mutex<HashSet<u32>> = Mutex::new(HashSet::new());
}

/// Assert an invariant: logs it and panics on failure.
pub fn assert_invariant(id: u32, condition: bool, message: &str, context: Option<&str>) {
    if !condition {
        let full_message = if let Some(ctx) = context {
            format!("Invariant {} failed: {} (context: {})", id, message, ctx)
        } else {
            format!("Invariant {} failed: {}", id, message)
        };
        tracing::error!("{}", full_message);
        panic!("{}", full_message);
    }
    #[cfg(feature = "ppt")]
    INVARIANT_LOG.lock().insert(id);
}

/// Fail an invariant unconditionally.
///
/// Hot paths check the condition themselves and only call this on the
/// violation branch, so passing checks never touch the log mutex.
#[cold]
pub fn invariant_violation(id: u32, message: &str, context: &str) -> ! {
    assert_invariant(id, false, message, Some(context));
    unreachable!("assert_invariant returned on a false condition")
}

#[cfg(feature = "ppt")]
/// Contract test: checks that specified invariants were asserted.
pub fn contract_test(test_name: &str, required_invariants: &[u32]) {
    let log = INVARIANT_LOG.lock();
    let missing: Vec<u32> = required_invariants
        .iter()
        .copied()
        .filter(|inv| !log.contains(inv))
        .collect();
    drop(log);
    if !missing.is_empty() {
        panic!(
            "Contract test '{}' failed: invariants not enforced: {:?}",
            test_name, missing
        );
    }
}

#[cfg(not(feature = "ppt"))]
/// Contract test: no-op when PPT feature is disabled.
pub fn contract_test(_test_name: &str, _required_invariants: &[u32]) {}

#[cfg(feature = "ppt")]
/// Clear invariant log (for between test runs).
pub fn clear_invariant_log() {
    INVARIANT_LOG.lock().clear();
}

#[cfg(not(feature = "ppt"))]
/// Clear invariant log: no-op when PPT feature is disabled.
pub fn clear_invariant_log() {}

// src/runtime/collection.rs
//! Memory accounting and garbage collection at release
//!
//! Runs once per release of a state that goes back to the free list. It
//! refreshes the state's `used` figure, runs a full collection when the
//! location's threshold is exceeded, and folds the change since the last
//! report into the shared monitor.

use crate::runtime::interpreter::Interpreter;
use crate::runtime::monitor::Monitor;
use crate::runtime::pool::PoolConfig;
use crate::runtime::state::State;
use tracing::debug;

pub(crate) fn apply_collection_policy<I: Interpreter>(
    state: &mut State<I>,
    config: &PoolConfig,
    monitor: Option<&Monitor>,
) {
    // Checked states read the allocator's running total. Unchecked states
    // only pay for asking the interpreter when someone needs the figure.
    if state.quota.is_some() || config.gc_threshold.is_some() || monitor.is_some() {
        state.refresh_used();
    }

    if let Some(threshold) = config.gc_threshold {
        if state.used > threshold {
            let before = state.used;
            state.interpreter_mut().collect();
            state.refresh_used();
            debug!(
                "GC state {} before: {} after: {}",
                state.id(),
                before,
                state.used
            );
        }
    }

    if let Some(monitor) = monitor {
        monitor.adjust_memory(state.used as i64 - state.monitored_used as i64);
        state.monitored_used = state.used;
    }
}

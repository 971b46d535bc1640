// src/runtime/executor.rs
//! Protected execution of host work inside an acquired state
//!
//! A failed unit of work never escapes as a panic or an unwinding
//! interpreter error. It becomes [`RESULT_FAILED`], a [`FailureKind`], and,
//! when the location has diagnostics enabled, a copy of the error message.
//! The state is flagged so that its release closes it.

use crate::runtime::interpreter::{FailureKind, Interpreter};
use crate::runtime::pool::Lease;
use crate::runtime::state::State;
use tracing::error;

/// Result code of a failed unit of work
pub const RESULT_FAILED: i64 = -1;

/// Binds one acquired state to one unit of work
///
/// The handle owns its state until it is given back with
/// [`Pool::release`](crate::runtime::pool::Pool::release), which consumes
/// the handle. Dropping it instead closes the state and settles the
/// issuing pool's accounting.
#[must_use = "a handle should be given back to its pool with `release`"]
pub struct RequestHandle<I: Interpreter> {
    state: State<I>,

    lease: Lease,

    /// Capture error messages for the host
    diagnostics: bool,

    failure: Option<FailureKind>,

    diagnostic: Option<String>,
}

impl<I: Interpreter> RequestHandle<I> {
    pub(crate) fn bind(state: State<I>, lease: Lease, diagnostics: bool) -> Self {
        Self {
            state,
            lease,
            diagnostics,
            failure: None,
            diagnostic: None,
        }
    }

    pub(crate) fn lease(&self) -> &Lease {
        &self.lease
    }

    pub(crate) fn into_state(self) -> State<I> {
        let RequestHandle { state, lease, .. } = self;
        lease.settle();
        state
    }

    pub fn state(&self) -> &State<I> {
        &self.state
    }

    /// Run `work` in the bound state and return its result code
    pub fn run(&mut self, work: &I::Work) -> i64 {
        self.failure = None;
        self.diagnostic = None;

        match self.state.interpreter_mut().call(work) {
            Ok(code) => code,
            Err(failure) => {
                // The interpreter's global state may be corrupted
                self.state.request_close();
                self.failure = Some(failure.kind);

                error!(
                    "state {} {} error: {}",
                    self.state.id(),
                    failure.kind,
                    failure.message
                );

                if self.diagnostics {
                    self.diagnostic = capture_diagnostic(&failure.message);
                }
                RESULT_FAILED
            }
        }
    }

    /// Kind of the last failure, if the last run failed
    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    /// Message of the last failure, if captured
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn take_diagnostic(&mut self) -> Option<String> {
        self.diagnostic.take()
    }
}

/// Copy `message` into a buffer sized exactly to it
fn capture_diagnostic(message: &str) -> Option<String> {
    let mut buffer = String::new();
    if let Err(e) = buffer.try_reserve_exact(message.len()) {
        error!("failed to allocate diagnostic: {}", e);
        return None;
    }
    buffer.push_str(message);
    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{Op, ScriptedInterpreter};
    use crate::runtime::pool::{Pool, PoolConfig};
    use crate::runtime::state::Phase;

    fn pool(config: PoolConfig) -> Pool<ScriptedInterpreter> {
        Pool::new("test", config, None)
    }

    #[test]
    fn test_successful_run() {
        let mut pool = pool(PoolConfig::default());
        let mut handle = pool.acquire().unwrap();

        assert_eq!(handle.run(&vec![Op::Alloc(16), Op::Return(200)]), 200);
        assert_eq!(handle.failure(), None);
        assert_eq!(handle.diagnostic(), None);
        assert!(!handle.state().close_requested());
        assert_eq!(handle.state().phase(), Phase::InUse);
    }

    #[test]
    fn test_failed_run_flags_state() {
        let mut pool = pool(PoolConfig::default());
        let mut handle = pool.acquire().unwrap();

        assert_eq!(handle.run(&vec![Op::Fail("boom")]), RESULT_FAILED);
        assert_eq!(handle.failure(), Some(FailureKind::Runtime));
        assert!(handle.state().close_requested());
        // diagnostics disabled
        assert_eq!(handle.diagnostic(), None);
    }

    #[test]
    fn test_diagnostic_captured_when_enabled() {
        let mut pool = pool(PoolConfig {
            diagnostics: true,
            ..Default::default()
        });
        let mut handle = pool.acquire().unwrap();

        handle.run(&vec![Op::Fail("attempt to index a nil value")]);
        assert_eq!(handle.diagnostic(), Some("attempt to index a nil value"));

        let diagnostic = handle.take_diagnostic().unwrap();
        assert_eq!(diagnostic.capacity(), diagnostic.len());
        assert_eq!(handle.diagnostic(), None);
    }

    #[test]
    fn test_success_clears_previous_failure() {
        let mut pool = pool(PoolConfig {
            diagnostics: true,
            ..Default::default()
        });
        let mut handle = pool.acquire().unwrap();

        handle.run(&vec![Op::Fail("first")]);
        assert_eq!(handle.run(&vec![Op::Return(1)]), 1);
        assert_eq!(handle.failure(), None);
        assert_eq!(handle.diagnostic(), None);
        // the flag is sticky
        assert!(handle.state().close_requested());
    }

    #[test]
    fn test_quota_exhaustion_closes_state() {
        let mut pool = pool(PoolConfig {
            quota: Some(1000),
            diagnostics: true,
            ..Default::default()
        });
        let mut handle = pool.acquire().unwrap();
        let id = handle.state().id();

        let code = handle.run(&vec![Op::Alloc(1000), Op::Alloc(1), Op::Return(0)]);
        assert_eq!(code, RESULT_FAILED);
        assert_eq!(handle.failure(), Some(FailureKind::OutOfMemory));
        assert_eq!(handle.diagnostic(), Some("not enough memory"));
        assert!(handle.state().close_requested());
        assert_eq!(handle.state().interpreter().allocated(), Some(1000));

        pool.release(handle);
        assert_eq!(pool.stats().live, 0);
        assert_eq!(pool.stats().idle, 0);

        let handle = pool.acquire().unwrap();
        assert_ne!(handle.state().id(), id);
    }

    #[test]
    fn test_capture_diagnostic_is_exact() {
        let diagnostic = capture_diagnostic("error at line 3").unwrap();
        assert_eq!(diagnostic, "error at line 3");
        assert_eq!(diagnostic.capacity(), "error at line 3".len());
    }
}

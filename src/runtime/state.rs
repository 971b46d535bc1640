// src/runtime/state.rs
//! Pooled interpreter state
//!
//! A [`State`] is one interpreter instance plus the bookkeeping the pool
//! needs to decide when to reuse it and when to close it:
//!
//! ```text
//! CREATING ──► IN_USE ◄──► IDLE
//!                 │          │
//!                 └─► CLOSING ◄┘ ──► (dropped)
//! ```
//!
//! The phase only changes through the pool; hosts see a state through a
//! [`RequestHandle`](crate::runtime::executor::RequestHandle).

use crate::runtime::interpreter::Interpreter;
use std::fmt;
use tokio::time::Instant;

/// Identifier of a state, unique within its pool
pub type StateId = u64;

/// Lifecycle phase of a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// On the pool's free list
    Idle,

    /// Bound to a request handle
    InUse,

    /// Being destroyed
    Closing,
}

/// Why a state was destroyed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A unit of work failed in it
    Failed,

    /// Its timer fired while it was idle
    Expired,

    /// Its timer fired while it was in use
    ExpiredInUse,

    /// It served the configured number of requests
    RequestLimit,

    /// The host gave up on it
    Discarded,

    /// The pool is shutting down
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::Failed => "failed",
            CloseReason::Expired => "expired",
            CloseReason::ExpiredInUse => "expired in use",
            CloseReason::RequestLimit => "request limit",
            CloseReason::Discarded => "discarded",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

/// One pooled interpreter instance
pub struct State<I: Interpreter> {
    id: StateId,

    interpreter: I,

    /// Memory quota in bytes, `None` when unchecked
    pub(crate) quota: Option<usize>,

    /// Live bytes as last observed
    pub(crate) used: usize,

    /// Bytes last folded into the monitor
    pub(crate) monitored_used: usize,

    /// End of the absolute lifetime, `None` for unlimited
    pub(crate) expiry_absolute: Option<Instant>,

    /// End of the current idle period, `None` while in use or unlimited
    pub(crate) expiry_idle: Option<Instant>,

    /// Units of work completed
    pub(crate) request_count: u64,

    pub(crate) phase: Phase,

    /// Set when a unit of work failed; honored at release
    pub(crate) close_requested: bool,

    created_at: Instant,
}

impl<I: Interpreter> State<I> {
    pub(crate) fn new(
        id: StateId,
        interpreter: I,
        quota: Option<usize>,
        expiry_absolute: Option<Instant>,
        created_at: Instant,
    ) -> Self {
        let used = interpreter.allocated().unwrap_or(0);
        Self {
            id,
            interpreter,
            quota,
            used,
            monitored_used: 0,
            expiry_absolute,
            expiry_idle: None,
            request_count: 0,
            phase: Phase::InUse,
            close_requested: false,
            created_at,
        }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn quota(&self) -> Option<usize> {
        self.quota
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn monitored_used(&self) -> usize {
        self.monitored_used
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Timer deadline: the earlier of the idle and absolute expiries
    pub fn deadline(&self) -> Option<Instant> {
        match (self.expiry_idle, self.expiry_absolute) {
            (Some(idle), Some(absolute)) => Some(idle.min(absolute)),
            (idle, absolute) => idle.or(absolute),
        }
    }

    /// Re-read `used` from whichever accounting applies
    pub(crate) fn refresh_used(&mut self) {
        self.used = match self.quota {
            Some(_) => self.interpreter.allocated().unwrap_or(self.used),
            None => self.interpreter.memory_usage(),
        };
    }

    pub(crate) fn request_close(&mut self) {
        self.close_requested = true;
    }

    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    pub(crate) fn interpreter_mut(&mut self) -> &mut I {
        &mut self.interpreter
    }
}

impl<I: Interpreter> fmt::Debug for State<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("quota", &self.quota)
            .field("used", &self.used)
            .field("monitored_used", &self.monitored_used)
            .field("request_count", &self.request_count)
            .field("close_requested", &self.close_requested)
            .finish()
    }
}

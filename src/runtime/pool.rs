// src/runtime/pool.rs
//! Per-location pool of reusable interpreter states
//!
//! Each worker owns one pool per location. Creating an interpreter is
//! expensive, so states are kept on a free list and handed out again.
//!
//! # Architecture
//!
//! ```text
//! Pool
//! ├─ Idle:   [S7, S3, S5]   (most recently released first)
//! ├─ In use: owned by RequestHandles
//! └─ Timers: S3 @ t+5s, S5 @ t+1s, S9 @ fired (in use)
//! ```
//!
//! A pool is owned by a single worker and never shared between threads,
//! so nothing in here locks. Only the optional [`Monitor`] is shared.
//!
//! Every handed-out state carries a [`Lease`] on its pool's ledger. A
//! handle dropped without being released settles its lease on drop, so the
//! live count and the monitor never drift.

use crate::runtime::allocator::{CheckedAllocator, UncheckedAllocator};
use crate::runtime::collection::apply_collection_policy;
use crate::runtime::executor::RequestHandle;
use crate::runtime::interpreter::{InitOptions, Interpreter};
use crate::runtime::monitor::Monitor;
use crate::runtime::state::{CloseReason, Phase, State, StateId};
use crate::runtime::timer::EvictionTimers;
use crate::utils::config::LocationConfig;
use crate::utils::errors::Result;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Limits of one location's pool. `None` disables a limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolConfig {
    /// Memory quota per state in bytes
    pub quota: Option<usize>,

    /// Idle time before an unused state is closed
    pub idle_timeout: Option<Duration>,

    /// Absolute lifetime of a state
    pub max_lifetime: Option<Duration>,

    /// Requests served before a state is closed
    pub max_requests: Option<u64>,

    /// Memory use above which a full collection runs on release
    pub gc_threshold: Option<usize>,

    /// Capture error messages for the host
    pub diagnostics: bool,

    pub path: String,

    pub cpath: String,
}

fn limit(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

impl From<&LocationConfig> for PoolConfig {
    fn from(location: &LocationConfig) -> Self {
        Self {
            quota: limit(location.memory_max).map(|bytes| bytes as usize),
            idle_timeout: limit(location.idle_timeout_ms).map(Duration::from_millis),
            max_lifetime: limit(location.max_lifetime_ms).map(Duration::from_millis),
            max_requests: limit(location.max_requests),
            gc_threshold: limit(location.gc_threshold).map(|bytes| bytes as usize),
            diagnostics: location.diagnostic,
            path: location.path.clone(),
            cpath: location.cpath.clone(),
        }
    }
}

/// Pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// States created and not yet destroyed
    pub live: usize,

    pub idle: usize,

    pub in_use: usize,
}

/// Accounting shared between a pool and its outstanding leases
#[derive(Debug, Default)]
pub(crate) struct PoolShared {
    /// States created and not yet destroyed, idle or in use
    live: Cell<usize>,

    /// States whose handle was dropped unreleased; their timers still need
    /// cancelling
    abandoned: RefCell<Vec<StateId>>,

    monitor: Option<Arc<Monitor>>,
}

impl PoolShared {
    fn state_closed(&self, monitored_used: usize) {
        self.live.set(self.live.get().saturating_sub(1));
        if let Some(monitor) = &self.monitor {
            monitor.state_closed(monitored_used);
        }
    }
}

/// Claim of one in-use state on the pool it came from
#[derive(Debug)]
pub(crate) struct Lease {
    pool: Rc<PoolShared>,
    id: StateId,
    monitored_used: usize,
    settled: bool,
}

impl Lease {
    /// Whether this lease was issued by the pool owning `pool`
    pub(crate) fn is_from(&self, pool: &Rc<PoolShared>) -> bool {
        Rc::ptr_eq(&self.pool, pool)
    }

    /// The state went back through its pool; nothing left to account for
    pub(crate) fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        warn!("state {} dropped without release, closing it", self.id);
        self.pool.state_closed(self.monitored_used);
        self.pool.abandoned.borrow_mut().push(self.id);
    }
}

pub struct Pool<I: Interpreter> {
    /// Location name, used in logs
    name: String,

    config: PoolConfig,

    /// Free list; the front is the most recently released state
    idle: VecDeque<State<I>>,

    timers: EvictionTimers,

    next_id: StateId,

    shared: Rc<PoolShared>,
}

impl<I: Interpreter> Pool<I> {
    pub fn new(name: impl Into<String>, config: PoolConfig, monitor: Option<Arc<Monitor>>) -> Self {
        Self {
            name: name.into(),
            config,
            idle: VecDeque::new(),
            timers: EvictionTimers::new(),
            next_id: 1,
            shared: Rc::new(PoolShared {
                monitor,
                ..Default::default()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Take the most recently released state, or create one
    pub fn acquire(&mut self) -> Result<RequestHandle<I>> {
        self.reap_abandoned();

        let mut state = match self.idle.pop_front() {
            Some(mut state) => {
                if self.config.idle_timeout.is_some() {
                    // Only the absolute lifetime runs while in use
                    state.expiry_idle = None;
                    self.timers.arm(state.id(), state.deadline());
                }
                debug!("[{}] reusing state {}", self.name, state.id());
                state
            }
            None => self.create_state()?,
        };

        state.phase = Phase::InUse;
        let lease = Lease {
            pool: Rc::clone(&self.shared),
            id: state.id(),
            monitored_used: state.monitored_used,
            settled: false,
        };
        Ok(RequestHandle::bind(state, lease, self.config.diagnostics))
    }

    /// Give a state back after its unit of work
    ///
    /// The state is closed if its work failed, its timer fired while it was
    /// in use, or it reached the request limit. Otherwise it goes through
    /// the collection policy and back to the front of the free list.
    ///
    /// A handle acquired from another pool is refused: it is dropped, which
    /// closes its state against the pool that issued it.
    pub fn release(&mut self, handle: RequestHandle<I>) {
        let Some(mut state) = self.take_back(handle) else {
            return;
        };

        state.request_count += 1;
        if let Some(monitor) = &self.shared.monitor {
            monitor.record_request();
        }

        let fired = self.timers.take_fired(state.id());
        let reason = if state.close_requested {
            Some(CloseReason::Failed)
        } else if fired {
            Some(CloseReason::ExpiredInUse)
        } else if self
            .config
            .max_requests
            .is_some_and(|max| state.request_count >= max)
        {
            Some(CloseReason::RequestLimit)
        } else {
            None
        };

        if let Some(reason) = reason {
            self.destroy(state, reason);
            return;
        }

        apply_collection_policy(&mut state, &self.config, self.shared.monitor.as_deref());

        if let Some(idle_timeout) = self.config.idle_timeout {
            state.expiry_idle = Some(Instant::now() + idle_timeout);
            self.timers.arm(state.id(), state.deadline());
        }

        state.phase = Phase::Idle;
        debug!("[{}] state {} released", self.name, state.id());
        self.idle.push_front(state);
    }

    /// Close a state without returning it to the free list
    ///
    /// For hosts that abandon a request midway. The request is not counted.
    pub fn discard(&mut self, handle: RequestHandle<I>) {
        if let Some(state) = self.take_back(handle) {
            self.destroy(state, CloseReason::Discarded);
        }
    }

    /// Recover the state of a handle issued by this pool
    fn take_back(&mut self, handle: RequestHandle<I>) -> Option<State<I>> {
        self.reap_abandoned();
        if !handle.lease().is_from(&self.shared) {
            error!(
                "[{}] refusing state {} acquired from another pool",
                self.name,
                handle.state().id()
            );
            return None;
        }
        Some(handle.into_state())
    }

    /// Cancel the timers of states whose handles were dropped
    fn reap_abandoned(&mut self) {
        for id in self.shared.abandoned.borrow_mut().drain(..) {
            self.timers.cancel(id);
        }
    }

    /// Fire every timer due at `now`
    ///
    /// Idle states are closed right away; states in use are closed when
    /// released. Returns the number of states closed.
    pub fn expire(&mut self, now: Instant) -> usize {
        self.reap_abandoned();

        let mut closed = 0;
        for id in self.timers.expire(now) {
            let position = self.idle.iter().position(|state| state.id() == id);
            match position.and_then(|index| self.idle.remove(index)) {
                Some(state) => {
                    self.destroy(state, CloseReason::Expired);
                    closed += 1;
                }
                None => debug!(
                    "[{}] state {} expired while in use, closing at release",
                    self.name, id
                ),
            }
        }
        closed
    }

    /// Earliest armed timer. May still report the timer of an abandoned
    /// state until the next `expire` reaps it.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Close every idle state. Returns the number closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        while let Some(state) = self.idle.pop_front() {
            self.destroy(state, CloseReason::Shutdown);
            closed += 1;
        }
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let live = self.shared.live.get();
        PoolStats {
            live,
            idle: self.idle.len(),
            in_use: live.saturating_sub(self.idle.len()),
        }
    }

    fn create_state(&mut self) -> Result<State<I>> {
        let options = InitOptions::new(&self.config.path, &self.config.cpath);
        let created = match self.config.quota {
            Some(quota) => I::create(CheckedAllocator::new(quota), &options),
            None => I::create(UncheckedAllocator, &options),
        };
        let interpreter = created.map_err(|e| {
            error!("[{}] failed to create state: {}", self.name, e);
            e
        })?;

        let now = Instant::now();
        let id = self.next_id;
        self.next_id += 1;

        let state = State::new(
            id,
            interpreter,
            self.config.quota,
            self.config.max_lifetime.map(|lifetime| now + lifetime),
            now,
        );
        self.timers.arm(id, state.deadline());

        self.shared.live.set(self.shared.live.get() + 1);
        if let Some(monitor) = &self.shared.monitor {
            monitor.state_created();
        }

        info!(
            "[{}] state {} created ({} bytes)",
            self.name,
            id,
            state.used()
        );
        Ok(state)
    }

    fn destroy(&mut self, mut state: State<I>, reason: CloseReason) {
        self.timers.cancel(state.id());
        state.phase = Phase::Closing;

        info!(
            "[{}] closing state {} ({}) after {} requests",
            self.name,
            state.id(),
            reason,
            state.request_count()
        );

        let monitored_used = state.monitored_used;
        drop(state);

        self.shared.state_closed(monitored_used);
    }
}

impl<I: Interpreter> Drop for Pool<I> {
    fn drop(&mut self) {
        self.close_all();
    }
}

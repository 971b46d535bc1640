// src/runtime/timer.rs
//! Eviction timers for pooled states
//!
//! One registration per state, keyed by state id. A registration is either
//! armed with a deadline or has fired. Firing never touches the state
//! itself: the pool closes idle states right away, while a state that is in
//! use keeps its `Fired` tag until its release observes it.
//!
//! ```text
//!   arm ──► Armed(deadline) ──expire──► Fired ──take_fired──► (gone)
//!              │    ▲                      │
//!              └arm─┘                      └──cancel──► (gone)
//! ```

use crate::runtime::state::StateId;
use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Registration {
    Armed(Instant),
    Fired,
}

/// Per-pool timer registry
#[derive(Debug, Default)]
pub struct EvictionTimers {
    /// Armed deadlines in firing order
    queue: BTreeSet<(Instant, StateId)>,

    registrations: HashMap<StateId, Registration>,
}

impl EvictionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)arm the timer of `id`. Any previous registration is cancelled
    /// first; an infinite deadline leaves the state without a timer.
    pub fn arm(&mut self, id: StateId, deadline: Option<Instant>) {
        self.cancel(id);
        if let Some(deadline) = deadline {
            self.queue.insert((deadline, id));
            self.registrations.insert(id, Registration::Armed(deadline));
        }
    }

    /// Drop the registration of `id`, armed or fired
    pub fn cancel(&mut self, id: StateId) {
        if let Some(Registration::Armed(deadline)) = self.registrations.remove(&id) {
            self.queue.remove(&(deadline, id));
        }
    }

    pub fn is_armed(&self, id: StateId) -> bool {
        matches!(self.registrations.get(&id), Some(Registration::Armed(_)))
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.first().map(|(deadline, _)| *deadline)
    }

    /// Fire every timer due at `now`, returning the ids in deadline order
    pub fn expire(&mut self, now: Instant) -> Vec<StateId> {
        let mut fired = Vec::new();
        while let Some(&(deadline, id)) = self.queue.first() {
            if deadline > now {
                break;
            }
            self.queue.pop_first();
            self.registrations.insert(id, Registration::Fired);
            fired.push(id);
        }
        fired
    }

    /// Whether the timer of `id` fired since it was last armed. Consumes the
    /// fired tag.
    pub fn take_fired(&mut self, id: StateId) -> bool {
        if self.registrations.get(&id) == Some(&Registration::Fired) {
            self.registrations.remove(&id);
            true
        } else {
            false
        }
    }

    /// Number of registrations, armed or fired
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

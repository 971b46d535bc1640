// src/runtime/monitor.rs
//! Process-wide usage counters shared by all workers
//!
//! Every update is a single relaxed fetch-and-add, so workers never
//! coordinate and updates commute. The aggregate is for observability only;
//! nothing in the pool reads it to make a decision.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Aggregate counters across all pools and workers
#[derive(Debug, Default)]
pub struct Monitor {
    /// Live interpreter states
    states: AtomicI64,

    /// Memory last reported by each live state, summed
    memory_used: AtomicI64,

    /// Units of work completed
    requests: AtomicU64,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A state was created
    pub fn state_created(&self) {
        self.states.fetch_add(1, Ordering::Relaxed);
    }

    /// A state was destroyed; withdraw what it last reported
    pub fn state_closed(&self, monitored_used: usize) {
        self.states.fetch_sub(1, Ordering::Relaxed);
        self.memory_used
            .fetch_sub(monitored_used as i64, Ordering::Relaxed);
    }

    /// Fold a change in a state's memory use into the aggregate
    pub fn adjust_memory(&self, delta: i64) {
        if delta != 0 {
            self.memory_used.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            states: self.states.load(Ordering::Relaxed),
            memory_used: self.memory_used.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the monitor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSnapshot {
    pub states: i64,
    pub memory_used: i64,
    pub requests: u64,
}

// src/runtime/mod.rs
//! Interpreter state pooling runtime
//!
//! This module provides the pieces that keep embedded interpreter states
//! alive between requests:
//!
//! - **Allocator**: per-state memory accounting and quota enforcement
//! - **Interpreter**: the boundary to the embedded engine (Lua 5.4 backend)
//! - **Pool**: LIFO free list with idle, lifetime and request-count eviction
//! - **Executor**: protected execution with diagnostics
//! - **Collection**: GC threshold policy and usage reporting at release
//! - **Monitor**: process-wide atomic counters
//! - **Worker**: threads owning one pool per location
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     WorkerGroup                      │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐      │
//! │  │ Worker 0   │  │ Worker 1   │  │ Worker 2   │ ...  │
//! │  │ Pool "api" │  │ Pool "api" │  │ Pool "api" │      │
//! │  │ Pool "adm" │  │ Pool "adm" │  │ Pool "adm" │      │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘      │
//! │        └───────────────┼───────────────┘             │
//! │                        ▼                             │
//! │              Monitor (atomic counters)               │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod allocator;
mod collection;
pub mod executor;
pub mod interpreter;
#[cfg(feature = "lua")]
pub mod lua;
#[cfg(test)]
pub(crate) mod mock;
pub mod monitor;
pub mod pool;
pub mod state;
pub mod timer;
pub mod worker;

// Re-export commonly used types
pub use allocator::{AllocError, Allocator, CheckedAllocator, UncheckedAllocator};
pub use executor::{RequestHandle, RESULT_FAILED};
pub use interpreter::{CallFailure, FailureKind, InitOptions, Interpreter, SearchPath};
#[cfg(feature = "lua")]
pub use lua::{Chunk, LuaInterpreter};
pub use monitor::{Monitor, MonitorSnapshot};
pub use pool::{Pool, PoolConfig, PoolStats};
pub use state::{CloseReason, Phase, State, StateId};
pub use worker::{Completion, WorkerGroup};

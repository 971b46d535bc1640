// src/lib.rs
//! Lua State Pool Library
//!
//! Keeps embedded Lua interpreter states alive between requests so that a
//! host can run short units of work without paying for interpreter
//! creation each time.
//!
//! # Architecture
//!
//! The library is structured into a few modules:
//!
//! - **runtime**: allocator guard, pool, eviction timers, executor, monitor, workers
//! - **observability**: logging and Prometheus export
//! - **utils**: configuration and error types
//!
//! # Example
//!
//! ```no_run
//! use lua_state_pool::runtime::{Chunk, LuaInterpreter, Pool, PoolConfig};
//!
//! let mut pool: Pool<LuaInterpreter> = Pool::new("api", PoolConfig::default(), None);
//! let mut handle = pool.acquire()?;
//! let code = handle.run(&Chunk::new("=handler", "return 200")?);
//! pool.release(handle);
//! assert_eq!(code, 200);
//! # Ok::<(), lua_state_pool::PoolError>(())
//! ```

// Public module exports
pub mod observability;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use runtime::monitor::{Monitor, MonitorSnapshot};
pub use runtime::pool::{Pool, PoolConfig};
pub use runtime::worker::{Completion, WorkerGroup};
pub use utils::config::Settings;
pub use utils::errors::{PoolError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

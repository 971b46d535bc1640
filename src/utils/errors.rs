// src/utils/errors.rs
//! Error types for state creation, pool access and configuration
//!
//! Execution failures inside a state are not errors at this level: they are
//! reported as a sentinel result code plus an optional diagnostic (see
//! [`crate::runtime::executor`]).

use thiserror::Error;

/// Errors surfaced to the host on the acquire and configuration paths
#[derive(Debug, Error)]
pub enum PoolError {
    /// The interpreter could not allocate its initial state
    #[error("failed to allocate interpreter state")]
    OutOfMemory,

    /// The bootstrap of a freshly created state raised an error
    #[error("failed to initialize interpreter state: {0}")]
    InitializationFailed(String),

    /// A chunk name cannot be passed to the interpreter
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    /// No pool is configured under the requested location
    #[error("unknown location: {0}")]
    UnknownLocation(String),

    /// The worker owning the pool has stopped
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for PoolError {
    fn from(err: config::ConfigError) -> Self {
        PoolError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

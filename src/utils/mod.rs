// src/utils/mod.rs
//! Shared configuration and error types

pub mod config;
pub mod errors;

pub use self::config::{LocationConfig, LogFormat, Settings};
pub use self::errors::{PoolError, Result};

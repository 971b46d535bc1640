// src/runtime/interpreter.rs
//! Boundary between the pool and the embedded interpreter
//!
//! The pool treats the interpreter as an opaque engine. It needs to create
//! one with a chosen allocator, run a unit of work in protected mode, ask
//! how much memory it holds, trigger a collection, and destroy it (drop).

use crate::runtime::allocator::Allocator;
use crate::utils::errors::Result;
use serde::Serialize;
use std::fmt;

/// Separator between entries of a search path
pub const PATH_SEPARATOR: char = ';';

/// How a configured search path string modifies the interpreter default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPath<'a> {
    /// Empty string: keep the default
    Default,

    /// Leading `+`: append the remainder to the default
    Append(&'a str),

    /// Anything else: replace the default
    Replace(&'a str),
}

impl<'a> SearchPath<'a> {
    pub fn parse(configured: &'a str) -> Self {
        if configured.is_empty() {
            SearchPath::Default
        } else if let Some(suffix) = configured.strip_prefix('+') {
            SearchPath::Append(suffix)
        } else {
            SearchPath::Replace(configured)
        }
    }

    /// Resulting path given the interpreter's default
    pub fn apply(&self, default: &str) -> String {
        match self {
            SearchPath::Default => default.to_string(),
            SearchPath::Append(suffix) => format!("{}{}{}", default, PATH_SEPARATOR, suffix),
            SearchPath::Replace(path) => path.to_string(),
        }
    }
}

/// Bootstrap options for a new interpreter state
#[derive(Debug, Clone, Copy)]
pub struct InitOptions<'a> {
    /// Script search path
    pub path: SearchPath<'a>,

    /// Native module search path
    pub cpath: SearchPath<'a>,
}

impl<'a> InitOptions<'a> {
    pub fn new(path: &'a str, cpath: &'a str) -> Self {
        Self {
            path: SearchPath::parse(path),
            cpath: SearchPath::parse(cpath),
        }
    }
}

/// Classification of a failed protected call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Error raised while running
    Runtime,

    /// Allocation refused, including quota violations
    OutOfMemory,

    /// The work could not be compiled
    Syntax,

    /// The error handler itself failed
    Handler,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Runtime => "runtime",
            FailureKind::OutOfMemory => "memory",
            FailureKind::Syntax => "syntax",
            FailureKind::Handler => "error handler",
        };
        f.write_str(name)
    }
}

/// A failed protected call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// An embedded interpreter instance
pub trait Interpreter: Sized {
    /// Unit of work accepted by [`Interpreter::call`]
    type Work: ?Sized;

    /// Create and bootstrap an instance whose every allocation goes through
    /// `allocator`. On error nothing is left behind.
    fn create<A: Allocator + 'static>(allocator: A, options: &InitOptions<'_>) -> Result<Self>;

    /// Run `work` in protected mode and return its integer result.
    ///
    /// Whatever the outcome, the instance's stack is left as it was found.
    fn call(&mut self, work: &Self::Work) -> std::result::Result<i64, CallFailure>;

    /// Bytes tracked by the allocator, `None` for an unchecked allocator
    fn allocated(&self) -> Option<usize>;

    /// Bytes in use according to the interpreter's own accounting
    fn memory_usage(&self) -> usize;

    /// Run a full garbage collection cycle
    fn collect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT: &str = "/usr/local/share/lua/5.4/?.lua;./?.lua";

    #[test]
    fn test_parse() {
        assert_eq!(SearchPath::parse(""), SearchPath::Default);
        assert_eq!(SearchPath::parse("+/extra/?.lua"), SearchPath::Append("/extra/?.lua"));
        assert_eq!(SearchPath::parse("/only/?.lua"), SearchPath::Replace("/only/?.lua"));
    }

    #[test]
    fn test_append_to_default() {
        let path = SearchPath::parse("+/extra/?.lua").apply(DEFAULT);
        assert_eq!(path, format!("{};/extra/?.lua", DEFAULT));
    }

    #[test]
    fn test_replace_default() {
        assert_eq!(SearchPath::parse("/only/?.lua").apply(DEFAULT), "/only/?.lua");
    }

    #[test]
    fn test_empty_keeps_default() {
        assert_eq!(SearchPath::parse("").apply(DEFAULT), DEFAULT);
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::OutOfMemory.to_string(), "memory");
        assert_eq!(FailureKind::Runtime.to_string(), "runtime");
    }
}

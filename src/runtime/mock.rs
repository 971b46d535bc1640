// src/runtime/mock.rs
//! Scripted interpreter for tests
//!
//! Work is a list of [`Op`]s. Every allocation goes through the allocator
//! the pool handed in, so quota behavior is the real one.

use crate::runtime::allocator::Allocator;
use crate::runtime::interpreter::{CallFailure, FailureKind, InitOptions, Interpreter};
use crate::utils::errors::{PoolError, Result};
use std::cell::RefCell;
use std::ptr::NonNull;

/// Default search path reported by scripted states
pub const DEFAULT_PATH: &str = "/usr/share/lua/?.lua;./?.lua";

thread_local! {
    static CREATE_FAILURE: RefCell<Option<PoolError>> = const { RefCell::new(None) };
}

/// Make the next `create` on this thread fail with `error`
pub fn fail_next_create(error: PoolError) {
    CREATE_FAILURE.with(|failure| *failure.borrow_mut() = Some(error));
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Allocate a block that stays reachable
    Alloc(usize),

    /// Allocate a block that the next collection frees
    Garbage(usize),

    /// Free every reachable block
    FreeAll,

    /// Raise a runtime error
    Fail(&'static str),

    /// Stop with a result code
    Return(i64),
}

pub struct ScriptedInterpreter {
    allocator: Box<dyn Allocator>,
    reachable: Vec<(NonNull<u8>, usize)>,
    garbage: Vec<(NonNull<u8>, usize)>,
    path: String,
    cpath: String,
    collections: usize,
}

impl ScriptedInterpreter {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn cpath(&self) -> &str {
        &self.cpath
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    fn allocate(&mut self, size: usize) -> std::result::Result<(NonNull<u8>, usize), CallFailure> {
        match unsafe { self.allocator.realloc(std::ptr::null_mut(), 0, size) } {
            Ok(Some(block)) => Ok((block, size)),
            Ok(None) | Err(_) => Err(CallFailure {
                kind: FailureKind::OutOfMemory,
                message: "not enough memory".to_string(),
            }),
        }
    }

    fn free(allocator: &dyn Allocator, blocks: &mut Vec<(NonNull<u8>, usize)>) {
        for (block, size) in blocks.drain(..) {
            unsafe {
                let _ = allocator.realloc(block.as_ptr(), size, 0);
            }
        }
    }
}

impl Interpreter for ScriptedInterpreter {
    type Work = Vec<Op>;

    fn create<A: Allocator + 'static>(allocator: A, options: &InitOptions<'_>) -> Result<Self> {
        if let Some(error) = CREATE_FAILURE.with(|failure| failure.borrow_mut().take()) {
            return Err(error);
        }
        Ok(Self {
            allocator: Box::new(allocator),
            reachable: Vec::new(),
            garbage: Vec::new(),
            path: options.path.apply(DEFAULT_PATH),
            cpath: options.cpath.apply(""),
            collections: 0,
        })
    }

    fn call(&mut self, work: &Vec<Op>) -> std::result::Result<i64, CallFailure> {
        for op in work {
            match op {
                Op::Alloc(size) => {
                    let block = self.allocate(*size)?;
                    self.reachable.push(block);
                }
                Op::Garbage(size) => {
                    let block = self.allocate(*size)?;
                    self.garbage.push(block);
                }
                Op::FreeAll => Self::free(self.allocator.as_ref(), &mut self.reachable),
                Op::Fail(message) => {
                    return Err(CallFailure {
                        kind: FailureKind::Runtime,
                        message: message.to_string(),
                    })
                }
                Op::Return(code) => return Ok(*code),
            }
        }
        Ok(0)
    }

    fn allocated(&self) -> Option<usize> {
        self.allocator.used()
    }

    fn memory_usage(&self) -> usize {
        self.reachable
            .iter()
            .chain(self.garbage.iter())
            .map(|(_, size)| size)
            .sum()
    }

    fn collect(&mut self) {
        self.collections += 1;
        Self::free(self.allocator.as_ref(), &mut self.garbage);
    }
}

impl Drop for ScriptedInterpreter {
    fn drop(&mut self) {
        Self::free(self.allocator.as_ref(), &mut self.reachable);
        Self::free(self.allocator.as_ref(), &mut self.garbage);
    }
}

// src/runtime/allocator.rs
//! Allocation guard for interpreter states
//!
//! Every allocation an interpreter makes goes through a realloc-style
//! function bound to its state. Two implementations exist:
//!
//! - [`UncheckedAllocator`]: plain pass-through, no bookkeeping
//! - [`CheckedAllocator`]: tracks live bytes and refuses anything that would
//!   push them over a fixed quota
//!
//! The choice is made once, when the state is created. The allocation path
//! itself never asks whether a quota is configured.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::ptr::NonNull;
use thiserror::Error;

/// Alignment of every block handed out, matching what `malloc` guarantees
pub const MIN_ALIGN: usize = 16;

/// Why an allocation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("allocation of {requested} bytes exceeds quota ({used} of {quota} bytes in use)")]
    QuotaExceeded {
        used: usize,
        requested: usize,
        quota: usize,
    },

    #[error("out of memory")]
    OutOfMemory,
}

/// Realloc-style allocator bound to one interpreter state
///
/// Methods take `&self` because the interpreter calls back into the
/// allocator while the owning state may be observing it.
pub trait Allocator {
    /// Resize the block at `ptr` from `old_size` to `new_size` bytes.
    ///
    /// - `new_size == 0` frees the block and returns `Ok(None)`.
    /// - A null `ptr` allocates a fresh block; `old_size` must then be 0.
    /// - On error the original block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block previously returned by this
    /// allocator with exactly `old_size` bytes.
    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Live bytes tracked by this allocator, `None` if it does not count
    fn used(&self) -> Option<usize>;
}

/// Pass-through allocator used when no quota is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct UncheckedAllocator;

impl Allocator for UncheckedAllocator {
    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        if new_size == 0 {
            free_block(ptr, old_size);
            return Ok(None);
        }
        resize_block(ptr, old_size, new_size)
            .map(Some)
            .ok_or(AllocError::OutOfMemory)
    }

    fn used(&self) -> Option<usize> {
        None
    }
}

/// Quota-enforcing allocator
///
/// `used` never exceeds `quota`: a request that would cross it fails before
/// the underlying block is touched.
#[derive(Debug)]
pub struct CheckedAllocator {
    quota: usize,
    used: Cell<usize>,
}

impl CheckedAllocator {
    pub fn new(quota: usize) -> Self {
        Self {
            quota,
            used: Cell::new(0),
        }
    }

    pub fn quota(&self) -> usize {
        self.quota
    }
}

impl Allocator for CheckedAllocator {
    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let used = self.used.get();

        if new_size == 0 {
            free_block(ptr, old_size);
            self.used.set(used.saturating_sub(old_size));
            return Ok(None);
        }

        // Shrinking can never fail here: candidate <= used <= quota
        let candidate = used.saturating_sub(old_size).saturating_add(new_size);
        if candidate > self.quota {
            return Err(AllocError::QuotaExceeded {
                used,
                requested: new_size,
                quota: self.quota,
            });
        }

        let block = resize_block(ptr, old_size, new_size).ok_or(AllocError::OutOfMemory)?;
        self.used.set(candidate);
        Ok(Some(block))
    }

    fn used(&self) -> Option<usize> {
        Some(self.used.get())
    }
}

fn layout(size: usize) -> Option<Layout> {
    Layout::from_size_align(size, MIN_ALIGN).ok()
}

unsafe fn resize_block(ptr: *mut u8, old_size: usize, new_size: usize) -> Option<NonNull<u8>> {
    let new_layout = layout(new_size)?;
    let block = if ptr.is_null() || old_size == 0 {
        alloc::alloc(new_layout)
    } else {
        let old_layout = layout(old_size)?;
        alloc::realloc(ptr, old_layout, new_layout.size())
    };
    NonNull::new(block)
}

unsafe fn free_block(ptr: *mut u8, old_size: usize) {
    if ptr.is_null() || old_size == 0 {
        return;
    }
    if let Some(old_layout) = layout(old_size) {
        alloc::dealloc(ptr, old_layout);
    }
}

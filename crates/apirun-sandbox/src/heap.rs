//! Memory ceiling for a sandbox runtime.
//!
//! QuickJS reports a refused allocation only as a thrown value, and when it
//! cannot allocate even the error object that value is `null`. The ceiling is
//! therefore enforced here, in the allocator, which raises a flag the host
//! reads after the script has failed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rquickjs::allocator::{Allocator, RustAllocator};

/// Rust-global-allocator backed allocator that refuses to grow past `limit`.
pub(crate) struct CappedAllocator {
    limit: usize,
    used: usize,
    exceeded: Arc<AtomicBool>,
}

impl CappedAllocator {
    /// Allocator capped at `limit` bytes. `exceeded` is set on the first refusal.
    pub(crate) fn new(limit: usize, exceeded: Arc<AtomicBool>) -> Self {
        Self {
            limit,
            used: 0,
            exceeded,
        }
    }

    fn admit(&self, additional: usize) -> bool {
        match self.used.checked_add(additional) {
            Some(total) if total <= self.limit => true,
            _ => {
                self.exceeded.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    fn track(&mut self, ptr: *mut u8) -> *mut u8 {
        if !ptr.is_null() {
            // SAFETY: `ptr` was just returned by `RustAllocator`.
            self.used += unsafe { RustAllocator::usable_size(ptr) };
        }
        ptr
    }
}

// SAFETY: every pointer handed out comes from `RustAllocator` unchanged, so
// its alignment and usable-size guarantees carry over.
unsafe impl Allocator for CappedAllocator {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        if !self.admit(size) {
            return std::ptr::null_mut();
        }
        let ptr = RustAllocator.alloc(size);
        self.track(ptr)
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            self.exceeded.store(true, Ordering::SeqCst);
            return std::ptr::null_mut();
        };
        if !self.admit(total) {
            return std::ptr::null_mut();
        }
        let ptr = RustAllocator.calloc(count, size);
        self.track(ptr)
    }

    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        self.used = self.used.saturating_sub(RustAllocator::usable_size(ptr));
        RustAllocator.dealloc(ptr);
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let old_size = RustAllocator::usable_size(ptr);
        if new_size > old_size && !self.admit(new_size - old_size) {
            return std::ptr::null_mut();
        }
        let new_ptr = RustAllocator.realloc(ptr, new_size);
        if new_ptr.is_null() {
            return new_ptr;
        }
        self.used = self.used.saturating_sub(old_size) + RustAllocator::usable_size(new_ptr);
        new_ptr
    }

    unsafe fn usable_size(ptr: *mut u8) -> usize {
        RustAllocator::usable_size(ptr)
    }
}

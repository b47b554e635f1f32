//! Central pool: the shared list of coalesced free spans.
//!
//! The list is kept sorted descending by size, so checking the head is the
//! whole availability test: if the head does not fit, nothing on the list
//! does. Allocating threads only ever detach the head; the reclaimer
//! replaces the entire list in one swap and walks away with the old one.

use crate::span::Span;
use crate::sync::SpinMutex;
use core::mem;
use core::ptr;

struct Head(*mut Span);

// SAFETY: spans on the central list are quiescent free spans; the latch
// serializes every accessor, and the latch acquire/release pair carries the
// happens-before edge from the thread that deposited a span to the thread
// that reuses it.
unsafe impl Send for Head {}

pub struct CentralPool {
    head: SpinMutex<Head>,
}

impl CentralPool {
    pub const fn new() -> Self {
        Self {
            head: SpinMutex::new(Head(ptr::null_mut())),
        }
    }

    /// Detach and return the head span if it can hold `want` bytes,
    /// null otherwise.
    pub fn take(&self, want: usize) -> *mut Span {
        let mut head = self.head.lock();
        let span = head.0;
        if span.is_null() || unsafe { (*span).size } < want {
            return ptr::null_mut();
        }
        head.0 = unsafe { (*span).next };
        span
    }

    /// Install a freshly sorted list wholesale, returning the previous one.
    pub fn swap(&self, list: *mut Span) -> *mut Span {
        let mut head = self.head.lock();
        mem::replace(&mut head.0, list)
    }
}

/// The process-wide pool.
pub static CENTRAL: CentralPool = CentralPool::new();

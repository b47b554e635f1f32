//! Allocator facade: the three public operations and the `GlobalAlloc`
//! adapter.
//!
//! The `ParMalloc` struct is zero-sized; all mutable state lives in
//! module-level statics (central pool, arena registry, reclaimer) or in
//! thread-local arenas. The first allocate anywhere in the process spawns
//! the reclaimer.

use crate::arena::{self, ORPHANS};
use crate::central::CENTRAL;
use crate::platform;
use crate::reclaim;
use crate::span::{self, Span, HEADER_SIZE, LARGE_THRESHOLD};
use crate::PAGE_SIZE;
use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;

/// Requests above this cannot be rounded to a page multiple without
/// overflowing; they are unsatisfiable by construction.
const MAX_REQUEST: usize = usize::MAX - 2 * PAGE_SIZE;

/// Mapping failed and the allocator holds no reserve; there is nothing to
/// hand back to the caller.
#[cold]
pub(crate) fn oom_abort() -> ! {
    std::process::abort()
}

/// Allocate `size` bytes, returning a 16-byte-aligned payload pointer.
/// Null for zero-size (and unroundable) requests; aborts the process on
/// OS exhaustion.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 || size > MAX_REQUEST {
        return ptr::null_mut();
    }
    reclaim::ensure_started();

    let needed = span::round_size(size);
    if needed >= LARGE_THRESHOLD {
        return large_allocate(needed);
    }
    arena::with_arena(|a| unsafe { a.allocate(needed) })
        .unwrap_or_else(|| fallback_allocate(needed))
}

/// Release a payload pointer previously returned by [`allocate`] or
/// [`resize`]. Null is a no-op.
///
/// # Safety
///
/// `ptr` must be null or a live payload pointer from this allocator;
/// releasing twice is undefined.
pub unsafe fn release(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let span = unsafe { span::of_payload(ptr) };
    let size = unsafe { (*span).size };
    debug_assert!(size >= span::MIN_SPAN && size % HEADER_SIZE == 0);

    if size >= LARGE_THRESHOLD {
        // Large spans record their mapping length; hand it straight back.
        unsafe { platform::unmap(span as *mut u8, size) };
        return;
    }

    if arena::with_arena(|a| unsafe { a.release(span) }).is_none() {
        // Thread-local storage is gone (teardown): park the span for the
        // reclaimer instead.
        unsafe { ORPHANS.push(span) };
        reclaim::signal();
    }
}

/// Grow or shrink an allocation to at least `new_size` bytes, preserving
/// the payload prefix. Null `ptr` delegates to [`allocate`]; `new_size`
/// of zero releases and returns null.
///
/// # Safety
///
/// `ptr` must be null or a live payload pointer from this allocator. On
/// growth the old pointer is released and must not be used again.
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> *mut u8 {
    if ptr.is_null() {
        return allocate(new_size);
    }
    if new_size == 0 {
        unsafe { release(ptr) };
        return ptr::null_mut();
    }
    if new_size > MAX_REQUEST {
        return ptr::null_mut();
    }

    let span = unsafe { span::of_payload(ptr) };
    let current = unsafe { (*span).size };
    if span::round_size(new_size) <= current {
        return ptr;
    }

    let fresh = allocate(new_size);
    // allocate aborts rather than failing here, so fresh is non-null.
    unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, current - HEADER_SIZE);
        release(ptr);
    }
    fresh
}

/// Large path: a dedicated mapping per span. The header records the
/// page-rounded mapping length so release can unmap it exactly.
#[cold]
fn large_allocate(needed: usize) -> *mut u8 {
    let len = platform::page_round(needed);
    let region = platform::map(len);
    if region.is_null() {
        oom_abort();
    }
    let span = region as *mut Span;
    unsafe {
        (*span).size = len;
        span::payload(span)
    }
}

/// Service a small allocation without a thread-local arena (thread
/// startup/teardown): central pool first, else a dedicated mapping.
#[cold]
fn fallback_allocate(needed: usize) -> *mut u8 {
    let head = CENTRAL.take(needed);
    if !head.is_null() {
        unsafe {
            // No cache to keep a remainder in; park it for the reclaimer.
            if let Some(rem) = span::split(head, needed) {
                ORPHANS.push(rem);
                reclaim::signal();
            }
            return span::payload(head);
        }
    }
    large_allocate(needed)
}

// =============================================================================
// GlobalAlloc adapter
// =============================================================================

/// Thread-caching allocator with background reclamation.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: parmalloc::ParMalloc = parmalloc::ParMalloc;
/// ```
pub struct ParMalloc;

unsafe impl GlobalAlloc for ParMalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();
        if size == 0 {
            // Non-null aligned dangling pointer for ZSTs.
            return align as *mut u8;
        }
        if align <= HEADER_SIZE {
            return allocate(size);
        }
        unsafe { alloc_overaligned(size, align) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() || layout.size() == 0 {
            return;
        }
        if layout.align() <= HEADER_SIZE {
            unsafe { release(ptr) };
        } else {
            // SAFETY: alloc_overaligned stashed the true payload pointer
            // in the word before the aligned one.
            unsafe { release(*(ptr.sub(mem::size_of::<*mut u8>()) as *mut *mut u8)) };
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            // Recycled spans are dirty; fresh mappings happen to be zeroed
            // but the caller cannot tell which it got.
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if ptr.is_null() || layout.size() == 0 {
            let new_layout =
                unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            return unsafe { self.alloc(new_layout) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }
        if layout.align() <= HEADER_SIZE {
            return unsafe { resize(ptr, new_size) };
        }

        // Over-aligned: the true payload pointer cannot be recovered once
        // the stash offset changes, so move the allocation.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        let fresh = unsafe { self.alloc(new_layout) };
        if !fresh.is_null() {
            let copy = layout.size().min(new_size);
            unsafe {
                ptr::copy_nonoverlapping(ptr, fresh, copy);
                self.dealloc(ptr, layout);
            }
        }
        fresh
    }
}

/// Alignments beyond the header width: over-allocate, place the payload at
/// the aligned offset, and stash the true payload pointer in the word just
/// before it.
unsafe fn alloc_overaligned(size: usize, align: usize) -> *mut u8 {
    let total = match size
        .checked_add(align)
        .and_then(|t| t.checked_add(HEADER_SIZE))
    {
        Some(total) => total,
        None => return ptr::null_mut(),
    };
    let raw = allocate(total);
    if raw.is_null() {
        return ptr::null_mut();
    }
    // raw + HEADER_SIZE leaves at least a word of room below the aligned
    // address for the stash.
    let aligned = (raw as usize + HEADER_SIZE).next_multiple_of(align);
    unsafe {
        *((aligned - mem::size_of::<*mut u8>()) as *mut *mut u8) = raw;
    }
    aligned as *mut u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_returns_null() {
        assert!(allocate(0).is_null());
    }

    #[test]
    fn test_release_null_is_noop() {
        unsafe { release(ptr::null_mut()) };
    }

    #[test]
    fn test_payloads_are_aligned_and_writable() {
        let mut live = Vec::new();
        for size in 1..200usize {
            let p = allocate(size);
            assert!(!p.is_null());
            assert_eq!(p as usize % 16, 0, "size {} misaligned", size);
            unsafe {
                for i in 0..size {
                    *p.add(i) = (size ^ i) as u8;
                }
            }
            live.push((p, size));
        }
        for &(p, size) in &live {
            unsafe {
                for i in 0..size {
                    assert_eq!(*p.add(i), (size ^ i) as u8);
                }
                release(p);
            }
        }
    }

    #[test]
    fn test_freed_span_is_reused_lifo() {
        let p1 = allocate(24);
        let p2 = allocate(40);
        unsafe { release(p1) };
        let p3 = allocate(24);
        assert_eq!(p3, p1);
        unsafe {
            release(p2);
            release(p3);
        }
    }

    #[test]
    fn test_large_allocation_is_page_backed() {
        let p = allocate(5000);
        assert!(!p.is_null());
        // The header sits on the page boundary, the payload right after it.
        assert_eq!(p as usize % PAGE_SIZE, HEADER_SIZE);
        unsafe {
            let span = span::of_payload(p);
            assert_eq!((*span).size, platform::page_round(span::round_size(5000)));
            *p = 0xEE;
            *p.add(4999) = 0xFF;
            assert_eq!(*p, 0xEE);
            release(p);
        }
    }

    #[test]
    fn test_resize_within_span_returns_same_pointer() {
        let p = allocate(100); // rounds to 128
        unsafe {
            assert_eq!(resize(p, 50), p);
            assert_eq!(resize(p, 112), p); // 112 rounds to 128 exactly
            release(p);
        }
    }

    #[test]
    fn test_resize_growth_preserves_payload() {
        let p = allocate(16);
        unsafe {
            for i in 0..16u8 {
                *p.add(i as usize) = i;
            }
            let q = resize(p, 2048);
            assert_ne!(q, p);
            for i in 0..16u8 {
                assert_eq!(*q.add(i as usize), i);
            }
            release(q);
        }
    }

    #[test]
    fn test_resize_null_allocates() {
        let p = unsafe { resize(ptr::null_mut(), 64) };
        assert!(!p.is_null());
        unsafe { release(p) };
    }

    #[test]
    fn test_resize_to_zero_releases() {
        let p = allocate(64);
        assert!(unsafe { resize(p, 0) }.is_null());
    }

    #[test]
    fn test_global_alloc_zst() {
        let a = ParMalloc;
        let layout = Layout::from_size_align(0, 32).unwrap();
        let p = unsafe { a.alloc(layout) };
        assert_eq!(p as usize, 32);
        unsafe { a.dealloc(p, layout) };
    }

    #[test]
    fn test_global_alloc_overaligned() {
        let a = ParMalloc;
        for align in [32usize, 64, 256, 4096] {
            let layout = Layout::from_size_align(100, align).unwrap();
            let p = unsafe { a.alloc(layout) };
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "align {}", align);
            unsafe {
                ptr::write_bytes(p, 0xA5, 100);
                assert_eq!(*p.add(99), 0xA5);
                a.dealloc(p, layout);
            }
        }
    }

    #[test]
    fn test_global_alloc_zeroed_after_reuse() {
        let a = ParMalloc;
        let layout = Layout::from_size_align(128, 8).unwrap();
        unsafe {
            // Dirty a span, free it, then ask for zeroed memory of the same
            // size: the recycled bytes must come back clean.
            let p = a.alloc(layout);
            ptr::write_bytes(p, 0xDD, 128);
            a.dealloc(p, layout);

            let q = a.alloc_zeroed(layout);
            for i in 0..128 {
                assert_eq!(*q.add(i), 0, "byte {} not zeroed", i);
            }
            a.dealloc(q, layout);
        }
    }

    #[test]
    fn test_global_realloc_overaligned_preserves() {
        let a = ParMalloc;
        let layout = Layout::from_size_align(64, 64).unwrap();
        unsafe {
            let p = a.alloc(layout);
            for i in 0..64u8 {
                *p.add(i as usize) = i;
            }
            let q = a.realloc(p, layout, 512);
            assert_eq!(q as usize % 64, 0);
            for i in 0..64u8 {
                assert_eq!(*q.add(i as usize), i);
            }
            a.dealloc(q, Layout::from_size_align(512, 64).unwrap());
        }
    }
}

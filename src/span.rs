//! Span headers and the size policy.
//!
//! Every span starts with a 16-byte header whose first word is the span's
//! total length, header included, so `header + size` is the start of the
//! next adjacent span. While the span is live only the size word is
//! meaningful and the payload begins right after the header; while it is
//! free the same bytes are read as a list node (size, next). The two views
//! are never valid at the same time — whichever list owns the span knows
//! its state.

use crate::PAGE_SIZE;
use core::ptr;

/// Width of the span header. Also the payload alignment.
pub const HEADER_SIZE: usize = 16;

/// Smallest live span: a header plus one payload granule.
pub const MIN_SPAN: usize = 2 * HEADER_SIZE;

/// Spans whose rounded size reaches one page bypass the caches entirely
/// and map/unmap directly.
pub const LARGE_THRESHOLD: usize = PAGE_SIZE;

/// Span header, doubling as the free-list node overlay.
#[repr(C)]
pub struct Span {
    /// Total byte length of the span, header included.
    pub size: usize,
    /// Next span on whatever free list currently owns this one.
    /// Garbage while the span is live.
    pub next: *mut Span,
}

const _: () = assert!(core::mem::size_of::<Span>() == HEADER_SIZE);

/// Round a request up to a 16-byte multiple with room for the header.
#[inline]
pub fn round_size(n: usize) -> usize {
    (n + HEADER_SIZE).div_ceil(HEADER_SIZE) * HEADER_SIZE
}

/// The payload a live span hands to the caller.
#[inline]
pub unsafe fn payload(span: *mut Span) -> *mut u8 {
    unsafe { (span as *mut u8).add(HEADER_SIZE) }
}

/// Recover the span header from a payload pointer.
#[inline]
pub unsafe fn of_payload(ptr: *mut u8) -> *mut Span {
    unsafe { ptr.sub(HEADER_SIZE) as *mut Span }
}

/// The address one past this span's last byte, i.e. where an adjacent
/// successor would start.
#[inline]
pub unsafe fn next_adjacent(span: *mut Span) -> *mut Span {
    unsafe { (span as *mut u8).add((*span).size) as *mut Span }
}

/// Carve a live span of `want` bytes off the front of `span`, returning
/// the trailing remainder as a fresh free node if one is worth keeping.
///
/// Remainders of at least [`MIN_SPAN`] always split off. A sub-minimum
/// remainder is normally absorbed (the caller keeps the whole span), with
/// one exception: if absorbing would leave a live span at or above
/// [`LARGE_THRESHOLD`], a 16-byte runt node is carved instead. Runts never
/// satisfy an allocation on their own but coalesce away in the reclaimer;
/// the cap is what keeps release's size-based large routing sound.
///
/// # Safety
///
/// `span` must point to a free span of at least `want` bytes.
pub unsafe fn split(span: *mut Span, want: usize) -> Option<*mut Span> {
    let total = unsafe { (*span).size };
    debug_assert!(total >= want);
    let rest = total - want;

    if rest == 0 || (rest < MIN_SPAN && total < LARGE_THRESHOLD) {
        return None;
    }

    unsafe {
        (*span).size = want;
        let rem = next_adjacent(span);
        (*rem).size = rest;
        (*rem).next = ptr::null_mut();
        Some(rem)
    }
}

//! Page provider: whole-page mappings from the OS.
//!
//! The rest of the crate only ever asks for page-multiple regions. `map`
//! hands back fresh zeroed anonymous memory; `unmap` returns a range that
//! came from `map`. There is no recovery path for mapping exhaustion — the
//! facade aborts — so `map` just reports failure with a null pointer.
//!
//! Relaxed call/byte counters are kept so tests can observe when the
//! allocator actually reaches the OS.

use crate::PAGE_SIZE;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

cfg_if::cfg_if! {
    if #[cfg(not(unix))] {
        compile_error!("parmalloc requires a unix target for anonymous page mappings");
    }
}

static MAP_CALLS: AtomicUsize = AtomicUsize::new(0);
static MAPPED_BYTES: AtomicUsize = AtomicUsize::new(0);

/// Round up to a whole number of pages.
#[inline]
pub fn page_round(n: usize) -> usize {
    n.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Map a fresh zeroed read/write region of `page_round(len)` bytes.
/// Returns null on OS exhaustion.
pub fn map(len: usize) -> *mut u8 {
    let len = page_round(len);
    // SAFETY: anonymous private mapping, no fd, no fixed address.
    let region = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if region == libc::MAP_FAILED {
        return ptr::null_mut();
    }
    MAP_CALLS.fetch_add(1, Ordering::Relaxed);
    MAPPED_BYTES.fetch_add(len, Ordering::Relaxed);
    region as *mut u8
}

/// Return a page-aligned region previously obtained from [`map`].
///
/// # Safety
///
/// `region` must be page-aligned and `[region, region + page_round(len))`
/// must lie within a single mapping returned by `map` that has not been
/// unmapped yet.
pub unsafe fn unmap(region: *mut u8, len: usize) {
    let len = page_round(len);
    debug_assert_eq!(region as usize % PAGE_SIZE, 0);
    // SAFETY: caller guarantees the range came from map.
    if unsafe { libc::munmap(region as *mut libc::c_void, len) } != 0 {
        log::warn!(
            "munmap failed: {}, addr {:p}, len {}",
            errno::errno(),
            region,
            len
        );
        return;
    }
    MAPPED_BYTES.fetch_sub(len, Ordering::Relaxed);
}

/// Number of successful `map` calls so far, process-wide.
pub fn map_calls() -> usize {
    MAP_CALLS.load(Ordering::Relaxed)
}

/// Bytes currently mapped through this module.
pub fn mapped_bytes() -> usize {
    MAPPED_BYTES.load(Ordering::Relaxed)
}

//! The reclaimer: a single background thread that drains handoff queues,
//! coalesces adjacent spans, and republishes the result as the central
//! pool.
//!
//! Arenas signal through an atomic `awakenings` counter paired with a
//! condition variable; the counter is what makes a signal that races the
//! reclaimer's sleep impossible to lose. Each pass carries a private
//! working list across iterations: the list traded out of the central
//! pool on one pass is re-sorted and becomes the merge target of the
//! next.

use crate::arena::{self, ORPHANS};
use crate::central::CENTRAL;
use crate::span::{self, Span};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::cell::Cell;
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;

static STARTED: AtomicBool = AtomicBool::new(false);
static AWAKENINGS: AtomicUsize = AtomicUsize::new(0);
static WAKE_MTX: Mutex<()> = Mutex::new(());
static WAKE_CV: Condvar = Condvar::new();
static PASSES: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SPAWN_SEEN: Cell<bool> = const { Cell::new(false) };
}

/// Make sure the reclaimer thread exists. After the first call on a given
/// thread this is a single thread-local read.
#[inline]
pub fn ensure_started() {
    SPAWN_SEEN
        .try_with(|seen| {
            if !seen.get() {
                start();
                seen.set(true);
            }
        })
        .unwrap_or_else(|_| start());
}

#[cold]
fn start() {
    if STARTED.swap(true, Ordering::AcqRel) {
        return;
    }
    let spawned = thread::Builder::new()
        .name("parmalloc-reclaim".into())
        .spawn(worker);
    if spawned.is_err() {
        // No reclaimer means ceded caches would pile up unseen forever.
        std::process::abort();
    }
}

/// Wake the reclaimer. Called by arenas on watermark, by the orphan path,
/// and by thread teardown flushes.
pub fn signal() {
    AWAKENINGS.fetch_add(1, Ordering::Release);
    // Taking the mutex orders this signal against a reclaimer that has
    // checked the counter but not yet begun waiting.
    drop(WAKE_MTX.lock().unwrap_or_else(PoisonError::into_inner));
    WAKE_CV.notify_one();
}

/// Completed reclamation passes, process-wide. Lets tests wait for a
/// deposit to actually reach the central pool.
pub fn passes() -> usize {
    PASSES.load(Ordering::Acquire)
}

fn worker() -> ! {
    log::debug!("reclaimer running");
    let mut deleted: *mut Span = ptr::null_mut();
    loop {
        wait_for_signal();
        deleted = reclaim_pass(deleted);
        PASSES.fetch_add(1, Ordering::Release);
    }
}

fn wait_for_signal() {
    let mut guard = WAKE_MTX.lock().unwrap_or_else(PoisonError::into_inner);
    while AWAKENINGS.load(Ordering::Acquire) == 0 {
        guard = WAKE_CV
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
    }
    AWAKENINGS.store(0, Ordering::Release);
}

/// One drain: pull every queue, coalesce everything into the carried
/// working list, then trade the size-sorted result for the central pool's
/// current content, which becomes the next working list.
fn reclaim_pass(deleted: *mut Span) -> *mut Span {
    // The previous central content arrives size-sorted; restore address
    // order before merging new batches in.
    let mut deleted = unsafe { sort_by_address(deleted) };

    let mut absorb = |batch: *mut Span| {
        if !batch.is_null() {
            unsafe {
                let batch = sort_by_address(batch);
                deleted = merge_by_address(batch, deleted);
            }
        }
    };

    absorb(ORPHANS.swap_out());
    arena::each_arena(|a| {
        // SAFETY: registered arenas are never freed; the handoff queue is
        // the one piece of arena state the reclaimer may touch.
        absorb(unsafe { (*a).handoff.swap_out() });
    });

    let sorted = unsafe { sort_by_size(deleted) };
    let previous = CENTRAL.swap(sorted);
    log::trace!("reclamation pass complete");
    previous
}

// =============================================================================
// List sorting
// =============================================================================

/// Split a list in two around its midpoint (slow/fast cursors).
unsafe fn split_halves(head: *mut Span) -> (*mut Span, *mut Span) {
    unsafe {
        let mut slow = head;
        let mut fast = (*head).next;
        while !fast.is_null() && !(*fast).next.is_null() {
            slow = (*slow).next;
            fast = (*(*fast).next).next;
        }
        let second = (*slow).next;
        (*slow).next = ptr::null_mut();
        (head, second)
    }
}

/// Merge two address-sorted lists into ascending address order, absorbing
/// every span that turns out to sit flush against its predecessor.
unsafe fn merge_by_address(a: *mut Span, b: *mut Span) -> *mut Span {
    let mut head: *mut Span = ptr::null_mut();
    let mut link: *mut *mut Span = &raw mut head;
    let (mut a, mut b) = (a, b);
    unsafe {
        loop {
            if b.is_null() {
                *link = a;
                break;
            }
            if a.is_null() {
                *link = b;
                break;
            }
            if (a as usize) < (b as usize) {
                *link = a;
                link = &raw mut (*a).next;
                a = (*a).next;
            } else {
                *link = b;
                link = &raw mut (*b).next;
                b = (*b).next;
            }
        }

        // Coalesce the merged run in one sweep.
        let mut cur = head;
        while !cur.is_null() {
            let next = (*cur).next;
            if next.is_null() {
                break;
            }
            if span::next_adjacent(cur) == next {
                (*cur).size += (*next).size;
                (*cur).next = (*next).next;
            } else {
                cur = next;
            }
        }
    }
    head
}

/// Top-down merge sort by ascending address, coalescing as it merges.
pub(crate) unsafe fn sort_by_address(head: *mut Span) -> *mut Span {
    if head.is_null() || unsafe { (*head).next.is_null() } {
        return head;
    }
    unsafe {
        let (a, b) = split_halves(head);
        let a = sort_by_address(a);
        let b = sort_by_address(b);
        merge_by_address(a, b)
    }
}

/// Merge two size-sorted lists into descending size order. No coalescing.
unsafe fn merge_by_size(a: *mut Span, b: *mut Span) -> *mut Span {
    let mut head: *mut Span = ptr::null_mut();
    let mut link: *mut *mut Span = &raw mut head;
    let (mut a, mut b) = (a, b);
    unsafe {
        loop {
            if b.is_null() {
                *link = a;
                break;
            }
            if a.is_null() {
                *link = b;
                break;
            }
            if (*a).size > (*b).size {
                *link = a;
                link = &raw mut (*a).next;
                a = (*a).next;
            } else {
                *link = b;
                link = &raw mut (*b).next;
                b = (*b).next;
            }
        }
    }
    head
}

/// Top-down merge sort by descending size.
pub(crate) unsafe fn sort_by_size(head: *mut Span) -> *mut Span {
    if head.is_null() || unsafe { (*head).next.is_null() } {
        return head;
    }
    unsafe {
        let (a, b) = split_halves(head);
        let a = sort_by_size(a);
        let b = sort_by_size(b);
        merge_by_size(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform;
    use crate::PAGE_SIZE;

    /// Carve a free span of `size` bytes at `offset` into the region.
    unsafe fn carve(region: *mut u8, offset: usize, size: usize) -> *mut Span {
        unsafe {
            let span = region.add(offset) as *mut Span;
            (*span).size = size;
            (*span).next = ptr::null_mut();
            span
        }
    }

    unsafe fn link(spans: &[*mut Span]) -> *mut Span {
        unsafe {
            for pair in spans.windows(2) {
                (*pair[0]).next = pair[1];
            }
            (*spans[spans.len() - 1]).next = ptr::null_mut();
        }
        spans[0]
    }

    fn collect(mut head: *mut Span) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        while !head.is_null() {
            unsafe {
                out.push((head as usize, (*head).size));
                head = (*head).next;
            }
        }
        out
    }

    #[test]
    fn test_sort_by_size_descending() {
        let region = platform::map(PAGE_SIZE);
        unsafe {
            // Non-adjacent spans so sizes are the only thing that moves.
            let a = carve(region, 0, 64);
            let b = carve(region, 256, 512);
            let c = carve(region, 1024, 128);
            let d = carve(region, 2048, 512);
            let sorted = sort_by_size(link(&[a, b, c, d]));
            let sizes: Vec<usize> = collect(sorted).iter().map(|e| e.1).collect();
            assert_eq!(sizes, vec![512, 512, 128, 64]);
        }
    }

    #[test]
    fn test_sort_by_size_handles_tiny_lists() {
        let region = platform::map(PAGE_SIZE);
        unsafe {
            assert!(sort_by_size(ptr::null_mut()).is_null());
            let a = carve(region, 0, 64);
            assert_eq!(sort_by_size(a), a);

            let small = carve(region, 256, 32);
            (*a).next = small;
            let sorted = sort_by_size(a);
            let sizes: Vec<usize> = collect(sorted).iter().map(|e| e.1).collect();
            assert_eq!(sizes, vec![64, 32]);
        }
    }

    #[test]
    fn test_sort_by_address_coalesces_adjacent_run() {
        let region = platform::map(PAGE_SIZE);
        unsafe {
            // Three spans tiling [0, 144), listed out of order.
            let a = carve(region, 0, 64);
            let b = carve(region, 64, 32);
            let c = carve(region, 96, 48);
            let sorted = sort_by_address(link(&[c, a, b]));
            let entries = collect(sorted);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0], (region as usize, 144));
        }
    }

    #[test]
    fn test_sort_by_address_keeps_gaps_apart() {
        let region = platform::map(PAGE_SIZE);
        unsafe {
            let a = carve(region, 0, 64);
            let b = carve(region, 128, 64);
            let c = carve(region, 512, 64);
            let sorted = sort_by_address(link(&[b, c, a]));
            let entries = collect(sorted);
            assert_eq!(
                entries,
                vec![
                    (region as usize, 64),
                    (region as usize + 128, 64),
                    (region as usize + 512, 64),
                ]
            );
        }
    }

    #[test]
    fn test_merge_coalesces_across_batches() {
        let region = platform::map(PAGE_SIZE);
        unsafe {
            // Batch one holds the even tiles, batch two the odd ones; merged
            // they tile [0, 256) and collapse to a single span.
            let a0 = carve(region, 0, 64);
            let a1 = carve(region, 128, 64);
            let b0 = carve(region, 64, 64);
            let b1 = carve(region, 192, 64);
            let merged = merge_by_address(link(&[a0, a1]), link(&[b0, b1]));
            let entries = collect(merged);
            assert_eq!(entries, vec![(region as usize, 256)]);
        }
    }

    #[test]
    fn test_merge_absorbs_runt_remainders() {
        let region = platform::map(PAGE_SIZE);
        unsafe {
            // A 16-byte runt wedged between two spans disappears into the
            // combined span.
            let a = carve(region, 0, 4080);
            let runt = carve(region, 4080, 16);
            let b = carve(region, 4096, 64);
            let sorted = sort_by_address(link(&[runt, b, a]));
            let entries = collect(sorted);
            assert_eq!(entries, vec![(region as usize, 4160)]);
        }
    }

    #[test]
    fn test_sort_larger_shuffled_batch() {
        let region = platform::map(4 * PAGE_SIZE);
        unsafe {
            // 32 spans of 64 bytes tiling [0, 2048), inserted in a scattered
            // order; a full sort must collapse them into one 2048-byte span.
            let mut spans = Vec::new();
            for i in 0..32usize {
                // simple fixed permutation: stride 7 mod 32
                let idx = (i * 7) % 32;
                spans.push(carve(region, idx * 64, 64));
            }
            let sorted = sort_by_address(link(&spans));
            let entries = collect(sorted);
            assert_eq!(entries, vec![(region as usize, 2048)]);
        }
    }
}

//! Per-thread arenas: bump region, local free cache, and the handoff
//! queue that cedes the cache to the reclaimer.
//!
//! Each thread drives its own arena through a thread-local pointer; no
//! other thread ever touches arena state except the handoff queue, and
//! that only under its latch. Arena structs are carved from dedicated
//! metadata pages and stay registered for the life of the process, so a
//! thread that exits leaves its arena behind with an empty cache and an
//! exhausted bump region.

use crate::central::CENTRAL;
use crate::platform;
use crate::reclaim;
use crate::span::{self, Span, HEADER_SIZE, LARGE_THRESHOLD, MIN_SPAN};
use crate::sync::SpinMutex;
use crate::PAGE_SIZE;
use core::cell::Cell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Fresh bump regions are 16 pages.
const BUMP_REGION_SIZE: usize = 16 * PAGE_SIZE;

/// Once the cache holds this many bytes it is ceded to the reclaimer.
const CACHE_WATERMARK: usize = 20 * PAGE_SIZE;

// =============================================================================
// Handoff queue
// =============================================================================

struct QueueHead(*mut Span);

// SAFETY: queued spans are quiescent; the latch serializes the producing
// arena against the consuming reclaimer and carries the happens-before
// edge between them.
unsafe impl Send for QueueHead {}

/// A latched producer/consumer queue of free spans. Each arena owns one;
/// a process-wide instance catches spans released while thread-local
/// storage is unavailable.
pub struct Handoff {
    head: SpinMutex<QueueHead>,
}

impl Handoff {
    pub const fn new() -> Self {
        Self {
            head: SpinMutex::new(QueueHead(ptr::null_mut())),
        }
    }

    /// Splice an entire cache list onto the front of the queue.
    ///
    /// # Safety
    ///
    /// `head` must be a well-formed span list whose final `next` link is
    /// at `tail_link`.
    unsafe fn splice(&self, head: *mut Span, tail_link: *mut *mut Span) {
        let mut q = self.head.lock();
        unsafe { *tail_link = q.0 };
        q.0 = head;
    }

    /// Queue a single span.
    ///
    /// # Safety
    ///
    /// `span` must be a free span owned by the caller.
    pub unsafe fn push(&self, span: *mut Span) {
        let mut q = self.head.lock();
        unsafe { (*span).next = q.0 };
        q.0 = span;
    }

    /// Take the whole queue, leaving it empty.
    pub fn swap_out(&self) -> *mut Span {
        let mut q = self.head.lock();
        mem::replace(&mut q.0, ptr::null_mut())
    }
}

/// Spans released while the releasing thread has no arena (thread
/// teardown). Drained by the reclaimer like any arena queue.
pub static ORPHANS: Handoff = Handoff::new();

// =============================================================================
// Arena
// =============================================================================

/// Per-thread allocator state.
pub struct Arena {
    /// Unused suffix of the current bump region.
    bump_begin: *mut u8,
    bump_end: *mut u8,
    /// LIFO cache of recently released spans.
    cache_head: *mut Span,
    /// Location of the cache's null terminator link: `&cache_head` while
    /// the cache is empty, otherwise `&tail.next`.
    cache_tail_link: *mut *mut Span,
    /// Sum of span sizes currently on the cache.
    cache_bytes: usize,
    /// Queue of ceded cache lists awaiting the reclaimer.
    pub handoff: Handoff,
    /// Registry link. Written once before publication, never changed.
    next: *mut Arena,
}

impl Arena {
    const fn empty() -> Self {
        Self {
            bump_begin: ptr::null_mut(),
            bump_end: ptr::null_mut(),
            cache_head: ptr::null_mut(),
            cache_tail_link: ptr::null_mut(),
            cache_bytes: 0,
            handoff: Handoff::new(),
            next: ptr::null_mut(),
        }
    }

    /// Place a fresh arena at `at` and point its tail link at its own head.
    ///
    /// # Safety
    ///
    /// `at` must be valid, writable, and never moved afterwards.
    unsafe fn init(at: *mut Arena) {
        unsafe {
            ptr::write(at, Arena::empty());
            (*at).cache_tail_link = &raw mut (*at).cache_head;
        }
    }

    /// Allocate a span of exactly `size` rounded bytes (< the large
    /// threshold): cache first, then the central pool, then the bump
    /// region. Aborts on OS exhaustion.
    ///
    /// # Safety
    ///
    /// Must only run on the owning thread. `size` must come from
    /// [`span::round_size`] and be below [`LARGE_THRESHOLD`].
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if let Some(p) = unsafe { self.take_cached(size) } {
            return p;
        }
        let head = CENTRAL.take(size);
        if !head.is_null() {
            unsafe {
                if let Some(rem) = span::split(head, size) {
                    self.insert_cached(rem);
                }
                return span::payload(head);
            }
        }
        unsafe { self.bump(size) }
    }

    /// Push a released span onto the cache front, ceding the whole cache
    /// to the reclaimer once the watermark is crossed.
    ///
    /// # Safety
    ///
    /// Must only run on the owning thread; `span` must be a live span
    /// that the caller is done with.
    pub unsafe fn release(&mut self, span: *mut Span) {
        unsafe {
            if self.cache_head.is_null() {
                self.cache_tail_link = &raw mut (*span).next;
            }
            (*span).next = self.cache_head;
            self.cache_head = span;
            self.cache_bytes += (*span).size;
        }
        if self.cache_bytes >= CACHE_WATERMARK {
            self.cede();
        }
    }

    /// Try the cache. Only the head is examined: released spans tend to
    /// be at least as large as what the thread allocates next, so a head
    /// miss is treated as a cache miss.
    unsafe fn take_cached(&mut self, want: usize) -> Option<*mut u8> {
        let head = self.cache_head;
        if head.is_null() {
            return None;
        }
        let total = unsafe { (*head).size };
        if total < want {
            return None;
        }

        let next = unsafe { (*head).next };
        match unsafe { span::split(head, want) } {
            None => {
                // The whole span leaves the cache.
                self.cache_head = next;
                if next.is_null() {
                    self.cache_tail_link = &raw mut self.cache_head;
                }
                self.cache_bytes -= total;
            }
            Some(rem) => {
                self.cache_bytes -= want;
                let rem_size = unsafe { (*rem).size };
                unsafe {
                    if next.is_null() {
                        // Remainder becomes the sole cache entry.
                        self.cache_head = rem;
                        self.cache_tail_link = &raw mut (*rem).next;
                    } else if rem_size < (*next).size {
                        // Remainder shrank below the next span: move it to
                        // the tail so the head stays the biggest guess.
                        self.cache_head = next;
                        *self.cache_tail_link = rem;
                        self.cache_tail_link = &raw mut (*rem).next;
                    } else {
                        self.cache_head = rem;
                        (*rem).next = next;
                    }
                }
            }
        }
        Some(unsafe { span::payload(head) })
    }

    /// Deposit a free span (central-split remainder, recycled bump tail)
    /// into the cache: in front if it is at least as large as the current
    /// head, at the tail otherwise.
    unsafe fn insert_cached(&mut self, span: *mut Span) {
        unsafe {
            self.cache_bytes += (*span).size;
            if self.cache_head.is_null() {
                self.cache_head = span;
                (*span).next = ptr::null_mut();
                self.cache_tail_link = &raw mut (*span).next;
            } else if (*span).size < (*self.cache_head).size {
                (*span).next = ptr::null_mut();
                *self.cache_tail_link = span;
                self.cache_tail_link = &raw mut (*span).next;
            } else {
                (*span).next = self.cache_head;
                self.cache_head = span;
            }
        }
    }

    /// Hand the entire cache to the reclaimer and reset it.
    fn cede(&mut self) {
        // SAFETY: cache_head..cache_tail_link is a well-formed list; it is
        // spliced before the cache fields are reset, so no span is ever
        // reachable from both.
        unsafe {
            self.handoff.splice(self.cache_head, self.cache_tail_link);
        }
        self.cache_head = ptr::null_mut();
        self.cache_tail_link = &raw mut self.cache_head;
        self.cache_bytes = 0;
        reclaim::signal();
    }

    /// Carve from the bump region, refilling it first if needed.
    unsafe fn bump(&mut self, want: usize) -> *mut u8 {
        let mut avail = self.bump_end as usize - self.bump_begin as usize;
        if avail < want {
            unsafe { self.refill(want) };
            avail = self.bump_end as usize - self.bump_begin as usize;
        }

        // Absorb a sub-minimum tail into this span rather than stranding
        // bytes no list could hold, unless that would push a cached-path
        // span into large-release territory.
        let rest = avail - want;
        let take = if rest > 0 && rest < MIN_SPAN && avail < LARGE_THRESHOLD {
            avail
        } else {
            want
        };

        unsafe {
            let span = self.bump_begin as *mut Span;
            (*span).size = take;
            self.bump_begin = self.bump_begin.add(take);
            span::payload(span)
        }
    }

    /// Recycle whatever is left of the old region into the cache and map
    /// a new one. Aborts on OS exhaustion.
    #[cold]
    unsafe fn refill(&mut self, want: usize) {
        let tail = self.bump_end as usize - self.bump_begin as usize;
        if tail >= HEADER_SIZE {
            unsafe {
                let span = self.bump_begin as *mut Span;
                (*span).size = tail;
                self.insert_cached(span);
            }
        }

        let len = BUMP_REGION_SIZE.max(platform::page_round(want));
        let region = platform::map(len);
        if region.is_null() {
            crate::allocator::oom_abort();
        }
        self.bump_begin = region;
        self.bump_end = unsafe { region.add(len) };
    }
}

// =============================================================================
// Arena registry
// =============================================================================

static REGISTRY: AtomicPtr<Arena> = AtomicPtr::new(ptr::null_mut());

/// Link a new arena into the registry. Arenas are never unlinked.
unsafe fn register(arena: *mut Arena) {
    loop {
        let head = REGISTRY.load(Ordering::Acquire);
        unsafe { (*arena).next = head };
        if REGISTRY
            .compare_exchange(head, arena, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
}

/// Walk every registered arena.
pub fn each_arena(mut f: impl FnMut(*mut Arena)) {
    let mut p = REGISTRY.load(Ordering::Acquire);
    while !p.is_null() {
        f(p);
        p = unsafe { (*p).next };
    }
}

// =============================================================================
// Arena metadata slab
// =============================================================================

// Arena structs come from their own pages rather than the allocator being
// built, both to dodge bootstrapping and because registered arenas must
// outlive their thread's storage.

struct MetaSlab {
    bump: *mut u8,
    end: *mut u8,
}

// SAFETY: only accessed through the latch; the carved memory outlives
// every thread.
unsafe impl Send for MetaSlab {}

static META: SpinMutex<MetaSlab> = SpinMutex::new(MetaSlab {
    bump: ptr::null_mut(),
    end: ptr::null_mut(),
});

/// Carve a zeroed, never-freed Arena struct from the metadata pages.
fn alloc_arena() -> *mut Arena {
    let step = mem::size_of::<Arena>().next_multiple_of(HEADER_SIZE);
    let mut slab = META.lock();
    let avail = slab.end as usize - slab.bump as usize;
    if avail < step {
        let page = platform::map(PAGE_SIZE);
        if page.is_null() {
            crate::allocator::oom_abort();
        }
        slab.bump = page;
        slab.end = unsafe { page.add(PAGE_SIZE) };
    }
    let arena = slab.bump as *mut Arena;
    slab.bump = unsafe { slab.bump.add(step) };
    arena
}

// =============================================================================
// Thread-local handle
// =============================================================================

struct ArenaHandle {
    ptr: Cell<*mut Arena>,
}

impl ArenaHandle {
    const fn new() -> Self {
        Self {
            ptr: Cell::new(ptr::null_mut()),
        }
    }
}

impl Drop for ArenaHandle {
    fn drop(&mut self) {
        let arena = self.ptr.get();
        if arena.is_null() {
            return;
        }
        // Flush the cache so a dead thread strands no spans. The arena
        // itself stays registered, empty.
        unsafe {
            if !(*arena).cache_head.is_null() {
                (*arena).cede();
            }
        }
    }
}

thread_local! {
    static ARENA: ArenaHandle = const { ArenaHandle::new() };
}

#[cold]
fn new_arena() -> *mut Arena {
    let arena = alloc_arena();
    // SAFETY: freshly carved, stable address.
    unsafe {
        Arena::init(arena);
        register(arena);
    }
    arena
}

/// Run `f` against this thread's arena, creating and registering it on
/// first use. Returns None while thread-local storage is unavailable
/// (thread startup/teardown), in which case callers fall back to the
/// central pool or the orphan queue.
#[inline]
pub fn with_arena<R>(f: impl FnOnce(&mut Arena) -> R) -> Option<R> {
    ARENA
        .try_with(|handle| {
            let mut arena = handle.ptr.get();
            if arena.is_null() {
                arena = new_arena();
                handle.ptr.set(arena);
            }
            // SAFETY: the arena is thread-private apart from its handoff
            // queue, and nothing on the allocate/release paths re-enters
            // this accessor on the same thread.
            unsafe { f(&mut *arena) }
        })
        .ok()
}

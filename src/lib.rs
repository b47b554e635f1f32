//! parmalloc: a thread-caching memory allocator with background
//! reclamation.
//!
//! Three tiers service every request:
//! - per-thread arenas: a bump region plus a LIFO cache of released
//!   spans, touched without any locks
//! - a shared central pool of coalesced free spans behind a spin latch
//! - whole-page anonymous mappings from the OS
//!
//! Releases land on the releasing thread's cache; once the cache crosses
//! a watermark it is ceded wholesale through a latched handoff queue to a
//! background reclaimer, which address-sorts, coalesces, and republishes
//! the spans through the central pool. Requests of a page or more skip
//! all of it and map directly.
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: parmalloc::ParMalloc = parmalloc::ParMalloc;
//! ```
//!
//! Building with `--features ffi` additionally exports `malloc`, `free`,
//! `realloc`, and `calloc` so the cdylib can be preloaded.

pub mod platform;
pub mod sync;
pub mod span;
pub mod central;
pub mod arena;
pub mod reclaim;
pub mod allocator;
#[cfg(feature = "ffi")]
pub mod ffi;

/// Page size assumed for OS mappings (4 KiB).
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

// Re-export the public surface at the crate root.
pub use allocator::{allocate, release, resize, ParMalloc};

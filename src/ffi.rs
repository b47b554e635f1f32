//! C-ABI entry points, built under `features = ["ffi"]` so the cdylib can
//! be preloaded into unmodified binaries as the process allocator.
//!
//! `calloc` is exported alongside the three core operations because real
//! binaries call it; mixing this allocator's `free` with another
//! allocator's pointers is undefined.

use crate::allocator::{allocate, release, resize};
use core::ffi::c_void;
use core::ptr;

#[unsafe(export_name = "malloc")]
pub unsafe extern "C" fn parmalloc_malloc(size: usize) -> *mut c_void {
    allocate(size) as *mut c_void
}

#[unsafe(export_name = "free")]
pub unsafe extern "C" fn parmalloc_free(ptr: *mut c_void) {
    unsafe { release(ptr as *mut u8) }
}

#[unsafe(export_name = "realloc")]
pub unsafe extern "C" fn parmalloc_realloc(ptr: *mut c_void, new_size: usize) -> *mut c_void {
    unsafe { resize(ptr as *mut u8, new_size) as *mut c_void }
}

#[unsafe(export_name = "calloc")]
pub unsafe extern "C" fn parmalloc_calloc(count: usize, size: usize) -> *mut c_void {
    let total = match count.checked_mul(size) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };
    let p = allocate(total);
    if !p.is_null() {
        // Recycled spans are dirty.
        unsafe { ptr::write_bytes(p, 0, total) };
    }
    p as *mut c_void
}

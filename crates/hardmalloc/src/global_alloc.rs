//! `#[global_allocator]` support.
//!
//! ```rust,ignore
//! use hardmalloc::Hardmalloc;
//!
//! #[global_allocator]
//! static GLOBAL: Hardmalloc = Hardmalloc;
//! ```

use crate::engine::chunk::Origin;
use crate::lifecycle::instance;
use core::alloc::{GlobalAlloc, Layout};

/// Unit struct implementing [`GlobalAlloc`] over the explicit surface: the
/// layout is passed on both allocation and deallocation, so a mismatched
/// `dealloc` is caught by the size and alignment checks.
pub struct Hardmalloc;

unsafe impl GlobalAlloc for Hardmalloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        instance().allocate(layout.size(), layout.align(), Origin::Explicit, false)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        instance().allocate(layout.size(), layout.align(), Origin::Explicit, true)
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        instance().deallocate(ptr, Origin::Explicit, Some(layout.size()), Some(layout.align()));
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        instance().reallocate(ptr, Origin::Explicit, new_size, layout.align())
    }
}

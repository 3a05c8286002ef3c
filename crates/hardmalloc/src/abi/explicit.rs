//! Size- and alignment-aware C entry points, for callers that know the
//! layout of every allocation (Rust, C++ sized delete).

use crate::engine::chunk::Origin;
use crate::lifecycle::instance;
use crate::util::MIN_ALIGN;
use core::ffi::c_void;

/// Minimum alignment of every chunk.
#[no_mangle]
pub static HARDMALLOC_MIN_ALIGN: usize = MIN_ALIGN;

/// Callback type of [`hardmalloc_iterate`]: `(base, size, arg)`.
pub type ChunkCallback = unsafe extern "C" fn(base: usize, size: usize, arg: *mut c_void);

/// Allocate `size` bytes aligned to `alignment`. Returns null when memory
/// is exhausted; a non-power-of-two alignment aborts.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_allocate(size: usize, alignment: usize) -> *mut c_void {
    instance().allocate(size, alignment, Origin::Explicit, false) as *mut c_void
}

/// Release a chunk from [`hardmalloc_allocate`]. `size` and `alignment` must
/// be the values it was allocated with; a mismatch aborts.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_deallocate(ptr: *mut c_void, size: usize, alignment: usize) {
    instance().deallocate(ptr as *mut u8, Origin::Explicit, Some(size), Some(alignment));
}

/// Call `callback(base, size, arg)` for every live chunk. The caller must
/// hold the allocator disabled.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_iterate(callback: Option<ChunkCallback>, arg: *mut c_void) {
    let Some(callback) = callback else {
        return;
    };
    instance().iterate_over_chunks(0, usize::MAX, &mut |base, size| unsafe {
        callback(base, size, arg)
    });
}

#[no_mangle]
pub extern "C" fn hardmalloc_disable() {
    instance().disable();
}

#[no_mangle]
pub extern "C" fn hardmalloc_enable() {
    instance().enable();
}

#[no_mangle]
pub extern "C" fn hardmalloc_print_stats() {
    instance().print_stats();
}

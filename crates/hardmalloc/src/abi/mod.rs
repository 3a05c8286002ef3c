//! Calling conventions over the global instance.
//!
//! Both C surfaces are thin adapters: they translate arguments, call into
//! [`crate::lifecycle::instance`] and translate the result back.

#[cfg(feature = "explicit-abi")]
pub mod explicit;
#[cfg(feature = "libc-abi")]
pub mod libc;

use crate::lifecycle::instance;

/// Re-enables the allocator when dropped, so a panicking chunk visitor does
/// not leave every engine lock held.
struct EnableOnDrop;

impl Drop for EnableOnDrop {
    fn drop(&mut self) {
        instance().enable();
    }
}

/// Visit every live chunk as `(user address, requested size)`.
///
/// The allocator is disabled for the duration of the walk: `f` must not
/// allocate or free through this allocator, or it deadlocks.
pub fn map_chunks(f: &mut dyn FnMut(usize, usize)) {
    let allocator = instance();
    allocator.disable();
    let _enable = EnableOnDrop;
    unsafe {
        allocator.iterate_over_chunks(0, usize::MAX, f);
    }
}

/// Write allocator statistics to stderr.
pub fn print_stats() {
    instance().print_stats();
}

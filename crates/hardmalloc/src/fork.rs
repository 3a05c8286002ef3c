//! Fork safety.
//!
//! The pre-fork handler disables the allocator, so every engine lock is held
//! by the forking thread when the address space is copied. Both the parent
//! and the child then re-enable it. The child therefore never inherits a
//! lock owned by a thread that does not exist on its side.

use crate::error::Violation;
use crate::lifecycle;
use crate::report::fatal;
use core::sync::atomic::{AtomicUsize, Ordering};

static FORK_GENERATION: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn prefork() {
    lifecycle::instance().disable();
}

unsafe extern "C" fn postfork_parent() {
    lifecycle::instance().enable();
}

unsafe extern "C" fn postfork_child() {
    lifecycle::instance().enable();
    FORK_GENERATION.fetch_add(1, Ordering::Relaxed);
}

/// Number of times this process image has run the post-fork child handler.
pub fn fork_generation() -> usize {
    FORK_GENERATION.load(Ordering::Relaxed)
}

/// Register the pre-fork, parent and child handlers. Failure is fatal.
pub(crate) fn register() {
    let rc = unsafe {
        libc::pthread_atfork(Some(prefork), Some(postfork_parent), Some(postfork_child))
    };
    if rc != 0 {
        fatal(Violation::ForkHandlerRegistration { code: rc });
    }
}

//! Allocation sampling hook.
//!
//! With a non-zero rate, every `rate`-th allocation is served from its own
//! guarded mapping with the user data pushed against the trailing guard
//! page, so a linear overflow faults on the first byte past the chunk.

use core::sync::atomic::{AtomicUsize, Ordering};

static RATE: AtomicUsize = AtomicUsize::new(0);
static COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Install the sampling rate. 0 turns sampling off.
pub fn init(rate: usize) {
    COUNTER.store(0, Ordering::Relaxed);
    RATE.store(rate, Ordering::Relaxed);
}

pub fn rate() -> usize {
    RATE.load(Ordering::Relaxed)
}

#[inline]
pub fn should_sample() -> bool {
    let rate = RATE.load(Ordering::Relaxed);
    if rate == 0 {
        return false;
    }
    COUNTER.fetch_add(1, Ordering::Relaxed) % rate == rate - 1
}

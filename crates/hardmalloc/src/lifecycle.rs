//! The process-wide allocator instance and its one-time initialization.

use crate::config::{self, DEFAULT_CONFIG};
use crate::engine::Allocator;
use crate::error::Violation;
use crate::report::{self, fatal};
use crate::{fork, logger, sampling};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);
static POST_INIT_DONE: AtomicBool = AtomicBool::new(false);

static ALLOCATOR: Allocator = Allocator::new(&DEFAULT_CONFIG, post_init);

/// Library constructor, runs before `main`.
#[used]
#[cfg_attr(any(target_os = "linux", target_os = "android"), link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        ensure_initialized();
    }
    init
};

/// The global allocator instance, initialized on first use.
#[inline(always)]
pub fn instance() -> &'static Allocator {
    if INIT_STATE.load(Ordering::Acquire) != READY {
        ensure_initialized();
    }
    &ALLOCATOR
}

#[inline]
pub fn is_ready() -> bool {
    INIT_STATE.load(Ordering::Acquire) == READY
}

/// Initialize the instance if nobody has yet. Concurrent callers wait for
/// the winner to finish.
#[cold]
#[inline(never)]
pub fn ensure_initialized() {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(INITIALIZING) => {
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return;
        }
        Err(_) => return,
    }

    let (options, unrecognized) = match unsafe { config::load_options() } {
        Ok(loaded) => loaded,
        Err(err) => fatal(Violation::InvalidConfiguration(err)),
    };
    unsafe {
        ALLOCATOR.init(options);
    }
    INIT_STATE.store(READY, Ordering::Release);

    // Everything below may allocate through a host logger.
    if unrecognized > 0 {
        report::warn(format_args!("found {unrecognized} unrecognized option(s)"));
    }
    if options.log_level > 0 {
        logger::init(logger::level_from_verbosity(options.log_level));
    }
    log::info!("allocator ready");
    log::debug!("effective options: {options:?}");
    log::debug!(
        "post-init: sampling rate {}, fork handlers registered",
        sampling::rate()
    );
}

/// Post-initialization callback of the global instance: installs the
/// sampling hook and registers the fork handlers. Invoked by
/// [`Allocator::init`]; a second invocation is fatal.
///
/// # Safety
/// Must only be invoked by the allocator's initialization path.
pub unsafe extern "C" fn post_init() {
    if POST_INIT_DONE.swap(true, Ordering::AcqRel) {
        fatal(Violation::PostInitTwice);
    }
    sampling::init(ALLOCATOR.options().sampling_rate);
    fork::register();
}

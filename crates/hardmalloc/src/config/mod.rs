//! Allocator configuration.
//!
//! Two layers: the [`StaticConfig`] compiled into the global instance, and
//! the runtime [`Options`] read once during initialization. Neither layer
//! allocates.

pub mod options;

pub use options::Options;

use crate::engine::size_class::DEFAULT_SIZE_CLASSES;
use crate::sync::RawMutex;
use crate::util::{is_aligned, MIN_ALIGN, MIN_ALIGNMENT_LOG};
use core::cell::UnsafeCell;
use thiserror::Error;

/// Maximum number of primary size classes an instance may be configured
/// with. Class ids are stored in 8 header bits, with 0 reserved for the
/// secondary.
pub const MAX_SIZE_CLASSES: usize = 64;

/// Requested sizes are stored in 36 header bits.
pub const HEADER_SIZE_BITS: u32 = 36;

/// Largest usable `max_size_log`: the header width, or one bit short of the
/// address width on targets where that is smaller.
pub const MAX_SIZE_LOG: u32 = if usize::BITS > HEADER_SIZE_BITS {
    HEADER_SIZE_BITS
} else {
    usize::BITS - 1
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("size class table is empty")]
    NoSizeClasses,

    #[error("too many size classes: {count} (maximum {max})")]
    TooManySizeClasses { count: usize, max: usize },

    #[error("size class {index} ({size} bytes) is not a multiple of {align}")]
    UnalignedSizeClass {
        index: usize,
        size: usize,
        align: usize,
    },

    #[error("size classes are not strictly increasing at index {index}")]
    UnsortedSizeClasses { index: usize },

    #[error("primary span of {span} bytes cannot hold 8 blocks of {size} bytes")]
    SpanTooSmall { size: usize, span: usize },

    #[error("primary span size {span} is not a multiple of the page size {page}")]
    UnalignedSpan { span: usize, page: usize },

    #[error("maximum alignment log {0} is out of range")]
    MaxAlignmentLog(u32),

    #[error("maximum size log {0} is out of range")]
    MaxSizeLog(u32),

    #[error("malformed value for option `{name}`")]
    MalformedValue { name: &'static str },

    #[error("value for option `{name}` is out of range")]
    ValueOutOfRange { name: &'static str },

    #[error("option without a value")]
    MissingValue,

    #[error("options string is not valid UTF-8")]
    NotUtf8,
}

/// Compile-time parameters of an allocator instance.
#[derive(Debug, Clone, Copy)]
pub struct StaticConfig {
    /// Primary block sizes, strictly increasing multiples of `MIN_ALIGN`.
    pub size_classes: &'static [usize],
    /// Bytes mapped per primary span.
    pub primary_span_size: usize,
    /// Guard pages on each side of a secondary chunk (feature `guard-pages`).
    pub secondary_guard_pages: usize,
    pub max_alignment_log: u32,
    pub max_size_log: u32,
}

pub static DEFAULT_CONFIG: StaticConfig = StaticConfig {
    size_classes: &DEFAULT_SIZE_CLASSES,
    primary_span_size: 256 * 1024,
    secondary_guard_pages: 1,
    max_alignment_log: 24,
    max_size_log: MAX_SIZE_LOG,
};

impl StaticConfig {
    pub const fn max_alignment(&self) -> usize {
        1 << self.max_alignment_log
    }

    pub const fn max_size(&self) -> usize {
        (1 << self.max_size_log) - 1
    }

    pub fn largest_class(&self) -> usize {
        match self.size_classes.last() {
            Some(&size) => size,
            None => 0,
        }
    }

    pub fn validate(&self, page_size: usize) -> Result<(), ConfigError> {
        let classes = self.size_classes;
        if classes.is_empty() {
            return Err(ConfigError::NoSizeClasses);
        }
        if classes.len() > MAX_SIZE_CLASSES {
            return Err(ConfigError::TooManySizeClasses {
                count: classes.len(),
                max: MAX_SIZE_CLASSES,
            });
        }
        for (index, &size) in classes.iter().enumerate() {
            if size == 0 || !is_aligned(size, MIN_ALIGN) {
                return Err(ConfigError::UnalignedSizeClass {
                    index,
                    size,
                    align: MIN_ALIGN,
                });
            }
            if index > 0 && classes[index - 1] >= size {
                return Err(ConfigError::UnsortedSizeClasses { index });
            }
        }
        if !is_aligned(self.primary_span_size, page_size) {
            return Err(ConfigError::UnalignedSpan {
                span: self.primary_span_size,
                page: page_size,
            });
        }
        let largest = self.largest_class();
        if largest.saturating_mul(8) > self.primary_span_size {
            return Err(ConfigError::SpanTooSmall {
                size: largest,
                span: self.primary_span_size,
            });
        }
        if self.max_alignment_log < MIN_ALIGNMENT_LOG || self.max_alignment_log > 30 {
            return Err(ConfigError::MaxAlignmentLog(self.max_alignment_log));
        }
        if self.max_size_log < 20 || self.max_size_log > MAX_SIZE_LOG {
            return Err(ConfigError::MaxSizeLog(self.max_size_log));
        }
        Ok(())
    }
}

struct RegisteredDefaults {
    lock: RawMutex,
    options: UnsafeCell<Option<&'static str>>,
}

unsafe impl Sync for RegisteredDefaults {}

static REGISTERED_DEFAULTS: RegisteredDefaults = RegisteredDefaults {
    lock: RawMutex::new(),
    options: UnsafeCell::new(None),
};

/// Register program-provided default options, applied before
/// `HARDMALLOC_OPTIONS`. Usually emitted by `#[hardmalloc_options(...)]`.
///
/// Returns false and has no effect once the allocator is initialized.
pub fn register_default_options(options: &'static str) -> bool {
    if crate::lifecycle::is_ready() {
        log::warn!("default options registered after initialization are ignored");
        return false;
    }
    REGISTERED_DEFAULTS.lock.lock();
    unsafe {
        *REGISTERED_DEFAULTS.options.get() = Some(options);
    }
    REGISTERED_DEFAULTS.lock.unlock();
    true
}

pub fn registered_default_options() -> Option<&'static str> {
    REGISTERED_DEFAULTS.lock.lock();
    let options = unsafe { *REGISTERED_DEFAULTS.options.get() };
    REGISTERED_DEFAULTS.lock.unlock();
    options
}

/// Resolve the effective runtime options: built-in defaults, then the
/// registered defaults, then `HARDMALLOC_OPTIONS`. Returns the options and
/// the number of unrecognized option names.
///
/// # Safety
/// Calls `libc::getenv`; must not race with environment mutation.
pub unsafe fn load_options() -> Result<(Options, usize), ConfigError> {
    let mut options = Options::DEFAULT;
    let mut unrecognized = 0;
    if let Some(defaults) = registered_default_options() {
        unrecognized += options.parse(defaults)?;
    }
    if let Some(env) = options::from_environment()? {
        unrecognized += options.parse(env)?;
    }
    Ok((options, unrecognized))
}

use core::sync::atomic::{AtomicUsize, Ordering};

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Overflow-checked [`align_up`].
#[inline(always)]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// log2 of the minimum alignment of every chunk.
pub const MIN_ALIGNMENT_LOG: u32 = 4;

/// Minimum alignment for all allocations (matches max_align_t on 64-bit).
pub const MIN_ALIGN: usize = 1 << MIN_ALIGNMENT_LOG;

/// Initialized to 4096 so `page_size()` never returns zero before init.
static PAGE_SIZE_CACHED: AtomicUsize = AtomicUsize::new(4096);

/// Initialize the page size from the OS. Must be called once during init.
///
/// # Safety
/// Must be called from single-threaded context (init).
pub unsafe fn init_page_size() {
    let ps = libc::sysconf(libc::_SC_PAGESIZE);
    let ps = if ps > 0 { ps as usize } else { 4096 };
    PAGE_SIZE_CACHED.store(ps, Ordering::Release);
}

/// System page size (4096 until `init_page_size` has run).
#[inline(always)]
pub fn page_size() -> usize {
    PAGE_SIZE_CACHED.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(32, 16), 32);
        assert_eq!(align_down(47, 16), 32);
        assert!(is_aligned(4096, 4096));
        assert!(!is_aligned(4095, 16));
        assert_eq!(checked_align_up(usize::MAX - 3, 16), None);
        assert_eq!(checked_align_up(17, 16), Some(32));
    }

    #[test]
    fn page_size_is_power_of_two() {
        unsafe { init_page_size() };
        assert!(page_size().is_power_of_two());
        assert!(page_size() >= 4096);
    }
}

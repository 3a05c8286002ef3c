//! Thin OS layer: anonymous mappings, page protection, entropy, errno and
//! raw stderr writes. Nothing here allocates.

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod linux;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map anonymous memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    let result = libc::mmap(
        core::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if result == libc::MAP_FAILED {
        core::ptr::null_mut()
    } else {
        result as *mut u8
    }
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    libc::munmap(ptr as *mut libc::c_void, size);
}

/// Protect a memory region as inaccessible (guard page).
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) {
    libc::mprotect(ptr as *mut libc::c_void, size, libc::PROT_NONE);
}

/// Set the calling thread's `errno`.
#[inline]
pub fn set_errno(value: libc::c_int) {
    unsafe {
        *sys::errno_location() = value;
    }
}

/// Write all of `bytes` to stderr, retrying on short writes and EINTR.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let n = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len(),
            )
        };
        if n > 0 {
            bytes = &bytes[n as usize..];
        } else if n < 0 && unsafe { *sys::errno_location() } == libc::EINTR {
            continue;
        } else {
            return;
        }
    }
}

/// 64 bits of OS entropy, falling back to a mixed stack/counter value when
/// the OS source is unavailable (early boot, seccomp).
pub fn random_u64() -> u64 {
    match sys::os_random_u64() {
        Some(v) => v,
        None => fallback_random_u64(),
    }
}

fn fallback_random_u64() -> u64 {
    static COUNTER: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    let stack_addr = &count as *const _ as u64;
    let time = unsafe { libc::time(core::ptr::null_mut()) } as u64;
    let mut x = stack_addr
        .wrapping_mul(0x517cc1b727220a95)
        .wrapping_add(count)
        ^ time.rotate_left(32);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_unmap_page() {
        unsafe {
            let p = map_anonymous(4096);
            assert!(!p.is_null());
            // Fresh anonymous mappings are zero-filled.
            assert_eq!(p.read(), 0);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
            unmap(p, 4096);
        }
    }

    #[test]
    fn random_values_differ() {
        let a = random_u64();
        let b = random_u64();
        assert_ne!(a, b);
    }

    #[test]
    fn errno_round_trip() {
        set_errno(libc::ENOMEM);
        assert_eq!(unsafe { *sys::errno_location() }, libc::ENOMEM);
        set_errno(0);
    }
}

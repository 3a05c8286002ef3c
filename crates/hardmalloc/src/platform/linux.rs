/// Address of the calling thread's `errno`.
#[cfg(target_os = "linux")]
#[inline]
pub fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(target_os = "android")]
#[inline]
pub fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno() }
}

/// Read 8 bytes from `getrandom(2)` without blocking.
pub fn os_random_u64() -> Option<u64> {
    let mut buf = [0u8; 8];
    let n = unsafe {
        libc::syscall(
            libc::SYS_getrandom,
            buf.as_mut_ptr(),
            buf.len(),
            libc::GRND_NONBLOCK,
        )
    };
    if n == buf.len() as libc::c_long {
        Some(u64::from_ne_bytes(buf))
    } else {
        None
    }
}

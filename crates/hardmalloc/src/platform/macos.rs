#[inline]
pub fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

pub fn os_random_u64() -> Option<u64> {
    let mut buf = [0u8; 8];
    let ret = unsafe { libc::getentropy(buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if ret == 0 {
        Some(u64::from_ne_bytes(buf))
    } else {
        None
    }
}

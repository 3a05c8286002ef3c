//! Non-allocating diagnostics. Messages are formatted into a fixed stack
//! buffer and written to fd 2 in one piece.

use crate::error::Violation;
use crate::platform;
use core::fmt;

/// Fixed-capacity `fmt::Write` sink. Output past `N` bytes is dropped.
pub struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        // Only whole chars are ever copied in, see `write_str`.
        core::str::from_utf8(self.as_bytes()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl<const N: usize> Default for StackWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// `fmt::Write` sink that goes straight to stderr. Used for output whose
/// length is not bounded, like the stats report.
pub struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        platform::write_stderr(s.as_bytes());
        Ok(())
    }
}

/// Report a fatal violation and abort the process.
#[cold]
#[inline(never)]
pub fn fatal(violation: Violation) -> ! {
    let mut w = StackWriter::<512>::new();
    let _ = fmt::write(&mut w, format_args!("hardmalloc ERROR: {violation}\n"));
    platform::write_stderr(w.as_bytes());
    unsafe { libc::abort() }
}

/// Print a one-line warning. Never aborts.
#[cold]
pub fn warn(args: fmt::Arguments<'_>) {
    let mut w = StackWriter::<512>::new();
    let _ = fmt::write(&mut w, format_args!("hardmalloc WARNING: {args}\n"));
    platform::write_stderr(w.as_bytes());
}

//! mmap-backed allocator for chunks that do not fit a size class.
//!
//! Layout of one mapping:
//!
//! ```text
//! [guard pages] [LargeBlock | block ............ ] [guard pages]
//!                            ^ block      block_end ^
//! ```
//!
//! Live mappings are kept on a doubly linked list so they can be walked and
//! locked together with the rest of the engine.

use crate::platform;
use crate::sync::RawMutex;
use crate::util::{checked_align_up, page_size};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

const LARGE_HEADER_SIZE: usize = 64;

#[repr(C)]
struct LargeBlock {
    prev: *mut LargeBlock,
    next: *mut LargeBlock,
    map_base: *mut u8,
    map_size: usize,
    block_end: usize,
}

impl LargeBlock {
    unsafe fn from_block(block: *mut u8) -> *mut LargeBlock {
        block.sub(LARGE_HEADER_SIZE) as *mut LargeBlock
    }

    unsafe fn block(this: *mut LargeBlock) -> *mut u8 {
        (this as *mut u8).add(LARGE_HEADER_SIZE)
    }
}

/// A mapping handed out by [`Secondary::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct LargeAlloc {
    pub block: *mut u8,
    pub block_end: usize,
    pub mapped: usize,
}

pub struct Secondary {
    lock: RawMutex,
    head: UnsafeCell<*mut LargeBlock>,
    in_use: AtomicUsize,
    mapped_bytes: AtomicUsize,
}

unsafe impl Send for Secondary {}
unsafe impl Sync for Secondary {}

impl Secondary {
    pub const fn new() -> Self {
        Secondary {
            lock: RawMutex::new(),
            head: UnsafeCell::new(ptr::null_mut()),
            in_use: AtomicUsize::new(0),
            mapped_bytes: AtomicUsize::new(0),
        }
    }

    /// Map a block of at least `needed` bytes with `guard_pages` inaccessible
    /// pages on each side. The block end is page aligned and borders the
    /// trailing guard. `commit` runs once the block is on the in-use list,
    /// before the list lock is dropped.
    pub unsafe fn allocate<R>(
        &self,
        needed: usize,
        guard_pages: usize,
        commit: impl FnOnce(LargeAlloc) -> R,
    ) -> Option<R> {
        let page = page_size();
        let body = checked_align_up(needed.checked_add(LARGE_HEADER_SIZE)?, page)?;
        let guard = guard_pages.checked_mul(page)?;
        let map_size = body.checked_add(guard.checked_mul(2)?)?;

        let base = platform::map_anonymous(map_size);
        if base.is_null() {
            return None;
        }
        if guard > 0 {
            platform::protect_none(base, guard);
            platform::protect_none(base.add(guard + body), guard);
        }

        let large = base.add(guard) as *mut LargeBlock;
        let block_end = large as usize + body;
        large.write(LargeBlock {
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            map_base: base,
            map_size,
            block_end,
        });

        self.lock.lock();
        let head = &mut *self.head.get();
        (*large).next = *head;
        if !head.is_null() {
            (**head).prev = large;
        }
        *head = large;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.mapped_bytes.fetch_add(map_size, Ordering::Relaxed);
        let result = commit(LargeAlloc {
            block: LargeBlock::block(large),
            block_end,
            mapped: map_size,
        });
        self.lock.unlock();
        Some(result)
    }

    /// Run `f` with the list lock held.
    pub fn with_locked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock.lock();
        let result = f();
        self.lock.unlock();
        result
    }

    /// Run `retire`, then unlink, under the list lock; unmap afterwards.
    /// Returns the number of bytes unmapped.
    ///
    /// # Safety
    /// `block` must come from [`Secondary::allocate`] and not be released yet.
    pub unsafe fn release(&self, block: *mut u8, retire: impl FnOnce()) -> usize {
        let large = LargeBlock::from_block(block);

        self.lock.lock();
        retire();
        let head = &mut *self.head.get();
        let prev = (*large).prev;
        let next = (*large).next;
        if prev.is_null() {
            *head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        self.lock.unlock();

        let map_base = (*large).map_base;
        let map_size = (*large).map_size;
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.mapped_bytes.fetch_sub(map_size, Ordering::Relaxed);
        platform::unmap(map_base, map_size);
        map_size
    }

    /// # Safety
    /// `block` must be a live secondary block.
    pub unsafe fn block_end(block: *mut u8) -> usize {
        (*LargeBlock::from_block(block)).block_end
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    /// # Safety
    /// Caller holds the secondary lock (see [`Secondary::lock`]).
    pub unsafe fn for_each_block(&self, f: &mut dyn FnMut(*mut u8)) {
        let mut large = *self.head.get();
        while !large.is_null() {
            f(LargeBlock::block(large));
            large = (*large).next;
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes.load(Ordering::Relaxed)
    }
}

impl Default for Secondary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::align_up;

    fn committed_size(needed: usize) -> usize {
        align_up(needed + LARGE_HEADER_SIZE, page_size())
    }

    #[test]
    fn block_end_borders_page() {
        let secondary = Secondary::new();
        unsafe {
            let large = secondary.allocate(100_000, 1, |l| l).unwrap();
            assert_eq!(large.block_end % page_size(), 0);
            assert!(large.block_end - large.block as usize >= 100_000);
            assert_eq!(Secondary::block_end(large.block), large.block_end);
            assert_eq!(
                large.mapped,
                committed_size(100_000) + 2 * page_size()
            );
            large.block.write_bytes(0x5a, 100_000);
            assert_eq!(secondary.in_use(), 1);
            let mut retired = false;
            let unmapped = secondary.release(large.block, || retired = secondary.lock.is_locked());
            assert!(retired, "retire ran outside the list lock");
            assert_eq!(unmapped, large.mapped);
            assert_eq!(secondary.in_use(), 0);
            assert_eq!(secondary.mapped_bytes(), 0);
        }
    }

    #[test]
    fn walks_live_blocks() {
        let secondary = Secondary::new();
        unsafe {
            let a = secondary.allocate(20_000, 0, |l| l).unwrap();
            let b = secondary.allocate(30_000, 0, |l| l).unwrap();
            let c = secondary.allocate(40_000, 0, |l| l).unwrap();
            secondary.release(b.block, || {});

            secondary.lock();
            let mut seen = Vec::new();
            secondary.for_each_block(&mut |block| seen.push(block));
            secondary.unlock();
            assert_eq!(seen, vec![c.block, a.block]);

            secondary.release(a.block, || {});
            secondary.release(c.block, || {});
        }
    }

    #[test]
    fn overflowing_request_fails() {
        let secondary = Secondary::new();
        unsafe {
            assert!(secondary.allocate(usize::MAX - 8, 1, |l| l).is_none());
        }
    }
}

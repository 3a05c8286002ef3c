//! Size-class backed allocator for small chunks.
//!
//! Each class owns a region: a lock, a LIFO free list of released blocks and
//! a chain of spans carved front to back. Spans are never returned to the OS.

use super::chunk;
use super::stats::ClassStats;
use crate::config::MAX_SIZE_CLASSES;
use crate::platform;
use crate::sync::RawMutex;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Bytes reserved at the start of every span for [`SpanHeader`].
const SPAN_HEADER_SIZE: usize = 64;

#[repr(C)]
struct SpanHeader {
    next: *mut SpanHeader,
    capacity: usize,
    carved: usize,
}

impl SpanHeader {
    unsafe fn block(span: *mut SpanHeader, index: usize, block_size: usize) -> *mut u8 {
        (span as *mut u8).add(SPAN_HEADER_SIZE + index * block_size)
    }
}

struct RegionInner {
    spans: *mut SpanHeader,
    free_list: *mut u8,
}

/// A block handed out by [`Primary::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub ptr: *mut u8,
    /// Straight from a fresh mapping, so already zero-filled.
    pub fresh: bool,
    /// Bytes newly mapped to serve this request.
    pub mapped: usize,
}

pub struct ClassRegion {
    lock: RawMutex,
    inner: UnsafeCell<RegionInner>,
    in_use: AtomicUsize,
    carved: AtomicUsize,
    spans: AtomicUsize,
}

unsafe impl Send for ClassRegion {}
unsafe impl Sync for ClassRegion {}

impl ClassRegion {
    const fn new() -> Self {
        ClassRegion {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(RegionInner {
                spans: ptr::null_mut(),
                free_list: ptr::null_mut(),
            }),
            in_use: AtomicUsize::new(0),
            carved: AtomicUsize::new(0),
            spans: AtomicUsize::new(0),
        }
    }

    /// Pop a released block, or carve one, and hand it to `commit` before
    /// the region lock is dropped.
    unsafe fn allocate<R>(
        &self,
        block_size: usize,
        span_size: usize,
        commit: impl FnOnce(Block) -> R,
    ) -> Option<R> {
        self.lock.lock();
        let inner = &mut *self.inner.get();
        let mut mapped = 0;

        let found = if !inner.free_list.is_null() {
            let block = inner.free_list;
            inner.free_list = (chunk::user_for_block(block) as *mut *mut u8).read();
            Some((block, false))
        } else {
            let span = inner.spans;
            if !span.is_null() && (*span).carved < (*span).capacity {
                let block = SpanHeader::block(span, (*span).carved, block_size);
                (*span).carved += 1;
                self.carved.fetch_add(1, Ordering::Relaxed);
                Some((block, true))
            } else {
                let span = platform::map_anonymous(span_size) as *mut SpanHeader;
                if span.is_null() {
                    None
                } else {
                    span.write(SpanHeader {
                        next: inner.spans,
                        capacity: (span_size - SPAN_HEADER_SIZE) / block_size,
                        carved: 1,
                    });
                    inner.spans = span;
                    mapped = span_size;
                    self.spans.fetch_add(1, Ordering::Relaxed);
                    self.carved.fetch_add(1, Ordering::Relaxed);
                    Some((SpanHeader::block(span, 0, block_size), true))
                }
            }
        };

        let result = found.map(|(ptr, fresh)| {
            self.in_use.fetch_add(1, Ordering::Relaxed);
            commit(Block { ptr, fresh, mapped })
        });
        self.lock.unlock();
        result
    }

    /// Run `retire` (which marks the header available so chunk walks skip
    /// the block), then push the block onto the free list, all under the
    /// region lock.
    unsafe fn release(&self, block: *mut u8, retire: impl FnOnce()) {
        self.lock.lock();
        retire();
        let inner = &mut *self.inner.get();
        (chunk::user_for_block(block) as *mut *mut u8).write(inner.free_list);
        inner.free_list = block;
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.lock.unlock();
    }

    /// Visit every carved block. Caller holds the region lock.
    unsafe fn for_each_block(&self, block_size: usize, f: &mut dyn FnMut(*mut u8)) {
        let mut span = (*self.inner.get()).spans;
        while !span.is_null() {
            for index in 0..(*span).carved {
                f(SpanHeader::block(span, index, block_size));
            }
            span = (*span).next;
        }
    }

    fn stats(&self, block_size: usize) -> ClassStats {
        ClassStats {
            block_size,
            in_use: self.in_use.load(Ordering::Relaxed),
            carved: self.carved.load(Ordering::Relaxed),
            spans: self.spans.load(Ordering::Relaxed),
        }
    }
}

pub struct Primary {
    regions: [ClassRegion; MAX_SIZE_CLASSES],
}

impl Primary {
    pub const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: ClassRegion = ClassRegion::new();
        Primary {
            regions: [EMPTY; MAX_SIZE_CLASSES],
        }
    }

    /// Take a block of class `class` and run `commit` on it while the class
    /// lock is still held, so a disabled engine never exposes a block
    /// without its header.
    ///
    /// # Safety
    /// `class` must index the configured table and `block_size` must be its
    /// block size.
    pub unsafe fn allocate<R>(
        &self,
        class: usize,
        block_size: usize,
        span_size: usize,
        commit: impl FnOnce(Block) -> R,
    ) -> Option<R> {
        self.regions[class].allocate(block_size, span_size, commit)
    }

    /// Return a block to its class. `retire` runs first, under the class
    /// lock, so a disabled engine never sees a chunk leave the heap.
    ///
    /// # Safety
    /// `block` must have come from `allocate` on the same class.
    pub unsafe fn release(&self, class: usize, block: *mut u8, retire: impl FnOnce()) {
        self.regions[class].release(block, retire)
    }

    /// Run `f` with the lock of `class` held.
    pub fn with_class_locked<R>(&self, class: usize, f: impl FnOnce() -> R) -> R {
        let region = &self.regions[class];
        region.lock.lock();
        let result = f();
        region.lock.unlock();
        result
    }

    /// Acquire every region lock, lowest class first.
    pub fn lock_all(&self, classes: usize) {
        for region in &self.regions[..classes] {
            region.lock.lock();
        }
    }

    /// Release every region lock, highest class first.
    pub fn unlock_all(&self, classes: usize) {
        for region in self.regions[..classes].iter().rev() {
            region.lock.unlock();
        }
    }

    /// # Safety
    /// Caller holds every region lock (see [`Primary::lock_all`]).
    pub unsafe fn for_each_block(&self, size_classes: &[usize], f: &mut dyn FnMut(*mut u8)) {
        for (region, &block_size) in self.regions.iter().zip(size_classes) {
            region.for_each_block(block_size, f);
        }
    }

    pub fn class_stats(&self, class: usize, block_size: usize) -> ClassStats {
        self.regions[class].stats(block_size)
    }
}

impl Default for Primary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::chunk::HEADER_SIZE;

    const SPAN: usize = 64 * 1024;

    #[test]
    fn carves_then_reuses() {
        let primary = Primary::new();
        unsafe {
            let a = primary.allocate(0, 64, SPAN, |b| b).unwrap();
            assert!(a.fresh);
            assert_eq!(a.mapped, SPAN);
            let b = primary.allocate(0, 64, SPAN, |b| b).unwrap();
            assert!(b.fresh);
            assert_eq!(b.mapped, 0);
            assert_eq!(b.ptr as usize - a.ptr as usize, 64);

            let mut retired = false;
            primary.release(0, a.ptr, || retired = primary.regions[0].lock.is_locked());
            assert!(retired, "retire ran outside the class lock");
            let c = primary.allocate(0, 64, SPAN, |b| b).unwrap();
            assert_eq!(c.ptr, a.ptr);
            assert!(!c.fresh);

            let stats = primary.class_stats(0, 64);
            assert_eq!(stats.in_use, 2);
            assert_eq!(stats.carved, 2);
            assert_eq!(stats.spans, 1);
        }
    }

    #[test]
    fn opens_new_span_when_full() {
        let primary = Primary::new();
        let block_size = 16384;
        let capacity = (SPAN - SPAN_HEADER_SIZE) / block_size;
        unsafe {
            for _ in 0..capacity {
                primary.allocate(1, block_size, SPAN, |b| b).unwrap();
            }
            assert_eq!(primary.class_stats(1, block_size).spans, 1);
            let block = primary.allocate(1, block_size, SPAN, |b| b).unwrap();
            assert!(block.fresh);
            assert_eq!(block.mapped, SPAN);
            assert_eq!(primary.class_stats(1, block_size).spans, 2);
        }
    }

    #[test]
    fn class_lock_is_held_inside_closure() {
        let primary = Primary::new();
        assert!(primary.with_class_locked(3, || primary.regions[3].lock.is_locked()));
        assert!(!primary.regions[3].lock.is_locked());
    }

    #[test]
    fn walks_carved_blocks() {
        let primary = Primary::new();
        let classes = [32usize, 48];
        unsafe {
            for _ in 0..5 {
                primary.allocate(0, 32, SPAN, |b| b).unwrap();
            }
            primary.allocate(1, 48, SPAN, |b| b).unwrap();
            primary.lock_all(classes.len());
            let mut count = 0;
            primary.for_each_block(&classes, &mut |block| {
                assert_eq!(block as usize % 16, 0);
                assert_eq!(chunk::user_for_block(block), block.add(HEADER_SIZE));
                count += 1;
            });
            primary.unlock_all(classes.len());
            assert_eq!(count, 6);
        }
    }
}

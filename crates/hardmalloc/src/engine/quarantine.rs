use crate::sync::RawMutex;
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

const QUARANTINE_SLOTS: usize = 4096;

#[derive(Clone, Copy)]
struct QuarantineEntry {
    user: *mut u8,
    size: usize,
}

struct QuarantineInner {
    entries: [QuarantineEntry; QUARANTINE_SLOTS],
    head: usize,
    count: usize,
}

/// FIFO that delays reuse of freed chunks.
///
/// Entries are evicted oldest first once the byte budget is exceeded, or
/// displaced when every slot is taken. Evicted chunks are handed to a
/// recycle callback while the quarantine lock is still held; the callback
/// may take class locks, which always come after this one.
pub struct Quarantine {
    lock: RawMutex,
    inner: UnsafeCell<QuarantineInner>,
    max_bytes: AtomicUsize,
    max_chunk_size: AtomicUsize,
    bytes: AtomicUsize,
    chunks: AtomicUsize,
}

unsafe impl Send for Quarantine {}
unsafe impl Sync for Quarantine {}

impl Quarantine {
    pub const fn new() -> Self {
        const EMPTY: QuarantineEntry = QuarantineEntry {
            user: ptr::null_mut(),
            size: 0,
        };
        Quarantine {
            lock: RawMutex::new(),
            inner: UnsafeCell::new(QuarantineInner {
                entries: [EMPTY; QUARANTINE_SLOTS],
                head: 0,
                count: 0,
            }),
            max_bytes: AtomicUsize::new(0),
            max_chunk_size: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            chunks: AtomicUsize::new(0),
        }
    }

    pub fn configure(&self, max_bytes: usize, max_chunk_size: usize) {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
        self.max_chunk_size.store(max_chunk_size, Ordering::Relaxed);
    }

    /// Whether a chunk of `size` bytes should be quarantined at all.
    #[inline]
    pub fn accepts(&self, size: usize) -> bool {
        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        max_bytes > 0 && size <= self.max_chunk_size.load(Ordering::Relaxed) && size <= max_bytes
    }

    /// Quarantine a chunk. Under the quarantine lock: run `retire`, append
    /// the chunk, then hand every entry that no longer fits (the oldest one
    /// when the ring is full, then the oldest ones while over budget) to
    /// `recycle`.
    pub fn push(
        &self,
        user: *mut u8,
        size: usize,
        retire: impl FnOnce(),
        recycle: &mut dyn FnMut(*mut u8, usize),
    ) {
        self.lock.lock();
        retire();
        let inner = unsafe { &mut *self.inner.get() };
        if inner.count == QUARANTINE_SLOTS {
            let (old, old_size) = self.pop_front(inner);
            recycle(old, old_size);
        }
        let tail = (inner.head + inner.count) % QUARANTINE_SLOTS;
        inner.entries[tail] = QuarantineEntry { user, size };
        inner.count += 1;
        self.bytes.fetch_add(size, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
        while inner.count > 0
            && self.bytes.load(Ordering::Relaxed) > self.max_bytes.load(Ordering::Relaxed)
        {
            let (old, old_size) = self.pop_front(inner);
            recycle(old, old_size);
        }
        self.lock.unlock();
    }

    /// Hand every entry to `recycle`, oldest first. Returns the count.
    pub fn drain(&self, recycle: &mut dyn FnMut(*mut u8, usize)) -> usize {
        self.lock.lock();
        let inner = unsafe { &mut *self.inner.get() };
        let mut drained = 0;
        while inner.count > 0 {
            let (old, old_size) = self.pop_front(inner);
            recycle(old, old_size);
            drained += 1;
        }
        self.lock.unlock();
        drained
    }

    fn pop_front(&self, inner: &mut QuarantineInner) -> (*mut u8, usize) {
        let entry = inner.entries[inner.head];
        inner.head = (inner.head + 1) % QUARANTINE_SLOTS;
        inner.count -= 1;
        self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
        self.chunks.fetch_sub(1, Ordering::Relaxed);
        (entry.user, entry.size)
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn chunks(&self) -> usize {
        self.chunks.load(Ordering::Relaxed)
    }
}

impl Default for Quarantine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(n: usize) -> *mut u8 {
        (0x10_0000 + n * 16) as *mut u8
    }

    #[test]
    fn disabled_by_default() {
        let q = Box::new(Quarantine::new());
        assert!(!q.accepts(16));
    }

    #[test]
    fn respects_chunk_limit() {
        let q = Box::new(Quarantine::new());
        q.configure(64 * 1024, 2048);
        assert!(q.accepts(2048));
        assert!(!q.accepts(2049));
    }

    fn push(q: &Quarantine, n: usize, size: usize) -> Vec<(*mut u8, usize)> {
        let mut recycled = Vec::new();
        q.push(fake(n), size, || {}, &mut |user, size| recycled.push((user, size)));
        recycled
    }

    #[test]
    fn evicts_oldest_when_over_budget() {
        let q = Box::new(Quarantine::new());
        q.configure(256, 256);
        assert!(push(&q, 0, 128).is_empty());
        assert!(push(&q, 1, 128).is_empty());
        assert_eq!(push(&q, 2, 128), vec![(fake(0), 128)]);
        assert_eq!(q.bytes(), 256);
        assert_eq!(q.chunks(), 2);
    }

    #[test]
    fn retire_runs_under_the_lock() {
        let q = Box::new(Quarantine::new());
        q.configure(1024, 256);
        let mut locked = false;
        q.push(fake(0), 64, || locked = q.lock.is_locked(), &mut |_, _| {});
        assert!(locked);
        assert!(!q.lock.is_locked());
    }

    #[test]
    fn drain_empties_oldest_first() {
        let q = Box::new(Quarantine::new());
        q.configure(1 << 20, 4096);
        for n in 0..10 {
            assert!(push(&q, n, 64).is_empty());
        }
        let mut seen = Vec::new();
        assert_eq!(q.drain(&mut |user, _| seen.push(user)), 10);
        assert_eq!(seen, (0..10).map(fake).collect::<Vec<_>>());
        assert_eq!(q.bytes(), 0);
        assert_eq!(q.chunks(), 0);
    }

    #[test]
    fn full_ring_displaces_oldest() {
        let q = Box::new(Quarantine::new());
        q.configure(usize::MAX, 16);
        for n in 0..QUARANTINE_SLOTS {
            assert!(push(&q, n, 1).is_empty());
        }
        assert_eq!(push(&q, QUARANTINE_SLOTS, 1), vec![(fake(0), 1)]);
        assert_eq!(q.chunks(), QUARANTINE_SLOTS);
    }
}

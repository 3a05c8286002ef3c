//! The hardened allocator engine.
//!
//! [`Allocator`] is built by a `const fn` so the process-wide instance can
//! live in a plain `static`. Small chunks come from per-class regions
//! ([`primary`]), everything else from individual mappings ([`secondary`]).
//! Every chunk carries a checksummed header ([`chunk`]) that is validated on
//! each release.

pub mod chunk;
pub mod primary;
pub mod quarantine;
pub mod secondary;
pub mod size_class;
pub mod stats;

use crate::config::{Options, StaticConfig, MAX_SIZE_CLASSES};
use crate::error::Violation;
use crate::platform;
use crate::report::{self, fatal};
use crate::sampling;
use crate::util::{align_down, align_up, init_page_size, is_aligned, page_size, MIN_ALIGN};
use chunk::{ChunkState, LoadedHeader, Origin, PackedHeader, RawHeader, HEADER_SIZE};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use primary::Primary;
use quarantine::Quarantine;
use secondary::Secondary;
use stats::{GlobalStats, StatsSnapshot};

/// Invoked once, at the end of [`Allocator::init`].
pub type PostInitCallback = unsafe extern "C" fn();

/// Set by the first instance to initialize. A second initialization in the
/// same process, on any instance, is fatal.
static INSTANCE_CLAIMED: AtomicBool = AtomicBool::new(false);

pub struct Allocator {
    config: &'static StaticConfig,
    post_init: PostInitCallback,
    initialized: AtomicBool,
    cookie: AtomicU64,
    options: UnsafeCell<Options>,
    primary: Primary,
    secondary: Secondary,
    quarantine: Quarantine,
    stats: GlobalStats,
}

unsafe impl Sync for Allocator {}

impl Allocator {
    pub const fn new(config: &'static StaticConfig, post_init: PostInitCallback) -> Self {
        Allocator {
            config,
            post_init,
            initialized: AtomicBool::new(false),
            cookie: AtomicU64::new(0),
            options: UnsafeCell::new(Options::DEFAULT),
            primary: Primary::new(),
            secondary: Secondary::new(),
            quarantine: Quarantine::new(),
            stats: GlobalStats::new(),
        }
    }

    /// Bring the instance to the ready state and run the post-init callback.
    ///
    /// # Safety
    /// Must not race with any other use of this instance.
    pub unsafe fn init(&self, options: Options) {
        if INSTANCE_CLAIMED.swap(true, Ordering::AcqRel) || self.initialized.load(Ordering::Acquire)
        {
            fatal(Violation::DoubleInitialization);
        }
        init_page_size();
        if let Err(err) = self.config.validate(page_size()) {
            fatal(Violation::InvalidConfiguration(err));
        }
        self.cookie.store(platform::random_u64() | 1, Ordering::Relaxed);
        *self.options.get() = options;
        self.quarantine
            .configure(options.quarantine_bytes(), options.quarantine_max_chunk_size);
        self.initialized.store(true, Ordering::Release);
        (self.post_init)();
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &'static StaticConfig {
        self.config
    }

    #[inline]
    pub fn options(&self) -> &Options {
        // Written once in `init`, before `initialized` is published.
        unsafe { &*self.options.get() }
    }

    #[inline]
    fn cookie(&self) -> u64 {
        self.cookie.load(Ordering::Relaxed)
    }

    fn class_count(&self) -> usize {
        self.config.size_classes.len().min(MAX_SIZE_CLASSES)
    }

    fn guard_pages(&self) -> usize {
        if cfg!(feature = "guard-pages") {
            self.config.secondary_guard_pages
        } else {
            0
        }
    }

    #[cold]
    fn failure(&self, violation: Violation) -> *mut u8 {
        if violation.is_allocation_failure() || self.options().may_return_null {
            ptr::null_mut()
        } else {
            fatal(violation)
        }
    }

    /// Allocate `size` bytes aligned to `alignment` (raised to `MIN_ALIGN`).
    /// Returns null when memory is exhausted or `size` is too large. An
    /// invalid alignment aborts unless `may_return_null` is set.
    ///
    /// # Safety
    /// The instance must be initialized.
    pub unsafe fn allocate(
        &self,
        size: usize,
        alignment: usize,
        origin: Origin,
        zero: bool,
    ) -> *mut u8 {
        let alignment = alignment.max(MIN_ALIGN);
        if !alignment.is_power_of_two() || alignment > self.config.max_alignment() {
            return self.failure(Violation::InvalidAlignment { alignment });
        }
        let max = self.config.max_size();
        if size > max {
            return self.failure(Violation::AllocationTooLarge { size, max });
        }
        // Cannot overflow: size and alignment are bounded by the config.
        let needed = HEADER_SIZE + (alignment - MIN_ALIGN) + align_up(size.max(1), MIN_ALIGN);
        let zero = zero || self.options().zero_contents;

        if sampling::should_sample() {
            return self.allocate_sampled(size, alignment, needed, origin);
        }

        let committed = match size_class::class_for(self.config.size_classes, needed) {
            Some(class) if class < MAX_SIZE_CLASSES => {
                let block_size = self.config.size_classes[class];
                self.primary.allocate(
                    class,
                    block_size,
                    self.config.primary_span_size,
                    |b| unsafe {
                        self.stats.mapped_bytes.fetch_add(b.mapped, Ordering::Relaxed);
                        self.commit(b.ptr, class as u8 + 1, size, alignment, origin, zero && !b.fresh)
                    },
                )
            }
            _ => self.secondary.allocate(needed, self.guard_pages(), |large| unsafe {
                self.stats
                    .mapped_bytes
                    .fetch_add(large.mapped, Ordering::Relaxed);
                self.commit(large.block, 0, size, alignment, origin, false)
            }),
        };
        match committed {
            Some(user) => user,
            None => self.failure(Violation::OutOfMemory { size }),
        }
    }

    /// Serve a sampled allocation from its own guarded mapping, with the
    /// user data ending as close to the trailing guard as alignment allows.
    #[cold]
    unsafe fn allocate_sampled(
        &self,
        size: usize,
        alignment: usize,
        needed: usize,
        origin: Origin,
    ) -> *mut u8 {
        let guard_pages = self.config.secondary_guard_pages.max(1);
        let committed = self.secondary.allocate(needed, guard_pages, |large| unsafe {
            self.stats
                .mapped_bytes
                .fetch_add(large.mapped, Ordering::Relaxed);
            self.stats.sampled.fetch_add(1, Ordering::Relaxed);
            let user = align_down(large.block_end - size, alignment);
            self.write_header(large.block, user, 0, size, origin);
            user as *mut u8
        });
        match committed {
            Some(user) => user,
            None => self.failure(Violation::OutOfMemory { size }),
        }
    }

    /// Place the user pointer in `block`, write its header and zero the
    /// user bytes when asked. Runs under the backend lock that handed out
    /// `block`.
    unsafe fn commit(
        &self,
        block: *mut u8,
        class_id: u8,
        size: usize,
        alignment: usize,
        origin: Origin,
        zero: bool,
    ) -> *mut u8 {
        let user = align_up(block as usize + HEADER_SIZE, alignment);
        self.write_header(block, user, class_id, size, origin);
        let user = user as *mut u8;
        if zero {
            ptr::write_bytes(user, 0, size);
        }
        user
    }

    unsafe fn write_header(
        &self,
        block: *mut u8,
        user: usize,
        class_id: u8,
        size: usize,
        origin: Origin,
    ) {
        let offset = user - block as usize;
        if offset != HEADER_SIZE {
            chunk::write_block_marker(block, offset);
        }
        RawHeader::of(user as *mut u8).store(
            self.cookie(),
            user,
            offset,
            PackedHeader {
                class_id,
                state: ChunkState::Allocated,
                origin,
                size,
            },
        );
        self.stats.record_allocation(size);
    }

    /// Validate the header of a chunk about to be released or resized.
    unsafe fn check_live(&self, ptr: *mut u8, origin: Origin) -> LoadedHeader {
        let addr = ptr as usize;
        if !is_aligned(addr, MIN_ALIGN) {
            fatal(Violation::MisalignedPointer { addr });
        }
        let loaded = match RawHeader::of(ptr).load(self.cookie(), addr) {
            Some(loaded) => loaded,
            None => fatal(Violation::CorruptedHeader { addr }),
        };
        if loaded.header.state != ChunkState::Allocated {
            fatal(Violation::InvalidChunkState { addr });
        }
        if self.options().dealloc_type_mismatch && !loaded.header.origin.accepts(origin) {
            fatal(Violation::TypeMismatch {
                addr,
                allocated: loaded.header.origin,
                deallocated: origin,
            });
        }
        loaded
    }

    /// Release a chunk. `delete_size` and `delete_alignment` are the values
    /// the caller believes the chunk was allocated with, when known.
    ///
    /// # Safety
    /// `ptr` must be null or a chunk returned by this instance.
    pub unsafe fn deallocate(
        &self,
        ptr: *mut u8,
        origin: Origin,
        delete_size: Option<usize>,
        delete_alignment: Option<usize>,
    ) {
        if ptr.is_null() {
            return;
        }
        let addr = ptr as usize;
        let loaded = self.check_live(ptr, origin);
        let size = loaded.header.size;
        if let Some(delete_size) = delete_size {
            if self.options().delete_size_mismatch && delete_size != size {
                fatal(Violation::SizeMismatch {
                    addr,
                    size,
                    delete_size,
                });
            }
        }
        if let Some(alignment) = delete_alignment {
            if alignment > 0 && addr % alignment != 0 {
                fatal(Violation::AlignmentMismatch { addr, alignment });
            }
        }

        // The header leaves `Allocated` under the lock of whichever structure
        // takes the chunk, so a disabled instance keeps every live chunk.
        let cookie = self.cookie();
        let retire = |state: ChunkState| unsafe {
            if !RawHeader::of(ptr).compare_exchange(
                cookie,
                addr,
                &loaded,
                loaded.header.with_state(state),
            ) {
                fatal(Violation::HeaderRace { addr });
            }
            self.stats.record_free(size);
        };

        if loaded.header.class_id != 0 && self.quarantine.accepts(size) {
            self.quarantine.push(
                ptr,
                size,
                || retire(ChunkState::Quarantined),
                &mut |user, _| unsafe { self.recycle_quarantined(user) },
            );
        } else {
            self.recycle(loaded.header.class_id, addr - loaded.offset, || {
                retire(ChunkState::Available)
            });
        }
    }

    /// Hand a block back to its backend; `retire` runs under the backend lock.
    unsafe fn recycle(&self, class_id: u8, block: usize, retire: impl FnOnce()) {
        let block = block as *mut u8;
        if class_id == 0 {
            let unmapped = self.secondary.release(block, retire);
            self.stats
                .mapped_bytes
                .fetch_sub(unmapped, Ordering::Relaxed);
        } else {
            self.primary.release(class_id as usize - 1, block, retire);
        }
    }

    /// Move a chunk leaving the quarantine back to its backend. A header
    /// that no longer validates means the chunk was written after free.
    /// Runs under the quarantine lock.
    unsafe fn recycle_quarantined(&self, user: *mut u8) {
        let addr = user as usize;
        let cookie = self.cookie();
        let raw = RawHeader::of(user);
        let loaded = match raw.load(cookie, addr) {
            Some(loaded) if loaded.header.state == ChunkState::Quarantined => loaded,
            _ => fatal(Violation::CorruptedHeader { addr }),
        };
        let available = loaded.header.with_state(ChunkState::Available);
        self.recycle(loaded.header.class_id, addr - loaded.offset, || {
            if !raw.compare_exchange(cookie, addr, &loaded, available) {
                fatal(Violation::HeaderRace { addr });
            }
        });
    }

    unsafe fn block_end(&self, addr: usize, loaded: &LoadedHeader) -> usize {
        let block = addr - loaded.offset;
        match loaded.header.class_id {
            0 => Secondary::block_end(block as *mut u8),
            id => match self.config.size_classes.get(id as usize - 1) {
                Some(&block_size) => block + block_size,
                None => fatal(Violation::CorruptedHeader { addr }),
            },
        }
    }

    /// Resize a chunk, in place when the block allows it.
    ///
    /// Returns null, leaving `ptr` untouched, when a new chunk is needed and
    /// cannot be allocated.
    ///
    /// # Safety
    /// `ptr` must be null or a live chunk returned by this instance.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        origin: Origin,
        new_size: usize,
        alignment: usize,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size, alignment, origin, false);
        }
        let addr = ptr as usize;
        let loaded = self.check_live(ptr, origin);
        let max = self.config.max_size();
        if new_size > max {
            return self.failure(Violation::AllocationTooLarge {
                size: new_size,
                max,
            });
        }

        let old_size = loaded.header.size;
        let block_end = self.block_end(addr, &loaded);
        let fits = addr + new_size <= block_end
            && is_aligned(addr, alignment.max(MIN_ALIGN))
            && (new_size >= old_size || old_size - new_size < page_size());
        if fits {
            // Resize under the backend lock so a disabled allocator sees no
            // header change.
            let resize = || unsafe {
                let resized = loaded.header.with_size(new_size);
                if !RawHeader::of(ptr).compare_exchange(self.cookie(), addr, &loaded, resized) {
                    return false;
                }
                self.stats.record_resize(old_size, new_size);
                if new_size > old_size && self.options().zero_contents {
                    ptr::write_bytes(ptr.add(old_size), 0, new_size - old_size);
                }
                true
            };
            let resized = match loaded.header.class_id {
                0 => self.secondary.with_locked(resize),
                id => self.primary.with_class_locked(usize::from(id) - 1, resize),
            };
            if !resized {
                fatal(Violation::HeaderRace { addr });
            }
            return ptr;
        }

        let new_ptr = self.allocate(new_size, alignment, origin, false);
        if new_ptr.is_null() {
            return new_ptr;
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        self.deallocate(ptr, origin, None, None);
        new_ptr
    }

    /// Bytes usable at `ptr`: the distance to the end of its block.
    ///
    /// # Safety
    /// `ptr` must be null or a live chunk returned by this instance.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        let addr = ptr as usize;
        let loaded = match RawHeader::of(ptr).load(self.cookie(), addr) {
            Some(loaded) => loaded,
            None => fatal(Violation::CorruptedHeader { addr }),
        };
        if loaded.header.state != ChunkState::Allocated {
            fatal(Violation::InvalidChunkState { addr });
        }
        self.block_end(addr, &loaded) - addr
    }

    /// Report every allocated chunk whose user address lies in
    /// `[base, base + size)` as `(user address, requested size)`.
    ///
    /// # Safety
    /// The caller must hold the instance disabled, and `callback` must not
    /// allocate or free through it.
    pub unsafe fn iterate_over_chunks(
        &self,
        base: usize,
        size: usize,
        callback: &mut dyn FnMut(usize, usize),
    ) {
        let end = base.saturating_add(size);
        let cookie = self.cookie();
        let mut visit = |block: *mut u8| {
            let user = unsafe { chunk::user_for_block(block) } as usize;
            if user < base || user >= end {
                return;
            }
            let header = unsafe { RawHeader::of(user as *mut u8) };
            if let Some(loaded) = header.load(cookie, user) {
                if loaded.header.state == ChunkState::Allocated
                    && user - loaded.offset == block as usize
                {
                    callback(user, loaded.header.size);
                }
            }
        };
        self.primary
            .for_each_block(&self.config.size_classes[..self.class_count()], &mut visit);
        self.secondary.for_each_block(&mut visit);
    }

    /// Acquire every engine lock: quarantine, primary classes in order, then
    /// the secondary. Returns once no other thread is inside the engine.
    pub fn disable(&self) {
        self.quarantine.lock();
        self.primary.lock_all(self.class_count());
        self.secondary.lock();
    }

    /// Release the locks taken by [`Allocator::disable`], in reverse order.
    pub fn enable(&self) {
        self.secondary.unlock();
        self.primary.unlock_all(self.class_count());
        self.quarantine.unlock();
    }

    /// Recycle everything in the quarantine. Returns the number of chunks.
    ///
    /// # Safety
    /// The instance must be initialized and enabled.
    pub unsafe fn drain_quarantine(&self) -> usize {
        self.quarantine
            .drain(&mut |user, _| unsafe { self.recycle_quarantined(user) })
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::empty();
        snap.total_allocations = self.stats.allocations.load(Ordering::Relaxed);
        snap.total_frees = self.stats.frees.load(Ordering::Relaxed);
        snap.live_bytes = self.stats.live_bytes.load(Ordering::Relaxed);
        snap.live_chunks = self.stats.live_chunks.load(Ordering::Relaxed);
        snap.quarantined_bytes = self.quarantine.bytes();
        snap.quarantined_chunks = self.quarantine.chunks();
        snap.mapped_bytes = self.stats.mapped_bytes.load(Ordering::Relaxed);
        snap.sampled_allocations = self.stats.sampled.load(Ordering::Relaxed);
        snap.fork_generation = crate::fork::fork_generation();
        snap.secondary_in_use = self.secondary.in_use();
        snap.secondary_mapped_bytes = self.secondary.mapped_bytes();
        for (class, &block_size) in self.config.size_classes[..self.class_count()]
            .iter()
            .enumerate()
        {
            snap.push_class(self.primary.class_stats(class, block_size));
        }
        snap
    }

    /// Write the stats report to stderr.
    pub fn print_stats(&self) {
        let _ = self.stats().write_to(&mut report::Stderr);
    }
}

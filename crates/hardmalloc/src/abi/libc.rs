//! `malloc`-family entry points, prefixed with `hardmalloc_` so they can
//! live next to the system allocator.
//!
//! Every allocating entry point is an [`Allocating`] variant and goes
//! through [`translate`], which turns its C arguments into one engine
//! request or into the error it must report.

use crate::engine::chunk::Origin;
use crate::error::Violation;
use crate::lifecycle::instance;
use crate::platform::set_errno;
use crate::report::fatal;
use crate::util::{checked_align_up, page_size, MIN_ALIGN};
use ::libc::{c_int, c_void, EINVAL, ENOMEM};
use core::mem::size_of;
use core::ptr;

pub const M_DECAY_TIME: c_int = -100;
pub const M_PURGE: c_int = -101;
pub const M_PURGE_ALL: c_int = -104;

/// Entry points that turn into exactly one engine allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocating {
    Malloc,
    Calloc,
    PosixMemalign,
    AlignedAlloc,
    Memalign,
    Valloc,
    Pvalloc,
}

/// Exported C entry points of this surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Allocating(Allocating),
    Realloc,
    ReallocArray,
    Free,
    MallocUsableSize,
    MallocIterate,
    MallocEnable,
    MallocDisable,
    Mallopt,
    Mallinfo,
    #[cfg(target_os = "linux")]
    Mallinfo2,
    PrintStats,
}

pub const ENTRY_POINTS: &[EntryPoint] = &[
    EntryPoint::Allocating(Allocating::Malloc),
    EntryPoint::Allocating(Allocating::Calloc),
    EntryPoint::Realloc,
    EntryPoint::ReallocArray,
    EntryPoint::Allocating(Allocating::PosixMemalign),
    EntryPoint::Allocating(Allocating::AlignedAlloc),
    EntryPoint::Allocating(Allocating::Memalign),
    EntryPoint::Allocating(Allocating::Valloc),
    EntryPoint::Allocating(Allocating::Pvalloc),
    EntryPoint::Free,
    EntryPoint::MallocUsableSize,
    EntryPoint::MallocIterate,
    EntryPoint::MallocEnable,
    EntryPoint::MallocDisable,
    EntryPoint::Mallopt,
    EntryPoint::Mallinfo,
    #[cfg(target_os = "linux")]
    EntryPoint::Mallinfo2,
    EntryPoint::PrintStats,
];

impl EntryPoint {
    pub const fn symbol(self) -> &'static str {
        match self {
            EntryPoint::Allocating(Allocating::Malloc) => "hardmalloc_malloc",
            EntryPoint::Allocating(Allocating::Calloc) => "hardmalloc_calloc",
            EntryPoint::Allocating(Allocating::PosixMemalign) => "hardmalloc_posix_memalign",
            EntryPoint::Allocating(Allocating::AlignedAlloc) => "hardmalloc_aligned_alloc",
            EntryPoint::Allocating(Allocating::Memalign) => "hardmalloc_memalign",
            EntryPoint::Allocating(Allocating::Valloc) => "hardmalloc_valloc",
            EntryPoint::Allocating(Allocating::Pvalloc) => "hardmalloc_pvalloc",
            EntryPoint::Realloc => "hardmalloc_realloc",
            EntryPoint::ReallocArray => "hardmalloc_reallocarray",
            EntryPoint::Free => "hardmalloc_free",
            EntryPoint::MallocUsableSize => "hardmalloc_malloc_usable_size",
            EntryPoint::MallocIterate => "hardmalloc_malloc_iterate",
            EntryPoint::MallocEnable => "hardmalloc_malloc_enable",
            EntryPoint::MallocDisable => "hardmalloc_malloc_disable",
            EntryPoint::Mallopt => "hardmalloc_mallopt",
            EntryPoint::Mallinfo => "hardmalloc_mallinfo",
            #[cfg(target_os = "linux")]
            EntryPoint::Mallinfo2 => "hardmalloc_mallinfo2",
            EntryPoint::PrintStats => "__hardmalloc_print_stats",
        }
    }
}

/// One engine allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub size: usize,
    pub alignment: usize,
    pub origin: Origin,
    pub zero: bool,
}

/// Map the arguments of an allocating entry point to an engine request.
///
/// `count` is only read by `calloc`, `alignment` only by the memalign
/// family.
pub fn translate(
    entry: Allocating,
    count: usize,
    size: usize,
    alignment: usize,
) -> Result<Request, Violation> {
    let request = |size, alignment, origin, zero| {
        Ok(Request {
            size,
            alignment,
            origin,
            zero,
        })
    };
    match entry {
        Allocating::Malloc => request(size, MIN_ALIGN, Origin::Malloc, false),
        Allocating::Calloc => match count.checked_mul(size) {
            Some(total) => request(total, MIN_ALIGN, Origin::Malloc, true),
            None => Err(Violation::CallocOverflow {
                nmemb: count,
                size,
            }),
        },
        Allocating::PosixMemalign => {
            if !alignment.is_power_of_two() || alignment % size_of::<*const c_void>() != 0 {
                return Err(Violation::InvalidAlignment { alignment });
            }
            request(size, alignment, Origin::Memalign, false)
        }
        Allocating::AlignedAlloc => {
            if !alignment.is_power_of_two() {
                return Err(Violation::InvalidAlignment { alignment });
            }
            if size % alignment != 0 {
                return Err(Violation::InvalidAlignedAllocSize { alignment, size });
            }
            request(size, alignment, Origin::Memalign, false)
        }
        Allocating::Memalign => {
            if !alignment.is_power_of_two() {
                return Err(Violation::InvalidAlignment { alignment });
            }
            request(size, alignment, Origin::Memalign, false)
        }
        Allocating::Valloc => request(size, page_size(), Origin::Memalign, false),
        Allocating::Pvalloc => {
            let page = page_size();
            match checked_align_up(size.max(1), page) {
                Some(rounded) => request(rounded, page, Origin::Memalign, false),
                None => Err(Violation::AllocationTooLarge {
                    size,
                    max: usize::MAX - page + 1,
                }),
            }
        }
    }
}

fn errno_for(violation: &Violation) -> c_int {
    match violation {
        Violation::InvalidAlignment { .. } | Violation::InvalidAlignedAllocSize { .. } => EINVAL,
        _ => ENOMEM,
    }
}

/// Translate and serve. On failure returns the errno to report. Argument
/// errors abort instead unless `may_return_null` is set.
unsafe fn serve(
    entry: Allocating,
    count: usize,
    size: usize,
    alignment: usize,
) -> Result<*mut c_void, c_int> {
    let allocator = instance();
    let request = match translate(entry, count, size, alignment) {
        Ok(request) => request,
        Err(violation) => {
            if !violation.is_allocation_failure() && !allocator.options().may_return_null {
                fatal(violation);
            }
            return Err(errno_for(&violation));
        }
    };
    let ptr = allocator.allocate(request.size, request.alignment, request.origin, request.zero);
    if ptr.is_null() {
        Err(ENOMEM)
    } else {
        Ok(ptr as *mut c_void)
    }
}

unsafe fn serve_or_errno(entry: Allocating, count: usize, size: usize, alignment: usize) -> *mut c_void {
    match serve(entry, count, size, alignment) {
        Ok(ptr) => ptr,
        Err(errno) => {
            set_errno(errno);
            ptr::null_mut()
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_malloc(size: usize) -> *mut c_void {
    serve_or_errno(Allocating::Malloc, 0, size, 0)
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    serve_or_errno(Allocating::Calloc, nmemb, size, 0)
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_free(ptr: *mut c_void) {
    instance().deallocate(ptr as *mut u8, Origin::Malloc, None, None);
}

/// `realloc(NULL, n)` is `malloc(n)`; `realloc(p, 0)` frees `p` and returns
/// null.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return hardmalloc_malloc(size);
    }
    if size == 0 {
        hardmalloc_free(ptr);
        return ptr::null_mut();
    }
    let new_ptr = instance().reallocate(ptr as *mut u8, Origin::Malloc, size, MIN_ALIGN);
    if new_ptr.is_null() {
        set_errno(ENOMEM);
    }
    new_ptr as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_reallocarray(
    ptr: *mut c_void,
    nmemb: usize,
    size: usize,
) -> *mut c_void {
    match nmemb.checked_mul(size) {
        Some(total) => hardmalloc_realloc(ptr, total),
        None => {
            if !instance().options().may_return_null {
                fatal(Violation::CallocOverflow { nmemb, size });
            }
            set_errno(ENOMEM);
            ptr::null_mut()
        }
    }
}

/// Returns 0, `EINVAL` or `ENOMEM`. `*memptr` is only written on success.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null() {
        return EINVAL;
    }
    match serve(Allocating::PosixMemalign, 0, size, alignment) {
        Ok(ptr) => {
            *memptr = ptr;
            0
        }
        Err(errno) => errno,
    }
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    serve_or_errno(Allocating::AlignedAlloc, 0, size, alignment)
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_memalign(alignment: usize, size: usize) -> *mut c_void {
    serve_or_errno(Allocating::Memalign, 0, size, alignment)
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_valloc(size: usize) -> *mut c_void {
    serve_or_errno(Allocating::Valloc, 0, size, 0)
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_pvalloc(size: usize) -> *mut c_void {
    serve_or_errno(Allocating::Pvalloc, 0, size, 0)
}

#[no_mangle]
pub unsafe extern "C" fn hardmalloc_malloc_usable_size(ptr: *const c_void) -> usize {
    instance().usable_size(ptr as *mut u8)
}

/// Report chunks whose user address is in `[base, base + size)`. The caller
/// must hold `hardmalloc_malloc_disable`.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_malloc_iterate(
    base: usize,
    size: usize,
    callback: Option<unsafe extern "C" fn(base: usize, size: usize, arg: *mut c_void)>,
    arg: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return 0;
    };
    instance().iterate_over_chunks(base, size, &mut |chunk, chunk_size| unsafe {
        callback(chunk, chunk_size, arg)
    });
    0
}

#[no_mangle]
pub extern "C" fn hardmalloc_malloc_disable() {
    instance().disable();
}

#[no_mangle]
pub extern "C" fn hardmalloc_malloc_enable() {
    instance().enable();
}

/// Returns 1 for accepted parameters, 0 otherwise.
#[no_mangle]
pub unsafe extern "C" fn hardmalloc_mallopt(param: c_int, _value: c_int) -> c_int {
    match param {
        M_PURGE | M_PURGE_ALL => {
            instance().drain_quarantine();
            1
        }
        M_DECAY_TIME => 1,
        _ => 0,
    }
}

/// Layout of glibc's `struct mallinfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mallinfo {
    pub arena: c_int,
    pub ordblks: c_int,
    pub smblks: c_int,
    pub hblks: c_int,
    pub hblkhd: c_int,
    pub usmblks: c_int,
    pub fsmblks: c_int,
    pub uordblks: c_int,
    pub fordblks: c_int,
    pub keepcost: c_int,
}

/// Layout of glibc's `struct mallinfo2`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mallinfo2 {
    pub arena: usize,
    pub ordblks: usize,
    pub smblks: usize,
    pub hblks: usize,
    pub hblkhd: usize,
    pub usmblks: usize,
    pub fsmblks: usize,
    pub uordblks: usize,
    pub fordblks: usize,
    pub keepcost: usize,
}

fn mallinfo_snapshot() -> Mallinfo2 {
    let stats = instance().stats();
    Mallinfo2 {
        arena: stats.mapped_bytes,
        hblks: stats.secondary_in_use,
        hblkhd: stats.secondary_mapped_bytes,
        uordblks: stats.live_bytes,
        fordblks: stats.mapped_bytes.saturating_sub(stats.live_bytes),
        fsmblks: stats.quarantined_bytes,
        ..Mallinfo2::default()
    }
}

#[no_mangle]
pub extern "C" fn hardmalloc_mallinfo() -> Mallinfo {
    let info = mallinfo_snapshot();
    let clamp = |v: usize| v.min(c_int::MAX as usize) as c_int;
    Mallinfo {
        arena: clamp(info.arena),
        hblks: clamp(info.hblks),
        hblkhd: clamp(info.hblkhd),
        uordblks: clamp(info.uordblks),
        fordblks: clamp(info.fordblks),
        fsmblks: clamp(info.fsmblks),
        ..Mallinfo::default()
    }
}

#[cfg(target_os = "linux")]
#[no_mangle]
pub extern "C" fn hardmalloc_mallinfo2() -> Mallinfo2 {
    mallinfo_snapshot()
}

#[no_mangle]
pub extern "C" fn __hardmalloc_print_stats() {
    instance().print_stats();
}

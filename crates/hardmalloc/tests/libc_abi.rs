//! C allocator semantics of the prefixed libc surface.

#![cfg(feature = "libc-abi")]

use hardmalloc::abi::libc::*;
use std::collections::HashSet;
use std::ffi::c_void;
use std::ptr;

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

// ---------------------------------------------------------------------------
// malloc / free
// ---------------------------------------------------------------------------

#[test]
fn malloc_zero_returns_unique_pointers() {
    unsafe {
        let ptrs: Vec<*mut c_void> = (0..64).map(|_| hardmalloc_malloc(0)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()), "malloc(0) must return non-NULL");
        let unique: HashSet<usize> = ptrs.iter().map(|p| *p as usize).collect();
        assert_eq!(unique.len(), ptrs.len(), "malloc(0) must return unique pointers");
        for p in ptrs {
            hardmalloc_free(p);
        }
    }
}

#[test]
fn free_null_is_noop() {
    unsafe {
        hardmalloc_free(ptr::null_mut());
    }
}

#[test]
fn malloc_is_aligned_across_sizes() {
    unsafe {
        for size in [1usize, 7, 16, 17, 100, 1000, 4096, 20_000, 1 << 20] {
            let p = hardmalloc_malloc(size);
            assert!(!p.is_null(), "malloc({size}) returned NULL");
            assert_eq!(p as usize % 16, 0, "malloc({size}) misaligned: {p:p}");
            ptr::write_bytes(p as *mut u8, 0xAB, size);
            hardmalloc_free(p);
        }
    }
}

#[test]
fn malloc_huge_returns_null_with_enomem() {
    unsafe {
        let p = hardmalloc_malloc(usize::MAX);
        assert!(p.is_null());
        assert_eq!(errno(), libc::ENOMEM);
    }
}

// ---------------------------------------------------------------------------
// calloc
// ---------------------------------------------------------------------------

#[test]
fn calloc_zeroes_recycled_memory() {
    unsafe {
        // Dirty a chunk, release it, then make sure calloc of the same class
        // still hands out zeroes.
        for _ in 0..32 {
            let p = hardmalloc_malloc(200) as *mut u8;
            ptr::write_bytes(p, 0xFF, 200);
            hardmalloc_free(p as *mut c_void);
        }
        let p = hardmalloc_calloc(25, 8) as *const u8;
        assert!(!p.is_null());
        let bytes = std::slice::from_raw_parts(p, 200);
        assert!(bytes.iter().all(|&b| b == 0), "calloc memory not zeroed");
        hardmalloc_free(p as *mut c_void);
    }
}

// ---------------------------------------------------------------------------
// realloc / reallocarray
// ---------------------------------------------------------------------------

#[test]
fn realloc_preserves_contents() {
    unsafe {
        let p = hardmalloc_malloc(64) as *mut u8;
        for i in 0..64 {
            *p.add(i) = i as u8;
        }
        let q = hardmalloc_realloc(p as *mut c_void, 100_000) as *mut u8;
        assert!(!q.is_null());
        for i in 0..64 {
            assert_eq!(*q.add(i), i as u8, "byte {i} lost in realloc");
        }
        let r = hardmalloc_realloc(q as *mut c_void, 32) as *mut u8;
        assert!(!r.is_null());
        for i in 0..32 {
            assert_eq!(*r.add(i), i as u8, "byte {i} lost in shrinking realloc");
        }
        hardmalloc_free(r as *mut c_void);
    }
}

#[test]
fn realloc_same_size_keeps_pointer() {
    unsafe {
        let p = hardmalloc_malloc(48);
        let q = hardmalloc_realloc(p, 48);
        assert_eq!(p, q);
        hardmalloc_free(q);
    }
}

#[test]
fn realloc_null_is_malloc() {
    unsafe {
        let p = hardmalloc_realloc(ptr::null_mut(), 32);
        assert!(!p.is_null());
        hardmalloc_free(p);
    }
}

#[test]
fn realloc_zero_frees_and_returns_null() {
    unsafe {
        let p = hardmalloc_malloc(32);
        assert!(hardmalloc_realloc(p, 0).is_null());
    }
}

#[test]
fn reallocarray_grows_like_realloc() {
    unsafe {
        let p = hardmalloc_malloc(16) as *mut u8;
        *p = 0x5A;
        let q = hardmalloc_reallocarray(p as *mut c_void, 100, 16) as *mut u8;
        assert!(!q.is_null());
        assert_eq!(*q, 0x5A);
        assert!(hardmalloc_malloc_usable_size(q as *const c_void) >= 1600);
        hardmalloc_free(q as *mut c_void);
    }
}

// ---------------------------------------------------------------------------
// Aligned allocation family
// ---------------------------------------------------------------------------

#[test]
fn posix_memalign_grid() {
    unsafe {
        let mut align = std::mem::size_of::<usize>();
        while align <= 65_536 {
            let mut p: *mut c_void = ptr::null_mut();
            assert_eq!(hardmalloc_posix_memalign(&mut p, align, 100), 0);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "posix_memalign({align}) misaligned");
            hardmalloc_free(p);
            align *= 2;
        }
    }
}

#[test]
fn aligned_alloc_with_size_multiple() {
    unsafe {
        let p = hardmalloc_aligned_alloc(64, 256);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        hardmalloc_free(p);
    }
}

#[test]
fn memalign_power_of_two() {
    unsafe {
        let p = hardmalloc_memalign(256, 10);
        assert_eq!(p as usize % 256, 0);
        hardmalloc_free(p);
    }
}

#[test]
fn valloc_and_pvalloc_are_page_aligned() {
    let page = page_size();
    unsafe {
        let p = hardmalloc_valloc(10);
        assert_eq!(p as usize % page, 0);
        hardmalloc_free(p);

        let q = hardmalloc_pvalloc(page + 1);
        assert_eq!(q as usize % page, 0);
        assert!(hardmalloc_malloc_usable_size(q) >= 2 * page);
        hardmalloc_free(q);

        let r = hardmalloc_pvalloc(0);
        assert!(!r.is_null());
        assert!(hardmalloc_malloc_usable_size(r) >= page);
        hardmalloc_free(r);
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

#[test]
fn usable_size_covers_request() {
    unsafe {
        assert_eq!(hardmalloc_malloc_usable_size(ptr::null()), 0);
        for size in [1usize, 33, 500, 3000, 70_000] {
            let p = hardmalloc_malloc(size);
            let usable = hardmalloc_malloc_usable_size(p);
            assert!(usable >= size, "usable {usable} < requested {size}");
            ptr::write_bytes(p as *mut u8, 0x11, usable);
            hardmalloc_free(p);
        }
    }
}

unsafe extern "C" fn record_chunk(base: usize, size: usize, arg: *mut c_void) {
    let found = &mut *(arg as *mut (usize, usize, usize));
    if base == found.0 && size == found.1 {
        found.2 += 1;
    }
}

#[test]
fn malloc_iterate_reports_chunks_in_range() {
    unsafe {
        let p = hardmalloc_malloc(777);
        let mut found = (p as usize, 777usize, 0usize);
        let arg = &mut found as *mut _ as *mut c_void;

        hardmalloc_malloc_disable();
        hardmalloc_malloc_iterate(p as usize, 1, Some(record_chunk), arg);
        hardmalloc_malloc_enable();
        assert_eq!(found.2, 1);

        // A range ending before the chunk does not report it.
        found.2 = 0;
        hardmalloc_malloc_disable();
        hardmalloc_malloc_iterate(0, p as usize, Some(record_chunk), arg);
        hardmalloc_malloc_enable();
        assert_eq!(found.2, 0);

        hardmalloc_free(p);
        found.2 = 0;
        hardmalloc_malloc_disable();
        hardmalloc_malloc_iterate(0, usize::MAX, Some(record_chunk), arg);
        hardmalloc_malloc_enable();
        assert_eq!(found.2, 0, "freed chunk still reported");
    }
}

#[test]
fn mallopt_accepts_purge_and_decay() {
    unsafe {
        assert_eq!(hardmalloc_mallopt(M_PURGE, 0), 1);
        assert_eq!(hardmalloc_mallopt(M_PURGE_ALL, 0), 1);
        assert_eq!(hardmalloc_mallopt(M_DECAY_TIME, 1), 1);
        assert_eq!(hardmalloc_mallopt(12345, 0), 0);
    }
}

#[test]
fn mallinfo_counts_live_bytes() {
    unsafe {
        let p = hardmalloc_malloc(4000);
        let info = hardmalloc_mallinfo();
        assert!(info.uordblks > 0);
        assert!(info.arena > 0);
        #[cfg(target_os = "linux")]
        {
            let info2 = hardmalloc_mallinfo2();
            assert!(info2.uordblks >= 4000);
        }
        hardmalloc_free(p);
    }
}

#[test]
fn print_stats_does_not_crash() {
    unsafe {
        let p = hardmalloc_malloc(64);
        __hardmalloc_print_stats();
        hardmalloc_free(p);
    }
}

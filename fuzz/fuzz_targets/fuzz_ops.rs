#![no_main]

//! Random operation sequences over the prefixed libc surface.
//!
//! Each operation is four bytes: opcode, little-endian u16 size, slot. Up to
//! 64 chunks are live at once; every chunk carries a pattern derived from
//! its slot that must survive until it is released.

use hardmalloc::abi::libc::*;
use libc::c_void;
use libfuzzer_sys::fuzz_target;
use std::ptr;

const MAX_SLOTS: usize = 64;

#[derive(Clone, Copy)]
struct Slot {
    ptr: *mut u8,
    size: usize,
}

const EMPTY: Slot = Slot {
    ptr: ptr::null_mut(),
    size: 0,
};

fn pattern(slot: usize) -> u8 {
    0xA0 ^ slot as u8
}

unsafe fn fill(slot: usize, s: Slot) {
    ptr::write_bytes(s.ptr, pattern(slot), s.size.min(256));
}

unsafe fn verify(slot: usize, s: Slot) {
    let bytes = std::slice::from_raw_parts(s.ptr, s.size.min(256));
    assert!(
        bytes.iter().all(|&b| b == pattern(slot)),
        "slot {slot} corrupted"
    );
}

unsafe fn release(slots: &mut [Slot; MAX_SLOTS], slot: usize) {
    let s = slots[slot];
    if !s.ptr.is_null() {
        verify(slot, s);
        hardmalloc_free(s.ptr as *mut c_void);
    }
    slots[slot] = EMPTY;
}

fuzz_target!(|data: &[u8]| {
    let mut slots = [EMPTY; MAX_SLOTS];

    for op in data.chunks_exact(4) {
        let size = u16::from_le_bytes([op[1], op[2]]) as usize;
        let slot = op[3] as usize % MAX_SLOTS;
        unsafe {
            match op[0] % 6 {
                0 => {
                    release(&mut slots, slot);
                    let p = hardmalloc_malloc(size) as *mut u8;
                    assert!(!p.is_null());
                    slots[slot] = Slot { ptr: p, size };
                    fill(slot, slots[slot]);
                }
                1 => release(&mut slots, slot),
                2 => {
                    let old = slots[slot];
                    if !old.ptr.is_null() {
                        verify(slot, old);
                    }
                    let p = hardmalloc_realloc(old.ptr as *mut c_void, size) as *mut u8;
                    if size == 0 && !old.ptr.is_null() {
                        assert!(p.is_null());
                        slots[slot] = EMPTY;
                    } else {
                        assert!(!p.is_null());
                        let kept = Slot {
                            ptr: p,
                            size: old.size.min(size),
                        };
                        if !old.ptr.is_null() {
                            verify(slot, kept);
                        }
                        slots[slot] = Slot { ptr: p, size };
                        fill(slot, slots[slot]);
                    }
                }
                3 => {
                    release(&mut slots, slot);
                    let nmemb = (size >> 8).max(1);
                    let elem = (size & 0xFF).max(1);
                    let p = hardmalloc_calloc(nmemb, elem) as *mut u8;
                    assert!(!p.is_null());
                    let total = nmemb * elem;
                    let bytes = std::slice::from_raw_parts(p, total);
                    assert!(bytes.iter().all(|&b| b == 0), "calloc not zeroed");
                    slots[slot] = Slot { ptr: p, size: total };
                    fill(slot, slots[slot]);
                }
                4 => {
                    release(&mut slots, slot);
                    let alignment = 16usize << (op[2] % 9);
                    let mut p: *mut c_void = ptr::null_mut();
                    assert_eq!(hardmalloc_posix_memalign(&mut p, alignment, size), 0);
                    assert_eq!(p as usize % alignment, 0);
                    slots[slot] = Slot {
                        ptr: p as *mut u8,
                        size,
                    };
                    fill(slot, slots[slot]);
                }
                _ => {
                    let s = slots[slot];
                    if !s.ptr.is_null() {
                        assert!(hardmalloc_malloc_usable_size(s.ptr as *const c_void) >= s.size);
                    }
                }
            }
        }
    }

    for slot in 0..MAX_SLOTS {
        unsafe { release(&mut slots, slot) };
    }
});

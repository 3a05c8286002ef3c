#![no_main]

//! Size and alignment boundaries on the explicit surface.
//!
//! Input is a series of (u32 size, alignment shift) records. Every chunk is
//! written to its full extent, checked for alignment, found by the chunk
//! walk and released with the layout it was allocated with.

use hardmalloc::abi::explicit::*;
use libc::c_void;
use libfuzzer_sys::fuzz_target;

const MAX_SIZE: usize = 1 << 20;

unsafe extern "C" fn find(base: usize, size: usize, arg: *mut c_void) {
    let target = &mut *(arg as *mut (usize, usize, usize));
    if base == target.0 && size == target.1 {
        target.2 += 1;
    }
}

fuzz_target!(|data: &[u8]| {
    for record in data.chunks_exact(5) {
        let size = u32::from_le_bytes([record[0], record[1], record[2], record[3]]) as usize
            % MAX_SIZE;
        let alignment = 1usize << (record[4] % 17);

        unsafe {
            let p = hardmalloc_allocate(size, alignment) as *mut u8;
            assert!(!p.is_null(), "allocate({size}, {alignment}) failed");
            assert_eq!(p as usize % alignment.max(HARDMALLOC_MIN_ALIGN), 0);

            std::ptr::write_bytes(p, 0xBB, size);

            if record[4] & 0x80 != 0 {
                let mut target = (p as usize, size, 0usize);
                hardmalloc_disable();
                hardmalloc_iterate(Some(find), &mut target as *mut _ as *mut c_void);
                hardmalloc_enable();
                assert_eq!(target.2, 1, "chunk {p:p} not reported exactly once");
            }

            hardmalloc_deallocate(p as *mut c_void, size, alignment);
        }
    }
});

//! Chunk header layout.
//!
//! Every chunk is preceded by a 16-byte header:
//!
//! ```text
//! user - 16: offset  u64   distance from block start to the user pointer
//! user -  8: packed  u64   class id | state | origin | size | checksum
//! ```
//!
//! When the user pointer is not `block + 16` (over-aligned requests and
//! sampled chunks), the block starts with `[BLOCK_MARKER, offset]` so a walk
//! over blocks can find the header.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub const HEADER_SIZE: usize = 16;

/// Written at the start of a block whose header is not at the start.
pub const BLOCK_MARKER: u64 = 0x6861_7264_6d61_6c63;

const CLASS_SHIFT: u32 = 0;
const STATE_SHIFT: u32 = 8;
const ORIGIN_SHIFT: u32 = 10;
const SIZE_SHIFT: u32 = 12;
const CHECKSUM_SHIFT: u32 = 48;

const CLASS_MASK: u64 = 0xff;
const STATE_MASK: u64 = 0x3;
const ORIGIN_MASK: u64 = 0x3;
const SIZE_MASK: u64 = (1 << 36) - 1;
const CHECKSUM_MASK: u64 = 0xffff;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Available = 0,
    Allocated = 1,
    Quarantined = 2,
}

/// Which surface produced a chunk.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Malloc = 0,
    Memalign = 1,
    Explicit = 2,
}

impl Origin {
    /// Whether a chunk allocated as `self` may be released as `dealloc`.
    /// `free` is the documented release path for memalign-family chunks.
    pub fn accepts(self, dealloc: Origin) -> bool {
        self == dealloc || (self == Origin::Memalign && dealloc == Origin::Malloc)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Origin::Malloc => "malloc",
            Origin::Memalign => "memalign",
            Origin::Explicit => "explicit",
        })
    }
}

/// Decoded header word, without the checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedHeader {
    /// 0 for secondary chunks, primary class index + 1 otherwise.
    pub class_id: u8,
    pub state: ChunkState,
    pub origin: Origin,
    pub size: usize,
}

impl PackedHeader {
    fn pack(self) -> u64 {
        ((self.class_id as u64 & CLASS_MASK) << CLASS_SHIFT)
            | ((self.state as u64 & STATE_MASK) << STATE_SHIFT)
            | ((self.origin as u64 & ORIGIN_MASK) << ORIGIN_SHIFT)
            | ((self.size as u64 & SIZE_MASK) << SIZE_SHIFT)
    }

    fn unpack(word: u64) -> Option<Self> {
        let state = match (word >> STATE_SHIFT) & STATE_MASK {
            0 => ChunkState::Available,
            1 => ChunkState::Allocated,
            2 => ChunkState::Quarantined,
            _ => return None,
        };
        let origin = match (word >> ORIGIN_SHIFT) & ORIGIN_MASK {
            0 => Origin::Malloc,
            1 => Origin::Memalign,
            2 => Origin::Explicit,
            _ => return None,
        };
        Some(PackedHeader {
            class_id: ((word >> CLASS_SHIFT) & CLASS_MASK) as u8,
            state,
            origin,
            size: ((word >> SIZE_SHIFT) & SIZE_MASK) as usize,
        })
    }

    pub fn with_state(self, state: ChunkState) -> Self {
        PackedHeader { state, ..self }
    }

    pub fn with_size(self, size: usize) -> Self {
        PackedHeader { size, ..self }
    }
}

/// Keyed 16-bit checksum over the header contents and its address, so a
/// header copied to another chunk does not validate.
#[inline]
fn compute_checksum(cookie: u64, user: usize, offset: u64, packed: u64) -> u64 {
    let input = (cookie ^ 0x9E37_79B9_7F4A_7C15)
        ^ (user as u64)
        ^ offset.rotate_left(29)
        ^ packed.wrapping_mul(0x94d0_49bb_1331_11eb);
    let mut h = input.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    h ^= h >> 31;
    (h ^ (h >> 16) ^ (h >> 32) ^ (h >> 48)) & CHECKSUM_MASK
}

/// A header as read from memory, validated against the cookie.
#[derive(Debug, Clone, Copy)]
pub struct LoadedHeader {
    pub header: PackedHeader,
    pub offset: usize,
    raw: u64,
}

#[repr(C)]
pub struct RawHeader {
    offset: AtomicU64,
    packed: AtomicU64,
}

impl RawHeader {
    /// # Safety
    /// `user` must be at least `HEADER_SIZE` bytes into a mapped block.
    #[inline]
    pub unsafe fn of<'a>(user: *mut u8) -> &'a RawHeader {
        &*(user.sub(HEADER_SIZE) as *const RawHeader)
    }

    fn seal(cookie: u64, user: usize, offset: u64, header: PackedHeader) -> u64 {
        let packed = header.pack();
        packed | (compute_checksum(cookie, user, offset, packed) << CHECKSUM_SHIFT)
    }

    /// Write a fresh header for `user`.
    pub fn store(&self, cookie: u64, user: usize, offset: usize, header: PackedHeader) {
        self.offset.store(offset as u64, Ordering::Relaxed);
        self.packed
            .store(Self::seal(cookie, user, offset as u64, header), Ordering::Release);
    }

    /// Read and verify the header. `None` means the checksum (or an encoded
    /// field) is invalid.
    pub fn load(&self, cookie: u64, user: usize) -> Option<LoadedHeader> {
        let raw = self.packed.load(Ordering::Acquire);
        let offset = self.offset.load(Ordering::Relaxed);
        let packed = raw & !(CHECKSUM_MASK << CHECKSUM_SHIFT);
        if compute_checksum(cookie, user, offset, packed) != raw >> CHECKSUM_SHIFT {
            return None;
        }
        if offset < HEADER_SIZE as u64 || offset as usize > user {
            return None;
        }
        let header = PackedHeader::unpack(packed)?;
        Some(LoadedHeader {
            header,
            offset: offset as usize,
            raw,
        })
    }

    /// Replace `expected` with `new`. Fails if another thread changed the
    /// header in between.
    pub fn compare_exchange(
        &self,
        cookie: u64,
        user: usize,
        expected: &LoadedHeader,
        new: PackedHeader,
    ) -> bool {
        let sealed = Self::seal(cookie, user, expected.offset as u64, new);
        self.packed
            .compare_exchange(expected.raw, sealed, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

/// Record the header position at the start of `block`.
///
/// # Safety
/// `block` must be writable for 16 bytes and `offset > HEADER_SIZE`.
#[inline]
pub unsafe fn write_block_marker(block: *mut u8, offset: usize) {
    let words = block as *mut u64;
    words.write(BLOCK_MARKER);
    words.add(1).write(offset as u64);
}

/// The user pointer the header at the start of `block` describes.
///
/// # Safety
/// `block` must be a block previously handed out by the primary or
/// secondary, readable for 16 bytes.
#[inline]
pub unsafe fn user_for_block(block: *mut u8) -> *mut u8 {
    let words = block as *const u64;
    if words.read() == BLOCK_MARKER {
        block.add(words.add(1).read() as usize)
    } else {
        block.add(HEADER_SIZE)
    }
}

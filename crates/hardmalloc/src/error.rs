//! Fatal conditions. Every variant is reported through
//! [`crate::report::fatal`], which formats without allocating and aborts.

use crate::config::ConfigError;
use crate::engine::chunk::Origin;
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("corrupted chunk header at address {addr:#x}")]
    CorruptedHeader { addr: usize },

    #[error("invalid chunk state when deallocating address {addr:#x}")]
    InvalidChunkState { addr: usize },

    #[error("misaligned pointer when deallocating address {addr:#x}")]
    MisalignedPointer { addr: usize },

    #[error("allocation type mismatch when deallocating address {addr:#x}: allocated with {allocated}, deallocated with {deallocated}")]
    TypeMismatch {
        addr: usize,
        allocated: Origin,
        deallocated: Origin,
    },

    #[error("invalid sized delete when deallocating address {addr:#x}: chunk size {size}, delete size {delete_size}")]
    SizeMismatch {
        addr: usize,
        size: usize,
        delete_size: usize,
    },

    #[error("alignment mismatch when deallocating address {addr:#x}: not aligned to {alignment}")]
    AlignmentMismatch { addr: usize, alignment: usize },

    #[error("race on chunk header at address {addr:#x}")]
    HeaderRace { addr: usize },

    #[error("allocator initialized twice")]
    DoubleInitialization,

    #[error("post-initialization callback invoked twice")]
    PostInitTwice,

    #[error("pthread_atfork failed with error {code}")]
    ForkHandlerRegistration { code: i32 },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("out of memory trying to allocate {size} bytes")]
    OutOfMemory { size: usize },

    #[error("requested allocation size {size} exceeds maximum supported size of {max}")]
    AllocationTooLarge { size: usize, max: usize },

    #[error("calloc parameters overflow: count * size ({nmemb} * {size}) cannot be represented")]
    CallocOverflow { nmemb: usize, size: usize },

    #[error("invalid alignment requested: {alignment}")]
    InvalidAlignment { alignment: usize },

    #[error("invalid alignment requested in aligned_alloc: {alignment}, size {size} must be a multiple of it")]
    InvalidAlignedAllocSize { alignment: usize, size: usize },
}

impl Violation {
    /// Exhausted memory or an unrepresentable size. These come back to the
    /// caller as null and are never fatal; every other violation aborts
    /// unless an argument error is explicitly allowed through.
    pub const fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            Violation::OutOfMemory { .. } | Violation::AllocationTooLarge { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::StackWriter;
    use core::fmt::Write;

    #[test]
    fn only_exhaustion_is_an_allocation_failure() {
        assert!(Violation::OutOfMemory { size: 1 }.is_allocation_failure());
        assert!(Violation::AllocationTooLarge { size: 2, max: 1 }.is_allocation_failure());
        assert!(!Violation::CallocOverflow { nmemb: 2, size: usize::MAX }.is_allocation_failure());
        assert!(!Violation::InvalidAlignment { alignment: 48 }.is_allocation_failure());
        assert!(!Violation::InvalidAlignedAllocSize { alignment: 64, size: 10 }.is_allocation_failure());
    }

    #[test]
    fn messages_render_without_allocating() {
        let mut w = StackWriter::<256>::new();
        write!(
            w,
            "{}",
            Violation::SizeMismatch {
                addr: 0x1000,
                size: 128,
                delete_size: 64
            }
        )
        .unwrap();
        assert_eq!(
            w.as_str(),
            "invalid sized delete when deallocating address 0x1000: chunk size 128, delete size 64"
        );
    }

    #[test]
    fn type_mismatch_names_origins() {
        let v = Violation::TypeMismatch {
            addr: 0x20,
            allocated: Origin::Explicit,
            deallocated: Origin::Malloc,
        };
        let mut w = StackWriter::<256>::new();
        write!(w, "{v}").unwrap();
        assert!(w.as_str().contains("allocated with explicit"));
        assert!(w.as_str().contains("deallocated with malloc"));
    }
}

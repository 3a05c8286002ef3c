//! A process-wide hardened allocator.
//!
//! One [`engine::Allocator`] instance lives in a `static` and is reachable
//! through two C surfaces, each behind a cargo feature:
//!
//! * `explicit-abi`: `hardmalloc_allocate(size, align)` /
//!   `hardmalloc_deallocate(ptr, size, align)` plus iteration, enable,
//!   disable and stats.
//! * `libc-abi`: the `malloc` family, prefixed `hardmalloc_`.
//!
//! Rust programs can also install [`Hardmalloc`] as their
//! `#[global_allocator]` (feature `global-allocator`).

extern crate libc;

pub mod abi;
pub mod config;
pub mod engine;
pub mod error;
pub mod fork;
#[cfg(feature = "global-allocator")]
pub mod global_alloc;
pub mod lifecycle;
pub mod logger;
pub mod platform;
pub mod report;
pub mod sampling;
pub mod sync;
pub mod util;

pub use abi::{map_chunks, print_stats};
pub use config::{register_default_options, Options};
pub use engine::chunk::Origin;
pub use error::Violation;
#[cfg(feature = "global-allocator")]
pub use global_alloc::Hardmalloc;
pub use lifecycle::instance;
pub use util::MIN_ALIGN;

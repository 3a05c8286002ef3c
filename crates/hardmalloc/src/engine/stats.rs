use crate::config::MAX_SIZE_CLASSES;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Engine-wide counters, updated without locks.
pub struct GlobalStats {
    pub allocations: AtomicUsize,
    pub frees: AtomicUsize,
    pub live_bytes: AtomicUsize,
    pub live_chunks: AtomicUsize,
    pub mapped_bytes: AtomicUsize,
    pub sampled: AtomicUsize,
}

impl GlobalStats {
    pub const fn new() -> Self {
        GlobalStats {
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            live_chunks: AtomicUsize::new(0),
            mapped_bytes: AtomicUsize::new(0),
            sampled: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn record_allocation(&self, size: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_add(size, Ordering::Relaxed);
        self.live_chunks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_free(&self, size: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
        self.live_chunks.fetch_sub(1, Ordering::Relaxed);
    }

    /// In-place resize of a live chunk.
    #[inline]
    pub fn record_resize(&self, old: usize, new: usize) {
        if new >= old {
            self.live_bytes.fetch_add(new - old, Ordering::Relaxed);
        } else {
            self.live_bytes.fetch_sub(old - new, Ordering::Relaxed);
        }
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub block_size: usize,
    pub in_use: usize,
    pub carved: usize,
    pub spans: usize,
}

/// Point-in-time copy of every counter. Building one takes no lock, so the
/// fields are individually exact but not mutually consistent unless the
/// allocator is disabled.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total_allocations: usize,
    pub total_frees: usize,
    pub live_bytes: usize,
    pub live_chunks: usize,
    pub quarantined_bytes: usize,
    pub quarantined_chunks: usize,
    pub mapped_bytes: usize,
    pub sampled_allocations: usize,
    pub fork_generation: usize,
    pub secondary_in_use: usize,
    pub secondary_mapped_bytes: usize,
    classes: [ClassStats; MAX_SIZE_CLASSES],
    class_count: usize,
}

impl StatsSnapshot {
    pub const fn empty() -> Self {
        const EMPTY: ClassStats = ClassStats {
            block_size: 0,
            in_use: 0,
            carved: 0,
            spans: 0,
        };
        StatsSnapshot {
            total_allocations: 0,
            total_frees: 0,
            live_bytes: 0,
            live_chunks: 0,
            quarantined_bytes: 0,
            quarantined_chunks: 0,
            mapped_bytes: 0,
            sampled_allocations: 0,
            fork_generation: 0,
            secondary_in_use: 0,
            secondary_mapped_bytes: 0,
            classes: [EMPTY; MAX_SIZE_CLASSES],
            class_count: 0,
        }
    }

    pub fn push_class(&mut self, class: ClassStats) {
        if self.class_count < MAX_SIZE_CLASSES {
            self.classes[self.class_count] = class;
            self.class_count += 1;
        }
    }

    pub fn classes(&self) -> &[ClassStats] {
        &self.classes[..self.class_count]
    }

    /// Bytes handed out by the primary, counted in whole blocks.
    pub fn primary_in_use_bytes(&self) -> usize {
        self.classes()
            .iter()
            .map(|c| c.in_use * c.block_size)
            .sum()
    }

    pub fn write_to<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        writeln!(w, "hardmalloc stats:")?;
        writeln!(
            w,
            "  live: {} bytes in {} chunks ({} allocations, {} frees)",
            self.live_bytes, self.live_chunks, self.total_allocations, self.total_frees
        )?;
        writeln!(
            w,
            "  quarantine: {} bytes in {} chunks",
            self.quarantined_bytes, self.quarantined_chunks
        )?;
        writeln!(
            w,
            "  mapped: {} bytes; sampled allocations: {}; fork generation: {}",
            self.mapped_bytes, self.sampled_allocations, self.fork_generation
        )?;
        writeln!(w, "  primary:")?;
        for (index, class) in self.classes().iter().enumerate() {
            if class.carved == 0 {
                continue;
            }
            writeln!(
                w,
                "    class {} block {}: {} in use, {} carved, {} spans",
                index, class.block_size, class.in_use, class.carved, class.spans
            )?;
        }
        writeln!(
            w,
            "  secondary: {} in use, {} bytes mapped",
            self.secondary_in_use, self.secondary_mapped_bytes
        )
    }
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::StackWriter;

    #[test]
    fn report_lists_only_carved_classes() {
        let mut snap = StatsSnapshot::empty();
        snap.total_allocations = 3;
        snap.total_frees = 1;
        snap.live_bytes = 96;
        snap.live_chunks = 2;
        snap.mapped_bytes = 262144;
        snap.push_class(ClassStats {
            block_size: 32,
            in_use: 0,
            carved: 0,
            spans: 0,
        });
        snap.push_class(ClassStats {
            block_size: 48,
            in_use: 2,
            carved: 3,
            spans: 1,
        });

        let mut w = StackWriter::<1024>::new();
        snap.write_to(&mut w).unwrap();
        let text = w.as_str();
        assert!(text.starts_with("hardmalloc stats:\n"));
        assert!(text.contains("  live: 96 bytes in 2 chunks (3 allocations, 1 frees)\n"));
        assert!(text.contains("    class 1 block 48: 2 in use, 3 carved, 1 spans\n"));
        assert!(!text.contains("class 0"));
        assert!(text.ends_with("  secondary: 0 in use, 0 bytes mapped\n"));
        assert_eq!(snap.primary_in_use_bytes(), 96);
    }

    #[test]
    fn counters_balance() {
        let stats = GlobalStats::new();
        stats.record_allocation(100);
        stats.record_allocation(50);
        stats.record_resize(100, 40);
        stats.record_free(40);
        assert_eq!(stats.live_bytes.load(Ordering::Relaxed), 50);
        assert_eq!(stats.live_chunks.load(Ordering::Relaxed), 1);
        assert_eq!(stats.frees.load(Ordering::Relaxed), 1);
    }
}

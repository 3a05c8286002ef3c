//! Disabling the allocator stops every other thread at its next entry.

use hardmalloc::{instance, Origin};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn disabled_allocator_blocks_other_threads() {
    let a = instance();
    let done = Arc::new(AtomicBool::new(false));

    a.disable();
    let worker = {
        let done = Arc::clone(&done);
        thread::spawn(move || unsafe {
            let p = instance().allocate(48, 16, Origin::Explicit, false);
            assert!(!p.is_null());
            instance().deallocate(p, Origin::Explicit, Some(48), Some(16));
            done.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert!(
        !done.load(Ordering::SeqCst),
        "allocation completed while the allocator was disabled"
    );

    a.enable();
    worker.join().expect("worker panicked");
    assert!(done.load(Ordering::SeqCst));
}

#[test]
fn live_chunk_count_is_frozen_while_disabled() {
    const THREADS: usize = 4;

    let stop = Arc::new(AtomicBool::new(false));
    let progress = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS + 1));

    let workers: Vec<_> = (0..THREADS)
        .map(|tid| {
            let stop = Arc::clone(&stop);
            let progress = Arc::clone(&progress);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let size = 64 + tid * 512;
                while !stop.load(Ordering::Relaxed) {
                    unsafe {
                        let p = instance().allocate(size, 16, Origin::Explicit, false);
                        instance().deallocate(p, Origin::Explicit, Some(size), Some(16));
                    }
                    progress.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    barrier.wait();
    while progress.load(Ordering::Relaxed) < 1000 {
        thread::yield_now();
    }

    let a = instance();
    a.disable();
    let before = a.stats();
    thread::sleep(Duration::from_millis(50));
    let after = a.stats();
    a.enable();

    assert_eq!(before.total_allocations, after.total_allocations);
    assert_eq!(before.total_frees, after.total_frees);
    assert_eq!(before.live_chunks, after.live_chunks);

    stop.store(true, Ordering::Relaxed);
    for w in workers {
        w.join().expect("worker panicked");
    }
}

#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

fn count_chunk_at(addr: usize) -> usize {
    let mut seen = 0;
    unsafe {
        instance().iterate_over_chunks(0, usize::MAX, &mut |base, size| {
            if base == addr && size == 4242 {
                seen += 1;
            }
        });
    }
    seen
}

#[test]
fn free_from_another_thread_waits_for_enable() {
    let a = instance();
    let p = unsafe { a.allocate(4242, 16, Origin::Explicit, false) };
    assert!(!p.is_null());
    let addr = p as usize;
    let freed = Arc::new(AtomicBool::new(false));

    a.disable();
    let live_before = a.stats().live_chunks;
    assert_eq!(count_chunk_at(addr), 1);

    let worker = {
        let freed = Arc::clone(&freed);
        let p = SendPtr(p);
        thread::spawn(move || {
            let p = p;
            unsafe {
                instance().deallocate(p.0, Origin::Explicit, Some(4242), Some(16));
            }
            freed.store(true, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(200));
    let seen = count_chunk_at(addr);
    let live_after = a.stats().live_chunks;
    let returned = freed.load(Ordering::SeqCst);
    a.enable();
    worker.join().expect("worker panicked");

    assert!(!returned, "free completed while the allocator was disabled");
    assert_eq!(seen, 1, "chunk left the heap while the allocator was disabled");
    assert_eq!(live_before, live_after);
    assert!(freed.load(Ordering::SeqCst));

    a.disable();
    let seen = count_chunk_at(addr);
    a.enable();
    assert_eq!(seen, 0, "freed chunk still reported");
}

#[test]
fn iteration_under_disable_matches_stats() {
    let mut reported = 0usize;
    let mut reported_bytes = 0usize;
    let a = instance();

    unsafe {
        let chunks: Vec<*mut u8> = (0..16)
            .map(|i| a.allocate(100 + i, 16, Origin::Explicit, false))
            .collect();

        a.disable();
        let stats = a.stats();
        a.iterate_over_chunks(0, usize::MAX, &mut |_, size| {
            reported += 1;
            reported_bytes += size;
        });
        a.enable();

        assert_eq!(reported, stats.live_chunks);
        assert_eq!(reported_bytes, stats.live_bytes);

        for (i, p) in chunks.into_iter().enumerate() {
            a.deallocate(p, Origin::Explicit, Some(100 + i), Some(16));
        }
    }
}

#[test]
fn map_chunks_releases_the_allocator() {
    let a = instance();
    for round in 0..3 {
        unsafe {
            let p = a.allocate(10 + round, 16, Origin::Explicit, false);
            let mut seen = 0usize;
            hardmalloc::map_chunks(&mut |base, _| {
                if base == p as usize {
                    seen += 1;
                }
            });
            assert_eq!(seen, 1);
            // Deadlocks if the walk left any engine lock held.
            a.deallocate(p, Origin::Explicit, Some(10 + round), Some(16));
        }
    }
}

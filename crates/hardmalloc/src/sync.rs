use core::sync::atomic::{AtomicI32, Ordering};

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Futex-backed lock used for every engine lock.
///
/// `std::sync::Mutex` is unusable here: it may allocate, it cannot be
/// released by a thread other than its owner, and the post-fork child must
/// release locks taken by the pre-fork handler. This lock has no owner, so
/// `unlock` from any thread (or from the forked child) is valid.
pub struct RawMutex {
    state: AtomicI32,
}

unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            state: AtomicI32::new(UNLOCKED),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            if self.state.swap(CONTENDED, Ordering::Acquire) == UNLOCKED {
                return;
            }
            #[cfg(any(target_os = "linux", target_os = "android"))]
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    &self.state as *const AtomicI32,
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    CONTENDED,
                    core::ptr::null::<libc::timespec>(),
                );
            }
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            {
                core::hint::spin_loop();
                unsafe {
                    libc::sched_yield();
                }
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.state.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            self.wake_one();
        }
    }

    #[cold]
    fn wake_one(&self) {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                &self.state as *const AtomicI32,
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                1i32,
            );
        }
    }

    /// Try to lock without blocking. Returns true if the lock was acquired.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != UNLOCKED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_lock_fails_while_held() {
        let m = RawMutex::new();
        m.lock();
        assert!(m.is_locked());
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn unlock_from_another_thread() {
        let m = Arc::new(RawMutex::new());
        m.lock();
        let m2 = Arc::clone(&m);
        thread::spawn(move || m2.unlock()).join().unwrap();
        assert!(m.try_lock());
        m.unlock();
    }

    #[test]
    fn contended_counter() {
        struct Shared {
            lock: RawMutex,
            value: core::cell::UnsafeCell<usize>,
            done: AtomicUsize,
        }
        unsafe impl Sync for Shared {}

        let shared = Arc::new(Shared {
            lock: RawMutex::new(),
            value: core::cell::UnsafeCell::new(0),
            done: AtomicUsize::new(0),
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&shared);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        s.lock.lock();
                        unsafe { *s.value.get() += 1 };
                        s.lock.unlock();
                    }
                    s.done.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(shared.done.load(Ordering::Relaxed), 8);
        assert_eq!(unsafe { *shared.value.get() }, 80_000);
    }
}

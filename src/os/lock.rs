//! A lock that is safe to take from inside `malloc()`.
//!
//! `std::sync::Mutex` may lazily box its pthread mutex on some targets, which
//! would recurse straight back into the allocator. This one is a single word:
//! a futex on Linux, a backoff spin everywhere else. It also has to survive
//! `fork()`: the child unlocks a lock it never locked, which is fine here
//! since there is no owner tracking.

use std::sync::atomic::Ordering;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
const CONTENDED: u32 = 2;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        use linux_futex::{Futex, Private};

        pub struct RawLock {
            futex: Futex<Private>,
        }

        impl RawLock {
            pub const fn new() -> Self {
                Self { futex: Futex::new(UNLOCKED) }
            }

            #[inline]
            pub fn try_lock(&self) -> bool {
                self.futex
                    .value
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            }

            #[inline]
            pub fn lock(&self) {
                if !self.try_lock() {
                    self.lock_contended();
                }
            }

            #[cold]
            fn lock_contended(&self) {
                while self.futex.value.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                    // Spurious wakeups and `WrongValue` both just mean "look again".
                    let _ = self.futex.wait(CONTENDED);
                }
            }

            /// # Safety
            ///
            /// The lock must be held, by this thread or (after `fork()`) by the
            /// thread this process was forked from.
            #[inline]
            pub unsafe fn unlock(&self) {
                if self.futex.value.swap(UNLOCKED, Ordering::Release) == CONTENDED {
                    self.futex.wake(1);
                }
            }

            pub fn is_locked(&self) -> bool {
                self.futex.value.load(Ordering::Relaxed) != UNLOCKED
            }
        }
    } else {
        use std::sync::atomic::AtomicU32;

        use crossbeam::utils::Backoff;

        pub struct RawLock {
            state: AtomicU32,
        }

        impl RawLock {
            pub const fn new() -> Self {
                Self { state: AtomicU32::new(UNLOCKED) }
            }

            #[inline]
            pub fn try_lock(&self) -> bool {
                self.state
                    .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            }

            #[inline]
            pub fn lock(&self) {
                if !self.try_lock() {
                    self.lock_contended();
                }
            }

            #[cold]
            fn lock_contended(&self) {
                let backoff = Backoff::new();
                loop {
                    if self.state.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
                        return;
                    }
                    backoff.snooze();
                }
            }

            /// # Safety
            ///
            /// The lock must be held, by this thread or (after `fork()`) by the
            /// thread this process was forked from.
            #[inline]
            pub unsafe fn unlock(&self) {
                self.state.store(UNLOCKED, Ordering::Release);
            }

            pub fn is_locked(&self) -> bool {
                self.state.load(Ordering::Relaxed) != UNLOCKED
            }
        }
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock {
    /// Lock, returning a guard that unlocks on drop.
    #[inline]
    pub fn guard(&self) -> RawLockGuard<'_> {
        self.lock();
        RawLockGuard { lock: self }
    }
}

pub struct RawLockGuard<'a> {
    lock: &'a RawLock,
}

impl Drop for RawLockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard only exists while we hold the lock.
        unsafe { self.lock.unlock() }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::UnsafeCell,
        sync::Arc,
        thread,
    };

    use super::RawLock;

    struct Counter {
        lock: RawLock,
        n: UnsafeCell<usize>,
    }

    unsafe impl Sync for Counter {}

    #[test]
    fn serializes_increments_across_threads() {
        let counter = Arc::new(Counter {
            lock: RawLock::new(),
            n: UnsafeCell::new(0),
        });
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _guard = counter.lock.guard();
                        unsafe { *counter.n.get() += 1 };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(unsafe { *counter.n.get() }, 80_000);
        assert!(!counter.lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = RawLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        unsafe { lock.unlock() };
        assert!(lock.try_lock());
        unsafe { lock.unlock() };
    }
}

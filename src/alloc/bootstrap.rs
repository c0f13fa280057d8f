//! Memory for the time before the real allocator can be trusted.
//!
//! Shared libraries start calling `malloc()` long before anything is ready:
//! the loader resolves symbols, TLS gets set up, our own allocator may call
//! `malloc()` while it is being constructed. All of those requests land in a
//! small static arena that only ever grows.

use std::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use bitflags::bitflags;

use crate::{
    config::{BOOTSTRAP_ALIGNMENT, BOOTSTRAP_ARENA_SIZE},
    util::num::align_up,
};

bitflags! {
    /// Milestones of process start-up. Each bit is set once and never cleared.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Ready: u8 {
        /// The allocator is bound; the arena is no longer the primary source.
        const BRIDGE = 1 << 0;
        /// Thread-local state and the thread hooks are safe to use.
        const THREADS = 1 << 1;
        /// Platform patching has completed.
        const PATCHED = 1 << 2;
    }
}

/// Monotonic readiness flags. Setting publishes with `Release`, checking
/// reads with `Acquire`, so whoever sees a flag also sees everything its
/// setter did first.
pub struct Readiness {
    bits: AtomicU8,
}

impl Readiness {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn get(&self) -> Ready {
        Ready::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    #[inline]
    pub fn contains(&self, flags: Ready) -> bool {
        self.get().contains(flags)
    }

    /// Returns whether any of `flags` was newly set by this call.
    #[inline]
    pub fn set(&self, flags: Ready) -> bool {
        let previous =
            Ready::from_bits_truncate(self.bits.fetch_or(flags.bits(), Ordering::Release));
        !previous.contains(flags)
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C, align(16))]
struct Storage<const N: usize>([u8; N]);

/// A bump allocator over a static buffer.
///
/// The cursor only moves forward, by compare-and-swap, so concurrent requests
/// during start-up each get their own slice. Nothing is ever handed back.
pub struct BootstrapArena<const N: usize = BOOTSTRAP_ARENA_SIZE> {
    storage: UnsafeCell<Storage<N>>,
    cursor: AtomicUsize,
}

// SAFETY: every byte range is handed to exactly one caller by the CAS on
// `cursor`; the arena itself never reads or writes `storage`.
unsafe impl<const N: usize> Sync for BootstrapArena<N> {}

impl<const N: usize> BootstrapArena<N> {
    pub const fn new() -> Self {
        Self {
            storage: UnsafeCell::new(Storage([0; N])),
            cursor: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn base(&self) -> usize {
        self.storage.get() as usize
    }

    /// Carve `size` bytes aligned to `align` (at least the arena alignment).
    /// `None` when the arena is exhausted.
    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let align = align.max(BOOTSTRAP_ALIGNMENT);
        if !align.is_power_of_two() {
            return None;
        }
        let size = align_up(size.max(1), BOOTSTRAP_ALIGNMENT)?;
        let base = self.base();
        let mut cursor = self.cursor.load(Ordering::Relaxed);
        loop {
            let start = align_up(base + cursor, align)? - base;
            let end = start.checked_add(size)?;
            if end > N {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cursor,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                // SAFETY: `start < end <= N`, so this is inside `storage`.
                Ok(_) => return NonNull::new(unsafe { (base as *mut u8).add(start) }),
                Err(actual) => cursor = actual,
            }
        }
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base() && addr < self.base() + N
    }

    /// Conservative size of an arena pointer: everything from `ptr` to the
    /// end of the arena. 0 for pointers outside it.
    pub fn remaining_from(&self, ptr: *const u8) -> usize {
        if self.contains(ptr) {
            self.base() + N - ptr as usize
        } else {
            0
        }
    }

    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for BootstrapArena<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn pointers_are_aligned_and_disjoint() {
        let arena: BootstrapArena<4096> = BootstrapArena::new();
        let a = arena.allocate(3, 1).unwrap().as_ptr();
        let b = arena.allocate(17, 1).unwrap().as_ptr();
        let c = arena.allocate(8, 256).unwrap().as_ptr();
        assert_eq!(a as usize % 16, 0);
        assert_eq!(b as usize % 16, 0);
        assert_eq!(c as usize % 256, 0);
        assert!(b as usize >= a as usize + 16);
        assert!(c as usize >= b as usize + 32);
        assert!(arena.contains(a) && arena.contains(c));
    }

    #[test]
    fn exhaustion_is_reported() {
        let arena: BootstrapArena<64> = BootstrapArena::new();
        assert!(arena.allocate(48, 16).is_some());
        assert!(arena.allocate(32, 16).is_none());
        assert!(arena.allocate(16, 16).is_some());
        assert!(arena.allocate(1, 16).is_none());
        assert!(arena.allocate(usize::MAX, 16).is_none());
        assert_eq!(arena.used(), 64);
    }

    #[test]
    fn size_estimate_runs_to_the_end() {
        let arena: BootstrapArena<1024> = BootstrapArena::new();
        let p = arena.allocate(10, 16).unwrap().as_ptr();
        assert_eq!(arena.remaining_from(p), 1024 - (p as usize - arena.base()));
        assert!(arena.remaining_from(p) >= 10);
        let outside = 0usize;
        assert_eq!(arena.remaining_from(&outside as *const usize as *const u8), 0);
    }

    #[test]
    fn concurrent_bumps_never_overlap() {
        let arena: Arc<BootstrapArena<{ 64 * 1024 }>> = Arc::new(BootstrapArena::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    (0..200)
                        .filter_map(|_| arena.allocate(16, 16))
                        .map(|p| p.as_ptr() as usize)
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        for h in handles {
            for addr in h.join().unwrap() {
                assert!(seen.insert(addr), "address {addr:#x} handed out twice");
            }
        }
        assert_eq!(seen.len(), 1600);
    }

    #[test]
    fn readiness_is_monotonic() {
        let ready = Readiness::new();
        assert!(ready.get().is_empty());
        assert!(ready.set(Ready::BRIDGE));
        assert!(!ready.set(Ready::BRIDGE));
        assert!(ready.set(Ready::THREADS));
        assert!(ready.contains(Ready::BRIDGE | Ready::THREADS));
        assert!(!ready.contains(Ready::PATCHED));
    }
}

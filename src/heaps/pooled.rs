use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    alloc::Allocator,
    heaps::DlHeap,
    os::thread_token,
};

/// A fixed pool of [`DlHeap`]s, with each thread hashed onto one of them so
/// unrelated threads rarely contend on the same lock.
///
/// Blocks remember which heap they came from, so any thread can free any
/// block. The thread hooks keep a per-heap count of live threads.
pub struct PooledHeap<const N: usize = 8> {
    heaps: [DlHeap; N],
    residents: [AtomicUsize; N],
}

impl<const N: usize> PooledHeap<N> {
    const NONEMPTY: () = assert!(N > 0 && N <= u32::MAX as usize);

    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::NONEMPTY;
        Self {
            heaps: std::array::from_fn(|i| DlHeap::with_id(i as u32)),
            residents: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    #[inline]
    fn home_index(&self) -> usize {
        // Fibonacci hashing; thread tokens are usually aligned addresses.
        let h = thread_token().wrapping_mul(0x9e37_79b9_7f4a_7c15_u64 as usize);
        (h >> (usize::BITS / 2)) % N
    }

    #[inline]
    fn home(&self) -> &DlHeap {
        &self.heaps[self.home_index()]
    }

    /// # Safety
    ///
    /// As for [`DlHeap::owner_of`].
    #[inline]
    unsafe fn owner(&self, ptr: *mut u8) -> Option<&DlHeap> {
        DlHeap::owner_of(ptr).and_then(|id| self.heaps.get(id as usize))
    }

    /// How many started-but-not-ended threads hash onto each heap.
    pub fn residents(&self) -> [usize; N] {
        std::array::from_fn(|i| self.residents[i].load(Ordering::Relaxed))
    }
}

impl<const N: usize> Default for PooledHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<const N: usize> Allocator for PooledHeap<N> {
    const THREAD_HOOKS: bool = true;

    fn allocate(&self, size: usize) -> *mut u8 {
        self.home().allocate(size)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if let Some(heap) = self.owner(ptr) {
            heap.free(ptr)
        }
    }

    fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        self.home().aligned_allocate(align, size)
    }

    unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        match self.owner(ptr) {
            Some(heap) => heap.size_of(ptr),
            None => 0,
        }
    }

    fn lock(&self) {
        for heap in &self.heaps {
            heap.lock();
        }
    }

    unsafe fn unlock(&self) {
        for heap in self.heaps.iter().rev() {
            heap.unlock();
        }
    }

    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        match self.owner(ptr) {
            Some(heap) => heap.resize(ptr, new_size),
            None => std::ptr::null_mut(),
        }
    }

    fn on_thread_start(&self) {
        self.residents[self.home_index()].fetch_add(1, Ordering::Relaxed);
    }

    fn on_thread_end(&self) {
        let _ = self.residents[self.home_index()].fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |n| n.checked_sub(1),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn blocks_can_be_freed_from_any_thread() {
        let pool = Arc::new(PooledHeap::<4>::new());
        let blocks: Vec<usize> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    pool.on_thread_start();
                    let p = pool.allocate(64);
                    unsafe { std::ptr::write_bytes(p, 0xab, 64) };
                    pool.on_thread_end();
                    p as usize
                })
            })
            .map(|h| h.join().unwrap())
            .collect();

        for addr in blocks {
            let p = addr as *mut u8;
            assert!(unsafe { pool.size_of(p) } >= 64);
            unsafe { pool.free(p) };
        }
        assert_eq!(pool.residents(), [0; 4]);
    }

    #[test]
    fn lock_takes_every_heap() {
        let pool = PooledHeap::<3>::new();
        pool.lock();
        unsafe { pool.unlock() };
        let p = pool.allocate(8);
        assert!(!p.is_null());
        unsafe { pool.free(p) };
    }
}

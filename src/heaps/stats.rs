use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

use crate::alloc::Allocator;

/// Counters kept by [`StatsHeap`]. A snapshot; fields are read one at a time
/// so they may be mutually a little out of date.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub allocations: usize,
    pub frees: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
    pub threads_started: usize,
    pub threads_ended: usize,
}

/// Wraps any allocator and keeps running totals of what passes through it.
///
/// Only counts; reporting is up to whoever calls [`StatsHeap::snapshot`].
pub struct StatsHeap<H> {
    inner: H,
    allocations: CachePadded<AtomicUsize>,
    frees: CachePadded<AtomicUsize>,
    live_bytes: CachePadded<AtomicUsize>,
    peak_bytes: AtomicUsize,
    threads_started: AtomicUsize,
    threads_ended: AtomicUsize,
}

impl<H: Allocator> StatsHeap<H> {
    pub const fn new(inner: H) -> Self {
        Self {
            inner,
            allocations: CachePadded::new(AtomicUsize::new(0)),
            frees: CachePadded::new(AtomicUsize::new(0)),
            live_bytes: CachePadded::new(AtomicUsize::new(0)),
            peak_bytes: AtomicUsize::new(0),
            threads_started: AtomicUsize::new(0),
            threads_ended: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            threads_started: self.threads_started.load(Ordering::Relaxed),
            threads_ended: self.threads_ended.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn record_alloc(&self, ptr: *mut u8) -> *mut u8 {
        if !ptr.is_null() {
            // SAFETY: fresh block from `inner`.
            let size = unsafe { self.inner.size_of(ptr) };
            self.allocations.fetch_add(1, Ordering::Relaxed);
            let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
            self.peak_bytes.fetch_max(live, Ordering::Relaxed);
        }
        ptr
    }

    #[inline]
    fn record_free(&self, size: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }
}

unsafe impl<H: Allocator> Allocator for StatsHeap<H> {
    const MIN_ALIGN: usize = H::MIN_ALIGN;
    const THREAD_HOOKS: bool = true;

    fn allocate(&self, size: usize) -> *mut u8 {
        self.record_alloc(self.inner.allocate(size))
    }

    unsafe fn free(&self, ptr: *mut u8) {
        let size = self.inner.size_of(ptr);
        if size != 0 {
            self.record_free(size);
        }
        self.inner.free(ptr)
    }

    fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        self.record_alloc(self.inner.aligned_allocate(align, size))
    }

    unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        self.inner.size_of(ptr)
    }

    fn lock(&self) {
        self.inner.lock()
    }

    unsafe fn unlock(&self) {
        self.inner.unlock()
    }

    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let old = self.inner.size_of(ptr);
        let new = self.inner.resize(ptr, new_size);
        if !new.is_null() {
            let size = self.inner.size_of(new);
            if size >= old {
                let live = self.live_bytes.fetch_add(size - old, Ordering::Relaxed) + (size - old);
                self.peak_bytes.fetch_max(live, Ordering::Relaxed);
            } else {
                self.live_bytes.fetch_sub(old - size, Ordering::Relaxed);
            }
        }
        new
    }

    fn on_thread_start(&self) {
        self.threads_started.fetch_add(1, Ordering::Relaxed);
        self.inner.on_thread_start()
    }

    fn on_thread_end(&self) {
        self.threads_ended.fetch_add(1, Ordering::Relaxed);
        self.inner.on_thread_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heaps::DlHeap;

    #[test]
    fn tracks_live_and_peak_bytes() {
        let heap = StatsHeap::new(DlHeap::new());
        let a = heap.allocate(100);
        let b = heap.allocate(200);
        let peak = heap.snapshot().live_bytes;
        assert!(peak >= 300);
        unsafe {
            heap.free(a);
            heap.free(b);
        }
        let stats = heap.snapshot();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 2);
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.peak_bytes, peak);
    }

    #[test]
    fn resize_adjusts_live_bytes() {
        let heap = StatsHeap::new(DlHeap::new());
        let p = heap.allocate(16);
        let p = unsafe { heap.resize(p, 1024) };
        assert!(heap.snapshot().live_bytes >= 1024);
        unsafe { heap.free(p) };
        assert_eq!(heap.snapshot().live_bytes, 0);
    }
}

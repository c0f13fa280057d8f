use std::ptr;

use crate::{
    alloc::adapter::Allocator,
    util::num::align_up,
};

/// Normalises a bare heap to what C callers expect.
///
/// Sizes are rounded up to a multiple of `MIN_ALIGN` (and never zero),
/// alignments are raised to at least `MIN_ALIGN`, and a resize that still
/// fits the existing block returns it unchanged.
pub struct Ansi<A> {
    inner: A,
}

impl<A: Allocator> Ansi<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    #[inline]
    fn normalize(size: usize) -> Option<usize> {
        align_up(size.max(1), A::MIN_ALIGN)
    }
}

unsafe impl<A: Allocator> Allocator for Ansi<A> {
    const MIN_ALIGN: usize = A::MIN_ALIGN;
    const THREAD_HOOKS: bool = A::THREAD_HOOKS;

    fn allocate(&self, size: usize) -> *mut u8 {
        match Self::normalize(size) {
            Some(size) => self.inner.allocate(size),
            None => ptr::null_mut(),
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        self.inner.free(ptr)
    }

    fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        match Self::normalize(size) {
            Some(size) => self.inner.aligned_allocate(align.max(A::MIN_ALIGN), size),
            None => ptr::null_mut(),
        }
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
        if self.inner.size_of(ptr) >= new_size {
            return ptr;
        }
        let Some(new_size) = Self::normalize(new_size) else {
            return ptr::null_mut();
        };
        self.inner.resize(ptr, new_size)
    }

    fn on_thread_start(&self) {
        self.inner.on_thread_start()
    }

    fn on_thread_end(&self) {
        self.inner.on_thread_end()
    }
}

#[cfg(test)]
mod tests {
    use super::Ansi;
    use crate::{alloc::adapter::Allocator, heaps::DlHeap};

    #[test]
    fn zero_sized_requests_get_a_real_block() {
        let heap = Ansi::new(DlHeap::new());
        let p = heap.allocate(0);
        assert!(!p.is_null());
        assert!(unsafe { heap.size_of(p) } >= 16);
        unsafe { heap.free(p) };
    }

    #[test]
    fn resize_within_the_block_is_in_place() {
        let heap = Ansi::new(DlHeap::new());
        let p = heap.allocate(100);
        let usable = unsafe { heap.size_of(p) };
        assert_eq!(unsafe { heap.resize(p, usable) }, p);
        assert_eq!(unsafe { heap.resize(p, 10) }, p);
        let q = unsafe { heap.resize(p, usable + 1) };
        assert!(!q.is_null());
        unsafe { heap.free(q) };
    }

    #[test]
    fn overflowing_sizes_fail_cleanly() {
        let heap = Ansi::new(DlHeap::new());
        assert!(heap.allocate(usize::MAX).is_null());
        assert!(heap.aligned_allocate(64, usize::MAX - 8).is_null());
    }
}

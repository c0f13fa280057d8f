//! Binds a concrete allocator to the fixed interception surface.

use std::ptr;

use crate::{
    alloc::adapter::Allocator,
    lazy_lock::{LazyLock, LazyLockState},
    util::{fatal, hint::cold, num::checked_total},
};

/// The process-wide allocator instance, built in place in static storage on
/// first use and never dropped.
pub struct Bridge<A> {
    heap: LazyLock<A>,
}

impl<A: Allocator> Bridge<A> {
    pub const fn new(init: fn() -> A) -> Self {
        Self {
            heap: LazyLock::new(init),
        }
    }

    /// Build the allocator if nobody has. `Err(Initializing)` means the
    /// allocator is being built right now, possibly by this very thread.
    #[inline]
    pub fn bind(&self) -> Result<&A, LazyLockState> {
        self.heap.force()
    }

    #[inline]
    pub fn is_bound(&self) -> bool {
        self.heap.get().is_some()
    }

    pub fn state(&self) -> LazyLockState {
        LazyLock::state(&self.heap)
    }

    #[inline]
    fn heap(&self) -> &A {
        match self.heap.get() {
            Some(heap) => heap,
            None => cold(|| fatal("bridge used before its allocator was bound")),
        }
    }

    #[inline]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.heap().allocate(size)
    }

    /// # Safety
    ///
    /// `ptr` is null or a live handle from this bridge.
    #[inline]
    pub unsafe fn free(&self, ptr: *mut u8) {
        if !ptr.is_null() {
            self.heap().free(ptr)
        }
    }

    #[inline]
    pub fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }
        self.heap().aligned_allocate(align, size)
    }

    /// # Safety
    ///
    /// `ptr` is null or a pointer the allocator is prepared to inspect.
    #[inline]
    pub unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            0
        } else {
            self.heap().size_of(ptr)
        }
    }

    /// `null → allocate`, `0 → free + null`, otherwise the allocator's own
    /// resize (or the copying fallback).
    ///
    /// # Safety
    ///
    /// `ptr` is null or a live handle from this bridge.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        self.heap().resize(ptr, size)
    }

    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = checked_total(count, size) else {
            return ptr::null_mut();
        };
        let ptr = self.allocate(total);
        if !ptr.is_null() {
            // SAFETY: a non-null handle is valid for `total` bytes.
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    pub fn lock(&self) {
        self.heap().lock()
    }

    /// # Safety
    ///
    /// Pairs with a preceding [`Bridge::lock`].
    pub unsafe fn unlock(&self) {
        self.heap().unlock()
    }

    pub fn on_thread_start(&self) {
        if let Some(heap) = self.heap.get() {
            heap.on_thread_start()
        }
    }

    pub fn on_thread_end(&self) {
        if let Some(heap) = self.heap.get() {
            heap.on_thread_end()
        }
    }
}

/// Resize for allocators without a native one: allocate `new_size`, copy
/// `min(old, new)` bytes, free the old block. If the new allocation fails the
/// old block is left untouched and null is returned.
///
/// # Safety
///
/// `ptr` is a non-null live handle from `heap`.
pub unsafe fn fallback_resize<A: Allocator + ?Sized>(
    heap: &A,
    ptr: *mut u8,
    new_size: usize,
) -> *mut u8 {
    let old_size = heap.size_of(ptr);
    let new = heap.allocate(new_size);
    if new.is_null() {
        return new;
    }
    ptr::copy_nonoverlapping(ptr, new, old_size.min(new_size));
    heap.free(ptr);
    new
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::heaps::DlHeap;

    /// Counts frees so tests can observe the fallback paths.
    struct Counting {
        inner: DlHeap,
        frees: AtomicUsize,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                inner: DlHeap::new(),
                frees: AtomicUsize::new(0),
            }
        }
    }

    unsafe impl Allocator for Counting {
        fn allocate(&self, size: usize) -> *mut u8 {
            self.inner.allocate(size)
        }

        unsafe fn free(&self, ptr: *mut u8) {
            self.frees.fetch_add(1, Ordering::Relaxed);
            self.inner.free(ptr)
        }

        fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
            self.inner.aligned_allocate(align, size)
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
    }

    static BRIDGE: Bridge<Counting> = Bridge::new(Counting::new);

    fn bridge() -> &'static Bridge<Counting> {
        assert!(BRIDGE.bind().is_ok());
        &BRIDGE
    }

    #[test]
    fn free_null_is_a_noop() {
        let bridge = bridge();
        let before = bridge.heap().frees.load(Ordering::Relaxed);
        unsafe { bridge.free(ptr::null_mut()) };
        assert_eq!(bridge.heap().frees.load(Ordering::Relaxed), before);
    }

    #[test]
    fn resize_null_allocates_and_resize_zero_frees() {
        let bridge = bridge();
        let p = unsafe { bridge.resize(ptr::null_mut(), 40) };
        assert!(!p.is_null());
        assert!(unsafe { bridge.size_of(p) } >= 40);

        let before = bridge.heap().frees.load(Ordering::Relaxed);
        let q = unsafe { bridge.resize(p, 0) };
        assert!(q.is_null());
        assert!(bridge.heap().frees.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn fallback_resize_keeps_the_prefix() {
        let bridge = bridge();
        let p = bridge.allocate(1000);
        unsafe { ptr::write_bytes(p, 0x42, 1000) };
        let q = unsafe { bridge.resize(p, 100) };
        let prefix = unsafe { std::slice::from_raw_parts(q, 100) };
        assert!(prefix.iter().all(|&b| b == 0x42));

        let r = unsafe { bridge.resize(q, 5000) };
        let prefix = unsafe { std::slice::from_raw_parts(r, 100) };
        assert!(prefix.iter().all(|&b| b == 0x42));
        unsafe { bridge.free(r) };
    }

    #[test]
    fn zero_allocate_zeroes_and_rejects_overflow() {
        let bridge = bridge();
        assert!(bridge.zero_allocate(usize::MAX, usize::MAX).is_null());
        assert!(bridge.zero_allocate(usize::MAX / 8, 16).is_null());

        let p = bridge.zero_allocate(25, 4);
        assert!(!p.is_null());
        let bytes = unsafe { std::slice::from_raw_parts(p, 100) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { bridge.free(p) };
    }

    #[test]
    fn aligned_allocate_rejects_bad_alignment() {
        let bridge = bridge();
        assert!(bridge.aligned_allocate(3, 64).is_null());
        assert!(bridge.aligned_allocate(0, 64).is_null());
        let p = bridge.aligned_allocate(4096, 64);
        assert_eq!(p as usize % 4096, 0);
        unsafe { bridge.free(p) };
    }
}

use std::{ffi::c_void, mem::transmute, ptr};

use crate::{
    alloc::Allocator,
    config::MIN_ALIGNMENT,
    os::dl::next_symbol,
    util::fatal,
};

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type MemalignFn = unsafe extern "C" fn(*mut *mut c_void, usize, usize) -> libc::c_int;
type UsableSizeFn = unsafe extern "C" fn(*const c_void) -> usize;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;

#[cfg(target_vendor = "apple")]
const USABLE_SIZE: &std::ffi::CStr = c"malloc_size";
#[cfg(not(target_vendor = "apple"))]
const USABLE_SIZE: &std::ffi::CStr = c"malloc_usable_size";

/// Passes everything through to the allocator we displaced.
///
/// The real functions are looked up with `dlsym(RTLD_NEXT)` when the heap is
/// constructed. `dlsym` itself allocates, which is exactly the re-entrant
/// construction the bootstrap arena exists for.
pub struct SystemHeap {
    malloc: MallocFn,
    free: FreeFn,
    posix_memalign: MemalignFn,
    usable_size: UsableSizeFn,
    realloc: ReallocFn,
}

impl SystemHeap {
    pub fn new() -> Self {
        let lookup = |name| match next_symbol(name) {
            Some(addr) => addr.get(),
            None => fatal("system allocator symbol missing"),
        };
        // SAFETY: each address is the libc definition of the matching C
        // prototype.
        unsafe {
            Self {
                malloc: transmute::<usize, MallocFn>(lookup(c"malloc")),
                free: transmute::<usize, FreeFn>(lookup(c"free")),
                posix_memalign: transmute::<usize, MemalignFn>(lookup(c"posix_memalign")),
                usable_size: transmute::<usize, UsableSizeFn>(lookup(USABLE_SIZE)),
                realloc: transmute::<usize, ReallocFn>(lookup(c"realloc")),
            }
        }
    }
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Allocator for SystemHeap {
    fn allocate(&self, size: usize) -> *mut u8 {
        // SAFETY: plain libc call.
        unsafe { (self.malloc)(size).cast() }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        (self.free)(ptr.cast())
    }

    fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        let mut out = ptr::null_mut();
        let align = align.max(MIN_ALIGNMENT);
        // SAFETY: `align` is a power of two and a multiple of the pointer size.
        match unsafe { (self.posix_memalign)(&mut out, align, size) } {
            0 => out.cast(),
            _ => ptr::null_mut(),
        }
    }

    unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        (self.usable_size)(ptr.cast())
    }

    // libc takes care of its own locks across fork().
    fn lock(&self) {}

    unsafe fn unlock(&self) {}

    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        (self.realloc)(ptr.cast(), new_size).cast()
    }
}

#[cfg(test)]
mod tests {
    use super::SystemHeap;
    use crate::alloc::Allocator;

    #[test]
    fn passes_through_to_libc() {
        let heap = SystemHeap::new();
        let p = heap.allocate(100);
        assert!(!p.is_null());
        assert!(unsafe { heap.size_of(p) } >= 100);
        let q = unsafe { heap.resize(p, 1000) };
        assert!(unsafe { heap.size_of(q) } >= 1000);
        unsafe { heap.free(q) };

        let a = heap.aligned_allocate(4096, 10);
        assert_eq!(a as usize % 4096, 0);
        unsafe { heap.free(a) };
    }
}

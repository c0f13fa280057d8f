//! The surface as C sees it: `extern "C"` entry points generic over the
//! redirect, and an immutable table of them.

use std::ffi::c_void;

use crate::{alloc::surface::Redirect, threads};

pub unsafe extern "C" fn malloc<R: Redirect>(size: usize) -> *mut c_void {
    R::surface().allocate(size).cast()
}

pub unsafe extern "C" fn free<R: Redirect>(ptr: *mut c_void) {
    R::surface().free(ptr.cast())
}

pub unsafe extern "C" fn memalign<R: Redirect>(align: usize, size: usize) -> *mut c_void {
    R::surface().aligned_allocate(align, size).cast()
}

pub unsafe extern "C" fn usable_size<R: Redirect>(ptr: *mut c_void) -> usize {
    R::surface().size_of(ptr.cast())
}

pub unsafe extern "C" fn realloc<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    R::surface().resize(ptr.cast(), size).cast()
}

pub unsafe extern "C" fn calloc<R: Redirect>(count: usize, size: usize) -> *mut c_void {
    R::surface().zero_allocate(count, size).cast()
}

pub unsafe extern "C" fn lock<R: Redirect>() {
    R::surface().lock()
}

pub unsafe extern "C" fn unlock<R: Redirect>() {
    R::surface().unlock()
}

pub unsafe extern "C" fn thread_start<R: Redirect>() {
    threads::begin::<R>()
}

pub unsafe extern "C" fn thread_end<R: Redirect>() {
    threads::end::<R>()
}

pub unsafe extern "C" fn thread_created() -> libc::c_int {
    threads::any_thread_created() as libc::c_int
}

/// Every surface entry point, for C code that wants to call the active
/// allocator without linking against the interposed names. Built once at
/// compile time; there is no way to swap entries afterwards.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SurfaceTable {
    pub malloc: unsafe extern "C" fn(usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(*mut c_void),
    pub memalign: unsafe extern "C" fn(usize, usize) -> *mut c_void,
    pub usable_size: unsafe extern "C" fn(*mut c_void) -> usize,
    pub realloc: unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(usize, usize) -> *mut c_void,
    pub lock: unsafe extern "C" fn(),
    pub unlock: unsafe extern "C" fn(),
    pub thread_start: unsafe extern "C" fn(),
    pub thread_end: unsafe extern "C" fn(),
    pub thread_created: unsafe extern "C" fn() -> libc::c_int,
}

impl SurfaceTable {
    pub const fn of<R: Redirect>() -> Self {
        Self {
            malloc: malloc::<R>,
            free: free::<R>,
            memalign: memalign::<R>,
            usable_size: usable_size::<R>,
            realloc: realloc::<R>,
            calloc: calloc::<R>,
            lock: lock::<R>,
            unlock: unlock::<R>,
            thread_start: thread_start::<R>,
            thread_end: thread_end::<R>,
            thread_created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SurfaceTable;
    use crate::heaps::DlHeap;

    crate::surface!(Tabled => DlHeap = DlHeap::new);

    static TABLE: SurfaceTable = SurfaceTable::of::<Tabled>();

    #[test]
    fn table_entries_reach_the_surface() {
        unsafe {
            let p = (TABLE.calloc)(4, 8);
            assert!(!p.is_null());
            assert!((TABLE.usable_size)(p) >= 32);
            let q = (TABLE.realloc)(p, 128);
            assert!((TABLE.usable_size)(q) >= 128);
            (TABLE.free)(q);
            (TABLE.free)(std::ptr::null_mut());

            let a = (TABLE.memalign)(256, 10);
            assert_eq!(a as usize % 256, 0);
            (TABLE.free)(a);

            (TABLE.lock)();
            (TABLE.unlock)();
        }
    }
}

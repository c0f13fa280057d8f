//! Darwin's allocation API on top of the surface: its `realloc` flavour, the
//! `malloc_*` extras, and an emulated `malloc_zone_t`.
//!
//! Nothing here needs Darwin to build, so it is tested everywhere. The
//! interpose table that puts it in front of libmalloc is in `macho`.

use std::{
    ffi::{c_char, c_int, c_uint, c_void},
    ptr,
};

use crate::{
    alloc::Redirect,
    config::ZONE_NAME,
    intercept::cstd,
    lazy_lock::LazyLock,
    util::fatal,
};

pub type ZonePtr = *mut MallocZone;

/// Layout-compatible with `malloc_zone_t` from `<malloc/malloc.h>`, version 8.
#[repr(C)]
pub struct MallocZone {
    pub reserved1: *mut c_void,
    pub reserved2: *mut c_void,
    pub size: unsafe extern "C" fn(ZonePtr, *const c_void) -> usize,
    pub malloc: unsafe extern "C" fn(ZonePtr, usize) -> *mut c_void,
    pub calloc: unsafe extern "C" fn(ZonePtr, usize, usize) -> *mut c_void,
    pub valloc: unsafe extern "C" fn(ZonePtr, usize) -> *mut c_void,
    pub free: unsafe extern "C" fn(ZonePtr, *mut c_void),
    pub realloc: unsafe extern "C" fn(ZonePtr, *mut c_void, usize) -> *mut c_void,
    pub destroy: unsafe extern "C" fn(ZonePtr),
    pub zone_name: *const c_char,
    pub batch_malloc: unsafe extern "C" fn(ZonePtr, usize, *mut *mut c_void, c_uint) -> c_uint,
    pub batch_free: unsafe extern "C" fn(ZonePtr, *mut *mut c_void, c_uint),
    pub introspect: *mut c_void,
    pub version: c_uint,
    pub memalign: unsafe extern "C" fn(ZonePtr, usize, usize) -> *mut c_void,
    pub free_definite_size: unsafe extern "C" fn(ZonePtr, *mut c_void, usize),
    pub pressure_relief: Option<unsafe extern "C" fn(ZonePtr, usize) -> usize>,
}

// SAFETY: never written after construction; the raw pointers are either null
// or point at static data.
unsafe impl Sync for MallocZone {}
unsafe impl Send for MallocZone {}

impl MallocZone {
    pub const VERSION: c_uint = 8;

    /// A zone whose every entry forwards to `R`'s surface.
    pub const fn of<R: Redirect>() -> Self {
        Self {
            reserved1: ptr::null_mut(),
            reserved2: ptr::null_mut(),
            size: zone_size::<R>,
            malloc: zone_malloc::<R>,
            calloc: zone_calloc::<R>,
            valloc: zone_valloc::<R>,
            free: zone_free::<R>,
            realloc: zone_realloc::<R>,
            destroy: destroy_zone,
            zone_name: ZONE_NAME.as_ptr(),
            batch_malloc: zone_batch_malloc::<R>,
            batch_free: zone_batch_free::<R>,
            introspect: ptr::null_mut(),
            version: Self::VERSION,
            memalign: zone_memalign::<R>,
            free_definite_size: zone_free_definite_size::<R>,
            pressure_relief: None,
        }
    }
}

/// Where a redirect keeps its zone (see [`Redirect::zone`]). Built on first
/// use; the image's constructor forces it before anything else can ask.
pub type ZoneCell = LazyLock<MallocZone>;

/// `R`'s zone, building it if needed.
pub fn zone<R: Redirect>() -> ZonePtr {
    match R::zone().force() {
        Ok(zone) => zone as *const MallocZone as ZonePtr,
        // Building the zone doesn't allocate, so nobody can observe it
        // half-built.
        Err(_) => fatal("malloc zone requested while it was being built"),
    }
}

// Darwin flavoured C functions.

/// Darwin's `realloc`: size 0 frees and hands back a minimal block, and a
/// shrink by less than half keeps the block where it is.
///
/// # Safety
///
/// `ptr` is null or came from this surface.
pub unsafe fn realloc<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    resize::<R>(ptr, size, false)
}

/// Like [`realloc`], but the original block is freed even when growing it
/// fails.
///
/// # Safety
///
/// As for [`realloc`].
pub unsafe fn reallocf<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    resize::<R>(ptr, size, true)
}

unsafe fn resize<R: Redirect>(ptr: *mut c_void, size: usize, free_on_failure: bool) -> *mut c_void {
    if ptr.is_null() {
        return cstd::malloc::<R>(size);
    }
    if size == 0 {
        cstd::free::<R>(ptr);
        return cstd::malloc::<R>(1);
    }
    let old = cstd::usable_size::<R>(ptr);
    // An arena block's size is only an upper bound, so it always moves out.
    let in_place = !R::surface().is_bootstrap(ptr as *const u8);
    if in_place && old / 2 < size && size <= old {
        return ptr;
    }
    let new = cstd::malloc::<R>(size);
    if !new.is_null() {
        ptr::copy_nonoverlapping(ptr as *const u8, new as *mut u8, old.min(size));
        cstd::free::<R>(ptr);
    } else if free_on_failure {
        cstd::free::<R>(ptr);
    }
    new
}

pub fn malloc_good_size(size: usize) -> usize {
    size.max(1)
}

// Zone entry points. The zone argument is always ours, so it is ignored.

pub unsafe extern "C" fn zone_size<R: Redirect>(_: ZonePtr, ptr: *const c_void) -> usize {
    cstd::usable_size::<R>(ptr as *mut c_void)
}

pub unsafe extern "C" fn zone_malloc<R: Redirect>(_: ZonePtr, size: usize) -> *mut c_void {
    cstd::malloc::<R>(size)
}

pub unsafe extern "C" fn zone_calloc<R: Redirect>(
    _: ZonePtr,
    count: usize,
    size: usize,
) -> *mut c_void {
    cstd::calloc::<R>(count, size)
}

pub unsafe extern "C" fn zone_valloc<R: Redirect>(_: ZonePtr, size: usize) -> *mut c_void {
    cstd::valloc::<R>(size)
}

pub unsafe extern "C" fn zone_free<R: Redirect>(_: ZonePtr, ptr: *mut c_void) {
    cstd::free::<R>(ptr)
}

pub unsafe extern "C" fn zone_free_definite_size<R: Redirect>(
    _: ZonePtr,
    ptr: *mut c_void,
    _: usize,
) {
    cstd::free::<R>(ptr)
}

pub unsafe extern "C" fn zone_realloc<R: Redirect>(
    _: ZonePtr,
    ptr: *mut c_void,
    size: usize,
) -> *mut c_void {
    realloc::<R>(ptr, size)
}

pub unsafe extern "C" fn zone_memalign<R: Redirect>(
    _: ZonePtr,
    align: usize,
    size: usize,
) -> *mut c_void {
    cstd::memalign::<R>(align, size)
}

/// Fill `results` with up to `requested` blocks of `size` bytes, stopping at
/// the first failure. Returns how many were filled.
pub unsafe extern "C" fn zone_batch_malloc<R: Redirect>(
    _: ZonePtr,
    size: usize,
    results: *mut *mut c_void,
    requested: c_uint,
) -> c_uint {
    for i in 0..requested {
        let p = cstd::malloc::<R>(size);
        if p.is_null() {
            return i;
        }
        *results.add(i as usize) = p;
    }
    requested
}

pub unsafe extern "C" fn zone_batch_free<R: Redirect>(
    _: ZonePtr,
    ptrs: *mut *mut c_void,
    count: c_uint,
) {
    for i in 0..count as usize {
        cstd::free::<R>(*ptrs.add(i));
    }
}

/// Our zone lives as long as the process.
pub unsafe extern "C" fn destroy_zone(_: ZonePtr) {}

/// `malloc_get_all_zones`: we report none, so tools that walk zones find
/// nothing to inspect instead of misreading ours.
///
/// # Safety
///
/// Out pointers are valid for writes when non-null.
pub unsafe fn get_all_zones(addresses: *mut *mut usize, count: *mut c_uint) -> c_int {
    if !addresses.is_null() {
        *addresses = ptr::null_mut();
    }
    if !count.is_null() {
        *count = 0;
    }
    // KERN_SUCCESS
    0
}

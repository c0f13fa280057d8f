//! Mach-O backend: dyld reads `(replacement, original)` pairs from the
//! `__DATA,__interpose` section of an inserted image and rebinds every other
//! image's references to `original` before any of their code runs.
//!
//! [`crate::install!`] places [`interpose_table`] in that section and a
//! constructor in `__DATA,__mod_init_func` that calls [`on_load`].

use std::ffi::{c_char, c_int, c_uint, c_void};

use crate::{
    alloc::Redirect,
    fork,
    intercept::{
        cstd,
        darwin::{self, ZonePtr},
    },
    threads::posix,
};

/// One entry of the interpose section, laid out the way dyld reads it.
#[repr(C)]
pub struct Interpose {
    pub replacement: *const (),
    pub original: *const (),
}

// SAFETY: immutable function addresses.
unsafe impl Sync for Interpose {}

impl Interpose {
    pub const fn new(replacement: *const (), original: *const ()) -> Self {
        Self {
            replacement,
            original,
        }
    }
}

mod original {
    use std::ffi::{c_char, c_int, c_uint, c_void};

    use crate::intercept::darwin::ZonePtr;

    extern "C" {
        pub fn malloc(size: usize) -> *mut c_void;
        pub fn free(ptr: *mut c_void);
        pub fn calloc(count: usize, size: usize) -> *mut c_void;
        pub fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
        pub fn reallocf(ptr: *mut c_void, size: usize) -> *mut c_void;
        pub fn valloc(size: usize) -> *mut c_void;
        pub fn vfree(ptr: *mut c_void);
        pub fn aligned_alloc(align: usize, size: usize) -> *mut c_void;
        pub fn posix_memalign(out: *mut *mut c_void, align: usize, size: usize) -> c_int;
        pub fn strdup(s: *const c_char) -> *mut c_char;
        pub fn malloc_size(ptr: *const c_void) -> usize;
        pub fn malloc_good_size(size: usize) -> usize;
        pub fn malloc_printf(format: *const c_char, ...);
        pub fn _malloc_fork_prepare();
        pub fn _malloc_fork_parent();
        pub fn _malloc_fork_child();

        pub fn malloc_create_zone(start_size: usize, flags: c_uint) -> ZonePtr;
        pub fn malloc_default_zone() -> ZonePtr;
        pub fn malloc_default_purgeable_zone() -> ZonePtr;
        pub fn malloc_destroy_zone(zone: ZonePtr);
        pub fn malloc_get_all_zones(
            task: c_uint,
            reader: *const c_void,
            addresses: *mut *mut usize,
            count: *mut c_uint,
        ) -> c_int;
        pub fn malloc_get_zone_name(zone: ZonePtr) -> *const c_char;
        pub fn malloc_set_zone_name(zone: ZonePtr, name: *const c_char);
        pub fn malloc_zone_batch_malloc(
            zone: ZonePtr,
            size: usize,
            results: *mut *mut c_void,
            requested: c_uint,
        ) -> c_uint;
        pub fn malloc_zone_batch_free(zone: ZonePtr, ptrs: *mut *mut c_void, count: c_uint);
        pub fn malloc_zone_calloc(zone: ZonePtr, count: usize, size: usize) -> *mut c_void;
        pub fn malloc_zone_check(zone: ZonePtr) -> c_int;
        pub fn malloc_zone_free(zone: ZonePtr, ptr: *mut c_void);
        pub fn malloc_zone_from_ptr(ptr: *const c_void) -> ZonePtr;
        pub fn malloc_zone_log(zone: ZonePtr, address: *mut c_void);
        pub fn malloc_zone_malloc(zone: ZonePtr, size: usize) -> *mut c_void;
        pub fn malloc_zone_memalign(zone: ZonePtr, align: usize, size: usize) -> *mut c_void;
        pub fn malloc_zone_print(zone: ZonePtr, verbose: c_int);
        pub fn malloc_zone_print_ptr_info(ptr: *mut c_void);
        pub fn malloc_zone_realloc(zone: ZonePtr, ptr: *mut c_void, size: usize) -> *mut c_void;
        pub fn malloc_zone_register(zone: ZonePtr);
        pub fn malloc_zone_unregister(zone: ZonePtr);
        pub fn malloc_zone_valloc(zone: ZonePtr, size: usize) -> *mut c_void;

        pub fn pthread_create(
            thread: *mut libc::pthread_t,
            attr: *const libc::pthread_attr_t,
            start: crate::threads::posix::StartRoutine,
            arg: *mut c_void,
        ) -> c_int;
        pub fn pthread_exit(value: *mut c_void) -> !;
    }

    #[link(name = "c++")]
    extern "C" {
        pub fn _Znwm(size: usize) -> *mut c_void;
        pub fn _Znam(size: usize) -> *mut c_void;
        pub fn _ZnwmRKSt9nothrow_t(size: usize, tag: *const c_void) -> *mut c_void;
        pub fn _ZnamRKSt9nothrow_t(size: usize, tag: *const c_void) -> *mut c_void;
        pub fn _ZnwmSt11align_val_t(size: usize, align: usize) -> *mut c_void;
        pub fn _ZnamSt11align_val_t(size: usize, align: usize) -> *mut c_void;
        pub fn _ZdlPv(ptr: *mut c_void);
        pub fn _ZdaPv(ptr: *mut c_void);
        pub fn _ZdlPvm(ptr: *mut c_void, size: usize);
        pub fn _ZdaPvm(ptr: *mut c_void, size: usize);
        pub fn _ZdlPvRKSt9nothrow_t(ptr: *mut c_void, tag: *const c_void);
        pub fn _ZdaPvRKSt9nothrow_t(ptr: *mut c_void, tag: *const c_void);
        pub fn _ZdlPvSt11align_val_t(ptr: *mut c_void, align: usize);
        pub fn _ZdaPvSt11align_val_t(ptr: *mut c_void, align: usize);
    }
}

// Replacements.

unsafe extern "C" fn malloc<R: Redirect>(size: usize) -> *mut c_void {
    cstd::malloc::<R>(size)
}

unsafe extern "C" fn free<R: Redirect>(ptr: *mut c_void) {
    cstd::free::<R>(ptr)
}

unsafe extern "C" fn calloc<R: Redirect>(count: usize, size: usize) -> *mut c_void {
    cstd::calloc::<R>(count, size)
}

unsafe extern "C" fn realloc<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    darwin::realloc::<R>(ptr, size)
}

unsafe extern "C" fn reallocf<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    darwin::reallocf::<R>(ptr, size)
}

unsafe extern "C" fn valloc<R: Redirect>(size: usize) -> *mut c_void {
    cstd::valloc::<R>(size)
}

unsafe extern "C" fn aligned_alloc<R: Redirect>(align: usize, size: usize) -> *mut c_void {
    cstd::aligned_alloc::<R>(align, size)
}

unsafe extern "C" fn posix_memalign<R: Redirect>(
    out: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    cstd::posix_memalign::<R>(out, align, size)
}

unsafe extern "C" fn strdup<R: Redirect>(s: *const c_char) -> *mut c_char {
    cstd::strdup::<R>(s)
}

unsafe extern "C" fn malloc_size<R: Redirect>(ptr: *const c_void) -> usize {
    cstd::usable_size::<R>(ptr as *mut c_void)
}

unsafe extern "C" fn malloc_good_size(size: usize) -> usize {
    darwin::malloc_good_size(size)
}

// Variadic in C. We never read past the format, so the extra arguments can
// stay where the caller put them.
unsafe extern "C" fn malloc_printf(_: *const c_char) {}

unsafe extern "C" fn new<R: Redirect>(size: usize) -> *mut c_void {
    cstd::new::<R>(size)
}

unsafe extern "C" fn new_nothrow<R: Redirect>(size: usize, _: *const c_void) -> *mut c_void {
    cstd::new_nothrow::<R>(size)
}

unsafe extern "C" fn new_aligned<R: Redirect>(size: usize, align: usize) -> *mut c_void {
    cstd::new_aligned::<R>(size, align)
}

unsafe extern "C" fn delete<R: Redirect>(ptr: *mut c_void) {
    cstd::delete::<R>(ptr)
}

unsafe extern "C" fn delete_with<R: Redirect>(ptr: *mut c_void, _: usize) {
    cstd::delete::<R>(ptr)
}

unsafe extern "C" fn delete_nothrow<R: Redirect>(ptr: *mut c_void, _: *const c_void) {
    cstd::delete::<R>(ptr)
}

unsafe extern "C" fn create_zone<R: Redirect>(_: usize, _: c_uint) -> ZonePtr {
    darwin::zone::<R>()
}

unsafe extern "C" fn default_zone<R: Redirect>() -> ZonePtr {
    darwin::zone::<R>()
}

unsafe extern "C" fn zone_from_ptr<R: Redirect>(_: *const c_void) -> ZonePtr {
    darwin::zone::<R>()
}

unsafe extern "C" fn get_all_zones(
    _: c_uint,
    _: *const c_void,
    addresses: *mut *mut usize,
    count: *mut c_uint,
) -> c_int {
    darwin::get_all_zones(addresses, count)
}

unsafe extern "C" fn get_zone_name(zone: ZonePtr) -> *const c_char {
    if zone.is_null() {
        std::ptr::null()
    } else {
        (*zone).zone_name
    }
}

unsafe extern "C" fn zone_check(_: ZonePtr) -> c_int {
    1
}

unsafe extern "C" fn ignore_zone(_: ZonePtr) {}

unsafe extern "C" fn ignore_zone_with(_: ZonePtr, _: *const c_void) {}

unsafe extern "C" fn ignore_zone_flag(_: ZonePtr, _: c_int) {}

unsafe extern "C" fn ignore_ptr(_: *mut c_void) {}

unsafe extern "C" fn fork_prepare<R: Redirect>() {
    fork::prepare::<R>()
}

unsafe extern "C" fn fork_parent<R: Redirect>() {
    fork::parent::<R>()
}

unsafe extern "C" fn fork_child<R: Redirect>() {
    fork::child::<R>()
}

macro_rules! interpose_table {
    ($($replacement:expr => $original:ident),* $(,)?) => {
        /// Entries in [`interpose_table`].
        pub const INTERPOSE_COUNT: usize = [$(stringify!($original)),*].len();

        /// Every pair dyld should rebind for `R`.
        pub const fn interpose_table<R: Redirect>() -> [Interpose; INTERPOSE_COUNT] {
            [$(Interpose::new($replacement as *const (), original::$original as *const ())),*]
        }
    };
}

interpose_table! {
    malloc::<R> => malloc,
    free::<R> => free,
    calloc::<R> => calloc,
    realloc::<R> => realloc,
    reallocf::<R> => reallocf,
    valloc::<R> => valloc,
    free::<R> => vfree,
    aligned_alloc::<R> => aligned_alloc,
    posix_memalign::<R> => posix_memalign,
    strdup::<R> => strdup,
    malloc_size::<R> => malloc_size,
    malloc_good_size => malloc_good_size,
    malloc_printf => malloc_printf,
    fork_prepare::<R> => _malloc_fork_prepare,
    fork_parent::<R> => _malloc_fork_parent,
    fork_child::<R> => _malloc_fork_child,

    new::<R> => _Znwm,
    new::<R> => _Znam,
    new_nothrow::<R> => _ZnwmRKSt9nothrow_t,
    new_nothrow::<R> => _ZnamRKSt9nothrow_t,
    new_aligned::<R> => _ZnwmSt11align_val_t,
    new_aligned::<R> => _ZnamSt11align_val_t,
    delete::<R> => _ZdlPv,
    delete::<R> => _ZdaPv,
    delete_with::<R> => _ZdlPvm,
    delete_with::<R> => _ZdaPvm,
    delete_nothrow::<R> => _ZdlPvRKSt9nothrow_t,
    delete_nothrow::<R> => _ZdaPvRKSt9nothrow_t,
    delete_with::<R> => _ZdlPvSt11align_val_t,
    delete_with::<R> => _ZdaPvSt11align_val_t,

    create_zone::<R> => malloc_create_zone,
    default_zone::<R> => malloc_default_zone,
    default_zone::<R> => malloc_default_purgeable_zone,
    darwin::destroy_zone => malloc_destroy_zone,
    get_all_zones => malloc_get_all_zones,
    get_zone_name => malloc_get_zone_name,
    ignore_zone_with => malloc_set_zone_name,
    darwin::zone_batch_malloc::<R> => malloc_zone_batch_malloc,
    darwin::zone_batch_free::<R> => malloc_zone_batch_free,
    darwin::zone_calloc::<R> => malloc_zone_calloc,
    zone_check => malloc_zone_check,
    darwin::zone_free::<R> => malloc_zone_free,
    zone_from_ptr::<R> => malloc_zone_from_ptr,
    ignore_zone_with => malloc_zone_log,
    darwin::zone_malloc::<R> => malloc_zone_malloc,
    darwin::zone_memalign::<R> => malloc_zone_memalign,
    ignore_zone_flag => malloc_zone_print,
    ignore_ptr => malloc_zone_print_ptr_info,
    darwin::zone_realloc::<R> => malloc_zone_realloc,
    ignore_zone => malloc_zone_register,
    ignore_zone => malloc_zone_unregister,
    darwin::zone_valloc::<R> => malloc_zone_valloc,

    posix::pthread_create::<R> => pthread_create,
    posix::pthread_exit::<R> => pthread_exit,
}

/// Runs from the image's constructor. The fork handlers are reached through
/// the interposed `_malloc_fork_*` functions, so nothing is registered with
/// `pthread_atfork()`.
pub fn on_load<R: Redirect>() {
    darwin::zone::<R>();
    super::on_load::<R>(false);
}

//! The macros that turn an allocator into a process-wide `malloc()`.
//!
//! ```ignore
//! heapswap::surface!(pub Heap => DlHeap = DlHeap::new);
//! heapswap::install!(Heap);
//! ```
//!
//! [`surface!`](crate::surface) declares the marker type and its static
//! [`Surface`](crate::Surface). [`install!`](crate::install) emits the exported
//! symbols the target's loader needs, plus the `heapswap_*` entry points,
//! and belongs in exactly one image per process (normally a `cdylib`).

cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        mod macho;
    } else if #[cfg(unix)] {
        mod elf;
    } else if #[cfg(windows)] {
        mod pe;
    }
}

/// Declare a marker type bound to a static surface over `$alloc`.
///
/// `$init` builds the allocator on first use. It is a `fn() -> $alloc`: a
/// function path or a non-capturing closure.
#[macro_export]
macro_rules! surface {
    ($vis:vis $name:ident => $alloc:ty = $init:expr) => {
        $vis struct $name;

        impl $crate::Redirect for $name {
            type Alloc = $alloc;

            #[inline]
            fn surface() -> &'static $crate::Surface<$alloc> {
                static SURFACE: $crate::Surface<$alloc> = $crate::Surface::new($init);
                &SURFACE
            }

            fn zone() -> &'static $crate::intercept::darwin::ZoneCell {
                static ZONE: $crate::intercept::darwin::ZoneCell =
                    $crate::LazyLock::new($crate::intercept::darwin::MallocZone::of::<$name>);
                &ZONE
            }
        }
    };
}

/// Export everything the target needs to route the process's allocations to
/// `$redirect`'s surface.
#[macro_export]
macro_rules! install {
    ($redirect:ty) => {
        $crate::__heapswap_abi!($redirect);
        $crate::__heapswap_backend!($redirect);
    };
}

/// The `heapswap_*` entry points, on every platform.
#[doc(hidden)]
#[macro_export]
macro_rules! __heapswap_abi {
    ($r:ty) => {
        const _: () = {
            use ::core::ffi::{c_int, c_void};
            use $crate::alloc::table;

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_malloc(size: usize) -> *mut c_void {
                table::malloc::<$r>(size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_free(ptr: *mut c_void) {
                table::free::<$r>(ptr)
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_memalign(align: usize, size: usize) -> *mut c_void {
                table::memalign::<$r>(align, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_usable_size(ptr: *mut c_void) -> usize {
                table::usable_size::<$r>(ptr)
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_realloc(
                ptr: *mut c_void,
                size: usize,
            ) -> *mut c_void {
                table::realloc::<$r>(ptr, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_calloc(count: usize, size: usize) -> *mut c_void {
                table::calloc::<$r>(count, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_lock() {
                table::lock::<$r>()
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_unlock() {
                table::unlock::<$r>()
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_thread_start() {
                table::thread_start::<$r>()
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_thread_end() {
                table::thread_end::<$r>()
            }

            #[no_mangle]
            pub unsafe extern "C" fn heapswap_thread_created() -> c_int {
                table::thread_created()
            }

            #[no_mangle]
            pub extern "C" fn heapswap_surface_table() -> *const $crate::SurfaceTable {
                static TABLE: $crate::SurfaceTable = $crate::SurfaceTable::of::<$r>();
                &TABLE
            }
        };
    };
}

//! ELF: strong definitions of every glibc and libstdc++ allocation name,
//! and a constructor that runs early in `.init_array`.

#[doc(hidden)]
#[macro_export]
macro_rules! __heapswap_backend {
    ($r:ty) => {
        const _: () = {
            use ::core::ffi::{c_char, c_int, c_void};
            use $crate::intercept::{cstd, elf};

            #[no_mangle]
            pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
                cstd::malloc::<$r>(size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn free(ptr: *mut c_void) {
                cstd::free::<$r>(ptr)
            }

            #[no_mangle]
            pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
                cstd::free::<$r>(ptr)
            }

            #[no_mangle]
            pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
                cstd::calloc::<$r>(count, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
                cstd::realloc::<$r>(ptr, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn reallocarray(
                ptr: *mut c_void,
                count: usize,
                size: usize,
            ) -> *mut c_void {
                cstd::reallocarray::<$r>(ptr, count, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
                cstd::memalign::<$r>(align, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn posix_memalign(
                out: *mut *mut c_void,
                align: usize,
                size: usize,
            ) -> c_int {
                cstd::posix_memalign::<$r>(out, align, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
                cstd::aligned_alloc::<$r>(align, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
                cstd::valloc::<$r>(size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
                cstd::pvalloc::<$r>(size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
                cstd::usable_size::<$r>(ptr)
            }

            #[no_mangle]
            pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
                cstd::strdup::<$r>(s)
            }

            #[no_mangle]
            pub unsafe extern "C" fn strndup(s: *const c_char, n: usize) -> *mut c_char {
                cstd::strndup::<$r>(s, n)
            }

            #[no_mangle]
            pub unsafe extern "C" fn getcwd(buf: *mut c_char, size: usize) -> *mut c_char {
                elf::getcwd::<$r>(buf, size)
            }

            #[no_mangle]
            pub extern "C" fn mallopt(param: c_int, value: c_int) -> c_int {
                elf::mallopt(param, value)
            }

            #[no_mangle]
            pub extern "C" fn malloc_trim(pad: usize) -> c_int {
                elf::malloc_trim(pad)
            }

            #[no_mangle]
            pub extern "C" fn malloc_stats() {}

            #[no_mangle]
            pub extern "C" fn mallinfo() -> elf::Mallinfo {
                elf::mallinfo()
            }

            #[no_mangle]
            pub unsafe extern "C" fn __libc_malloc(size: usize) -> *mut c_void {
                cstd::malloc::<$r>(size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn __libc_free(ptr: *mut c_void) {
                cstd::free::<$r>(ptr)
            }

            #[no_mangle]
            pub unsafe extern "C" fn __libc_calloc(count: usize, size: usize) -> *mut c_void {
                cstd::calloc::<$r>(count, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
                cstd::realloc::<$r>(ptr, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn __libc_memalign(align: usize, size: usize) -> *mut c_void {
                cstd::memalign::<$r>(align, size)
            }

            #[no_mangle]
            pub unsafe extern "C" fn pthread_create(
                thread: *mut $crate::__private::libc::pthread_t,
                attr: *const $crate::__private::libc::pthread_attr_t,
                start: $crate::threads::posix::StartRoutine,
                arg: *mut c_void,
            ) -> c_int {
                $crate::threads::posix::pthread_create::<$r>(thread, attr, start, arg)
            }

            #[no_mangle]
            pub unsafe extern "C" fn pthread_exit(value: *mut c_void) -> ! {
                $crate::threads::posix::pthread_exit::<$r>(value)
            }

            // libstdc++ operators. `size_t` mangles as `m` on LP64, `j` on ILP32.

            #[cfg_attr(target_pointer_width = "64", export_name = "_Znwm")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_Znwj")]
            pub unsafe extern "C" fn heapswap_cxx_new(size: usize) -> *mut c_void {
                cstd::new::<$r>(size)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_Znam")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_Znaj")]
            pub unsafe extern "C" fn heapswap_cxx_new_array(size: usize) -> *mut c_void {
                cstd::new::<$r>(size)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZnwmRKSt9nothrow_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZnwjRKSt9nothrow_t")]
            pub unsafe extern "C" fn heapswap_cxx_new_nothrow(
                size: usize,
                _: *const c_void,
            ) -> *mut c_void {
                cstd::new_nothrow::<$r>(size)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZnamRKSt9nothrow_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZnajRKSt9nothrow_t")]
            pub unsafe extern "C" fn heapswap_cxx_new_array_nothrow(
                size: usize,
                _: *const c_void,
            ) -> *mut c_void {
                cstd::new_nothrow::<$r>(size)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZnwmSt11align_val_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZnwjSt11align_val_t")]
            pub unsafe extern "C" fn heapswap_cxx_new_aligned(
                size: usize,
                align: usize,
            ) -> *mut c_void {
                cstd::new_aligned::<$r>(size, align)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZnamSt11align_val_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZnajSt11align_val_t")]
            pub unsafe extern "C" fn heapswap_cxx_new_array_aligned(
                size: usize,
                align: usize,
            ) -> *mut c_void {
                cstd::new_aligned::<$r>(size, align)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZnwmSt11align_val_tRKSt9nothrow_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZnwjSt11align_val_tRKSt9nothrow_t")]
            pub unsafe extern "C" fn heapswap_cxx_new_aligned_nothrow(
                size: usize,
                align: usize,
                _: *const c_void,
            ) -> *mut c_void {
                cstd::new_aligned_nothrow::<$r>(size, align)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZnamSt11align_val_tRKSt9nothrow_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZnajSt11align_val_tRKSt9nothrow_t")]
            pub unsafe extern "C" fn heapswap_cxx_new_array_aligned_nothrow(
                size: usize,
                align: usize,
                _: *const c_void,
            ) -> *mut c_void {
                cstd::new_aligned_nothrow::<$r>(size, align)
            }

            #[export_name = "_ZdlPv"]
            pub unsafe extern "C" fn heapswap_cxx_delete(ptr: *mut c_void) {
                cstd::delete::<$r>(ptr)
            }

            #[export_name = "_ZdaPv"]
            pub unsafe extern "C" fn heapswap_cxx_delete_array(ptr: *mut c_void) {
                cstd::delete::<$r>(ptr)
            }

            #[export_name = "_ZdlPvRKSt9nothrow_t"]
            pub unsafe extern "C" fn heapswap_cxx_delete_nothrow(
                ptr: *mut c_void,
                _: *const c_void,
            ) {
                cstd::delete::<$r>(ptr)
            }

            #[export_name = "_ZdaPvRKSt9nothrow_t"]
            pub unsafe extern "C" fn heapswap_cxx_delete_array_nothrow(
                ptr: *mut c_void,
                _: *const c_void,
            ) {
                cstd::delete::<$r>(ptr)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZdlPvm")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZdlPvj")]
            pub unsafe extern "C" fn heapswap_cxx_delete_sized(ptr: *mut c_void, _: usize) {
                cstd::delete::<$r>(ptr)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZdaPvm")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZdaPvj")]
            pub unsafe extern "C" fn heapswap_cxx_delete_array_sized(ptr: *mut c_void, _: usize) {
                cstd::delete::<$r>(ptr)
            }

            #[export_name = "_ZdlPvSt11align_val_t"]
            pub unsafe extern "C" fn heapswap_cxx_delete_aligned(ptr: *mut c_void, _: usize) {
                cstd::delete::<$r>(ptr)
            }

            #[export_name = "_ZdaPvSt11align_val_t"]
            pub unsafe extern "C" fn heapswap_cxx_delete_array_aligned(ptr: *mut c_void, _: usize) {
                cstd::delete::<$r>(ptr)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZdlPvmSt11align_val_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZdlPvjSt11align_val_t")]
            pub unsafe extern "C" fn heapswap_cxx_delete_sized_aligned(
                ptr: *mut c_void,
                _: usize,
                _: usize,
            ) {
                cstd::delete::<$r>(ptr)
            }

            #[cfg_attr(target_pointer_width = "64", export_name = "_ZdaPvmSt11align_val_t")]
            #[cfg_attr(target_pointer_width = "32", export_name = "_ZdaPvjSt11align_val_t")]
            pub unsafe extern "C" fn heapswap_cxx_delete_array_sized_aligned(
                ptr: *mut c_void,
                _: usize,
                _: usize,
            ) {
                cstd::delete::<$r>(ptr)
            }

            // Ahead of the default priority, so other constructors already
            // see a bound allocator and live thread hooks.
            #[used]
            #[link_section = ".init_array.00101"]
            static HEAPSWAP_ON_LOAD: extern "C" fn() = {
                extern "C" fn on_load() {
                    elf::on_load::<$r>()
                }
                on_load
            };
        };
    };
}

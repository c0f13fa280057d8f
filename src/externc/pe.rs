//! PE: a `DllMain` that patches the process at attach and forwards thread
//! notifications, plus the switches for turning redirection on and off.

#[doc(hidden)]
#[macro_export]
macro_rules! __heapswap_backend {
    ($r:ty) => {
        const _: () = {
            use ::core::ffi::c_void;
            use $crate::intercept::pe;

            #[no_mangle]
            pub unsafe extern "system" fn DllMain(
                module: *mut c_void,
                reason: u32,
                _: *mut c_void,
            ) -> i32 {
                pe::dll_main::<$r>(module as usize, reason) as i32
            }

            #[no_mangle]
            pub extern "C" fn heapswap_redirect_enable() {
                pe::enable()
            }

            #[no_mangle]
            pub extern "C" fn heapswap_redirect_disable() {
                pe::disable()
            }

            #[no_mangle]
            pub extern "C" fn heapswap_redirect_is_enabled() -> bool {
                pe::is_enabled()
            }

            #[no_mangle]
            pub extern "C" fn heapswap_redirect_is_installed() -> bool {
                pe::is_installed()
            }
        };
    };
}

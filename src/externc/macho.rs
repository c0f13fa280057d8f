//! Mach-O: the interpose table dyld applies when the image is inserted,
//! and a `__mod_init_func` constructor.

#[doc(hidden)]
#[macro_export]
macro_rules! __heapswap_backend {
    ($r:ty) => {
        const _: () = {
            use $crate::intercept::macho::{self, Interpose, INTERPOSE_COUNT};

            #[used]
            #[link_section = "__DATA,__interpose"]
            static HEAPSWAP_INTERPOSE: [Interpose; INTERPOSE_COUNT] =
                macho::interpose_table::<$r>();

            #[used]
            #[link_section = "__DATA,__mod_init_func"]
            static HEAPSWAP_ON_LOAD: extern "C" fn() = {
                extern "C" fn on_load() {
                    macho::on_load::<$r>()
                }
                on_load
            };
        };
    };
}

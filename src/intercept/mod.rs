//! Getting the process's allocation calls to the surface.
//!
//! Which mechanism applies is decided by the target: ELF images override the
//! symbols outright, Mach-O images are interposed by dyld, PE images have
//! their CRT's functions patched at process attach. [`crate::install!`]
//! emits whatever the target needs; the functions here do the work.

pub mod cstd;
pub mod darwin;
pub mod pe;

cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        pub mod macho;
    } else if #[cfg(unix)] {
        pub mod elf;
    }
}

/// Load-time set-up shared by the POSIX backends: bind the allocator, find
/// the real thread functions, install fork handlers, then let thread hooks
/// fire.
#[cfg(unix)]
fn on_load<R: crate::alloc::Redirect>(fork_handlers: bool) {
    use crate::{alloc::Ready, fork, threads::posix, util::print::trace};

    let surface = R::surface();
    if !surface.warm_up() {
        trace!("allocator still being built at load time");
    }
    if !posix::prepare::<R>() {
        crate::putln!("heapswap: real pthread functions not found, thread hooks disabled");
        return;
    }
    if fork_handlers {
        if let Err(err) = fork::register::<R>() {
            log::warn!("fork safety unavailable: {err}");
        }
    }
    surface.declare(Ready::THREADS);
    trace!("loaded, arena used ", surface.arena().used(), " bytes");
}

//! Put your own allocator behind `malloc()`, process-wide.
//!
//! Implement [`Allocator`] (or pick one from [`heaps`]), bind it with
//! [`surface!`], and [`install!`] it in a `cdylib` that gets loaded ahead of
//! the C runtime: `LD_PRELOAD` on Linux, `DYLD_INSERT_LIBRARIES` on macOS,
//! an early-loaded DLL on Windows. Every `malloc`, `free`, C++ `new` and
//! friend in the process then lands on the one [`Surface`].
//!
//! The surface copes with the awkward parts of living under `malloc()`:
//! calls that arrive before the allocator exists, re-entrant calls from the
//! allocator's own construction, thread start/exit notifications and
//! `fork()`.

pub mod alloc;
pub mod config;
pub mod error;
mod externc;
#[cfg(unix)]
pub mod fork;
pub mod heaps;
pub mod intercept;
pub mod lazy_lock;
pub mod os;
pub mod threads;
pub mod util;

pub use alloc::{Allocator, Global, Ready, Redirect, Surface, SurfaceTable};
pub use error::{Error, Result};
pub use lazy_lock::{LazyLock, LazyLockState};

#[doc(hidden)]
pub mod __private {
    pub use libc;
}

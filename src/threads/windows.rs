//! Windows learns about threads from the loader: `DllMain` is called with
//! `DLL_THREAD_ATTACH` on every new thread and `DLL_THREAD_DETACH` as each
//! one exits.

use crate::{
    alloc::Redirect,
    threads::{begin, end, note_thread_created},
};

/// Forwarded from `DLL_THREAD_ATTACH`.
pub fn attach<R: Redirect>() {
    note_thread_created();
    begin::<R>();
}

/// Forwarded from `DLL_THREAD_DETACH`.
pub fn detach<R: Redirect>() {
    end::<R>();
}

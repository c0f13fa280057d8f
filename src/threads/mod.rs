//! Thread lifecycle notifications.
//!
//! The allocator's `on_thread_start`/`on_thread_end` run exactly once on each
//! thread, and only after the surface has declared [`Ready::THREADS`]. How we
//! find out about threads depends on the platform: POSIX systems have their
//! `pthread_create`/`pthread_exit` wrapped (see [`posix`]), Windows forwards
//! the loader's attach/detach notifications (see [`windows`]).

use std::{
    cell::Cell,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::alloc::{Allocator, Ready, Redirect};

#[cfg(unix)]
pub mod posix;
#[cfg(windows)]
pub mod windows;

static ANY_THREAD_CREATED: AtomicBool = AtomicBool::new(false);

/// Whether the process has ever created a second thread through an
/// intercepted path. Once `true`, stays `true`; allocators can skip locking
/// until then.
#[inline]
pub fn any_thread_created() -> bool {
    ANY_THREAD_CREATED.load(Ordering::Acquire)
}

/// Record that a thread is about to be created.
#[inline]
pub fn note_thread_created() {
    if !ANY_THREAD_CREATED.load(Ordering::Relaxed) {
        ANY_THREAD_CREATED.store(true, Ordering::Release);
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Unseen,
    Started,
    Ended,
}

thread_local! {
    // Const-initialised and without a destructor, so touching it never
    // allocates or registers anything.
    static PHASE: Cell<Phase> = const { Cell::new(Phase::Unseen) };
}

/// Whether hooks may fire at all.
#[inline]
fn hooks_live<R: Redirect>() -> bool {
    R::Alloc::THREAD_HOOKS && R::surface().is_ready(Ready::THREADS)
}

/// Run `on_thread_start` for the calling thread unless it already ran.
pub fn begin<R: Redirect>() {
    if !hooks_live::<R>() {
        return;
    }
    let first = PHASE
        .try_with(|phase| {
            let first = phase.get() == Phase::Unseen;
            if first {
                phase.set(Phase::Started);
            }
            first
        })
        .unwrap_or(false);
    if first {
        R::surface().on_thread_start();
    }
}

/// Run `on_thread_end` for the calling thread if `begin` ran and `end`
/// hasn't yet.
pub fn end<R: Redirect>() {
    if !hooks_live::<R>() {
        return;
    }
    let due = PHASE
        .try_with(|phase| {
            let due = phase.get() == Phase::Started;
            if due {
                phase.set(Phase::Ended);
            }
            due
        })
        .unwrap_or(false);
    if due {
        R::surface().on_thread_end();
    }
}

/// Whether `begin` has run on this thread. For tests and diagnostics.
pub fn started_here() -> bool {
    PHASE
        .try_with(|phase| phase.get() != Phase::Unseen)
        .unwrap_or(false)
}

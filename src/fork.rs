//! Keeping the allocator consistent across `fork()`.
//!
//! The child of a multi-threaded process only gets the forking thread. If
//! another thread held the allocator's lock at that moment, the child would
//! deadlock on its first `malloc()`, so we take the lock ourselves right
//! before the fork and release it on both sides afterwards.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    alloc::Redirect,
    error::{Error, Result},
};

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Install the fork handlers. Later calls do nothing.
pub fn register<R: Redirect>() -> Result<()> {
    if REGISTERED.swap(true, Ordering::AcqRel) {
        return Ok(());
    }
    // SAFETY: the handlers are plain functions that live as long as the image.
    let rc = unsafe {
        libc::pthread_atfork(
            Some(prepare::<R> as unsafe extern "C" fn()),
            Some(parent::<R> as unsafe extern "C" fn()),
            Some(child::<R> as unsafe extern "C" fn()),
        )
    };
    if rc != 0 {
        REGISTERED.store(false, Ordering::Release);
        return Err(Error::AtFork(rc));
    }
    log::debug!("fork handlers registered");
    Ok(())
}

pub fn is_registered() -> bool {
    REGISTERED.load(Ordering::Acquire)
}

/// Runs in the parent just before `fork()`.
pub extern "C" fn prepare<R: Redirect>() {
    R::surface().lock();
}

/// Runs in the parent after `fork()` returns there.
pub extern "C" fn parent<R: Redirect>() {
    R::surface().unlock();
}

/// Runs in the child, which inherited the lock `prepare` took.
pub extern "C" fn child<R: Redirect>() {
    R::surface().unlock();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heaps::DlHeap;

    crate::surface!(Forking => DlHeap = DlHeap::new);

    #[test]
    fn registration_is_idempotent() {
        register::<Forking>().unwrap();
        register::<Forking>().unwrap();
        assert!(is_registered());
    }

    #[test]
    fn handlers_leave_the_heap_usable() {
        prepare::<Forking>();
        parent::<Forking>();
        prepare::<Forking>();
        child::<Forking>();
        let surface = Forking::surface();
        let p = surface.allocate(32);
        assert!(!p.is_null());
        unsafe { surface.free(p) };
    }
}

#![cfg(unix)]

use std::{
    ffi::c_void,
    mem, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use heapswap::{
    heaps::{DlHeap, StatsHeap},
    threads::{self, posix},
    Ready, Redirect,
};

heapswap::surface!(Counted => StatsHeap<DlHeap> = || StatsHeap::new(DlHeap::new()));

const THREADS: usize = 10_000;
const BATCH: usize = 250;

static BODIES: AtomicUsize = AtomicUsize::new(0);

extern "C" fn body(_: *mut c_void) -> *mut c_void {
    let surface = Counted::surface();
    let p = surface.allocate(32);
    assert!(!p.is_null());
    unsafe { surface.free(p) };
    BODIES.fetch_add(1, Ordering::Relaxed);
    threads::started_here() as usize as *mut c_void
}

#[test]
fn every_thread_starts_and_ends_exactly_once() {
    let surface = Counted::surface();
    surface.warm_up();
    surface.declare(Ready::THREADS);

    let mut handles: Vec<libc::pthread_t> = Vec::with_capacity(BATCH);
    for _ in 0..THREADS / BATCH {
        for _ in 0..BATCH {
            let mut thread: libc::pthread_t = unsafe { mem::zeroed() };
            let rc = unsafe {
                posix::create_with::<Counted>(
                    libc::pthread_create,
                    &mut thread,
                    ptr::null(),
                    body,
                    ptr::null_mut(),
                )
            };
            assert_eq!(rc, 0);
            handles.push(thread);
        }
        for thread in handles.drain(..) {
            let mut hooked = ptr::null_mut();
            assert_eq!(unsafe { libc::pthread_join(thread, &mut hooked) }, 0);
            assert_eq!(hooked as usize, 1, "thread body ran before on_thread_start");
        }
    }

    assert_eq!(BODIES.load(Ordering::Relaxed), THREADS);
    let stats = surface.allocator().map(|heap| heap.snapshot()).unwrap_or_default();
    assert_eq!(stats.threads_started, THREADS);
    assert_eq!(stats.threads_ended, THREADS);
    assert!(threads::any_thread_created());
    // The test thread itself never went through the trampoline.
    assert!(!threads::started_here());
}

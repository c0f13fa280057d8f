#![cfg(unix)]

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use heapswap::{fork, heaps::DlHeap, Redirect};

heapswap::surface!(Heap => DlHeap = DlHeap::new);

#[test]
fn child_can_allocate_after_fork_under_contention() {
    let _ = env_logger::builder().is_test(true).try_init();
    fork::register::<Heap>().unwrap();
    assert!(fork::is_registered());
    // A second call is a no-op, not a second set of handlers.
    fork::register::<Heap>().unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let churn = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let surface = Heap::surface();
            while !stop.load(Ordering::Relaxed) {
                let p = surface.allocate(128);
                unsafe { surface.free(p) };
            }
        })
    };

    for _ in 0..20 {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            let surface = Heap::surface();
            let p = surface.allocate(4096);
            let ok = !p.is_null();
            unsafe {
                surface.free(p);
                libc::_exit(if ok { 0 } else { 1 });
            }
        }
        let mut status = 0;
        assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    stop.store(true, Ordering::Relaxed);
    churn.join().unwrap();

    // The parent's lock was released too.
    let surface = Heap::surface();
    let p = surface.allocate(64);
    assert!(!p.is_null());
    unsafe { surface.free(p) };
}

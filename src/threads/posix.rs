//! Wrapping `pthread_create` so every new thread passes through our
//! trampoline.

use std::{
    ffi::c_void,
    mem::{size_of, transmute},
    num::NonZeroUsize,
    ptr,
};

use libc::{c_int, pthread_attr_t, pthread_key_t, pthread_t};
use once_cell::race::OnceNonZeroUsize;

use crate::{
    alloc::Redirect,
    threads::{begin, end, hooks_live, note_thread_created},
};

/// A thread entry point, as `pthread_create` takes it.
pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;

/// The shape of `pthread_create` itself.
pub type CreateFn = unsafe extern "C" fn(
    *mut pthread_t,
    *const pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> c_int;

type ExitFn = unsafe extern "C" fn(*mut c_void) -> !;

/// The user's entry point and argument, in transit from the creating thread
/// to the created one. Allocated by the creator, read and freed by the new
/// thread before anything else runs there.
#[repr(C)]
struct ThreadRecord {
    start: StartRoutine,
    arg: *mut c_void,
}

/// Create a thread through `real`, wrapping `start` so the allocator's
/// thread hooks run around it.
///
/// Falls back to an unwrapped create when hooks are off or the record can't
/// be allocated; the thread still gets created either way.
///
/// # Safety
///
/// Same contract as `pthread_create`; `real` must be a `pthread_create`.
pub unsafe fn create_with<R: Redirect>(
    real: CreateFn,
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    note_thread_created();
    if !hooks_live::<R>() {
        return real(thread, attr, start, arg);
    }
    let surface = R::surface();
    let record = surface.allocate(size_of::<ThreadRecord>()) as *mut ThreadRecord;
    if record.is_null() {
        return real(thread, attr, start, arg);
    }
    record.write(ThreadRecord { start, arg });
    let rc = real(thread, attr, trampoline::<R>, record.cast());
    if rc != 0 {
        // No thread took ownership.
        surface.free(record.cast());
    }
    rc
}

// Stored off by one so key 0 fits in a `NonZeroUsize`.
static EXIT_KEY: OnceNonZeroUsize = OnceNonZeroUsize::new();

/// A pthread key whose destructor runs the `end` stored in it. Catches
/// threads that never return through the trampoline, such as cancelled
/// ones or those calling a `pthread_exit` we didn't interpose.
fn exit_key() -> Option<pthread_key_t> {
    if let Some(stored) = EXIT_KEY.get() {
        return Some((stored.get() - 1) as pthread_key_t);
    }
    let mut key: pthread_key_t = 0;
    // SAFETY: `key` is a valid out pointer and `run_end` matches the
    // destructor prototype.
    if unsafe { libc::pthread_key_create(&mut key, Some(run_end)) } != 0 {
        return None;
    }
    let stored = NonZeroUsize::new(key as usize + 1)?;
    if EXIT_KEY.set(stored).is_err() {
        // Lost the race; use the winner's key.
        // SAFETY: nobody else has seen `key`.
        unsafe { libc::pthread_key_delete(key) };
    }
    EXIT_KEY.get().map(|stored| (stored.get() - 1) as pthread_key_t)
}

unsafe extern "C" fn run_end(value: *mut c_void) {
    if !value.is_null() {
        // SAFETY: only `arm_exit_key` stores into the key, and it stores an
        // `fn()`.
        let end = transmute::<*mut c_void, fn()>(value);
        end();
    }
}

fn arm_exit_key<R: Redirect>(key: Option<pthread_key_t>) {
    if let Some(key) = key {
        let end: fn() = end::<R>;
        // SAFETY: `key` came from `pthread_key_create`.
        unsafe { libc::pthread_setspecific(key, end as *const c_void) };
    }
}

fn disarm_exit_key(key: Option<pthread_key_t>) {
    if let Some(key) = key {
        // SAFETY: as above.
        unsafe { libc::pthread_setspecific(key, ptr::null()) };
    }
}

extern "C" fn trampoline<R: Redirect>(raw: *mut c_void) -> *mut c_void {
    // SAFETY: `create_with` handed this record to exactly this thread.
    let ThreadRecord { start, arg } = unsafe { (raw as *mut ThreadRecord).read() };
    // SAFETY: allocated from the same surface and read above; nobody else
    // holds it.
    unsafe { R::surface().free(raw.cast()) };
    begin::<R>();
    let key = exit_key();
    arm_exit_key::<R>(key);
    let result = start(arg);
    end::<R>();
    disarm_exit_key(key);
    result
}

cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        // Interposition never applies to calls made from the interposing
        // image itself, so the libc names are the real ones here.
        #[inline]
        fn real_create<R: Redirect>() -> Option<CreateFn> {
            Some(libc::pthread_create)
        }

        #[inline]
        fn real_exit<R: Redirect>() -> Option<ExitFn> {
            Some(libc::pthread_exit)
        }
    } else {
        use crate::os::dl::NextSymbol;

        static REAL_CREATE: NextSymbol = NextSymbol::new(c"pthread_create");
        static REAL_EXIT: NextSymbol = NextSymbol::new(c"pthread_exit");

        #[inline]
        fn real_create<R: Redirect>() -> Option<CreateFn> {
            REAL_CREATE
                .get(R::surface())
                // SAFETY: the libc definition of `pthread_create`.
                .map(|addr| unsafe { std::mem::transmute::<usize, CreateFn>(addr) })
        }

        #[inline]
        fn real_exit<R: Redirect>() -> Option<ExitFn> {
            REAL_EXIT
                .get(R::surface())
                // SAFETY: the libc definition of `pthread_exit`.
                .map(|addr| unsafe { std::mem::transmute::<usize, ExitFn>(addr) })
        }
    }
}

/// Resolve the real thread functions ahead of time, so the first
/// `pthread_create` doesn't have to.
pub fn prepare<R: Redirect>() -> bool {
    real_create::<R>().is_some() && real_exit::<R>().is_some() && exit_key().is_some()
}

/// Replacement `pthread_create`.
///
/// # Safety
///
/// Same contract as `pthread_create`.
pub unsafe extern "C" fn pthread_create<R: Redirect>(
    thread: *mut pthread_t,
    attr: *const pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    match real_create::<R>() {
        Some(real) => create_with::<R>(real, thread, attr, start, arg),
        None => libc::EAGAIN,
    }
}

/// Replacement `pthread_exit`: a thread leaving early still gets its
/// `on_thread_end`.
///
/// # Safety
///
/// Same contract as `pthread_exit`.
pub unsafe extern "C" fn pthread_exit<R: Redirect>(value: *mut c_void) -> ! {
    end::<R>();
    match real_exit::<R>() {
        Some(real) => real(value),
        None => crate::util::fatal("real pthread_exit not found"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        alloc::{Allocator, Ready},
        heaps::DlHeap,
        threads::{any_thread_created, started_here},
    };

    struct Counts {
        starts: AtomicUsize,
        ends: AtomicUsize,
    }

    impl Counts {
        const fn new() -> Self {
            Self {
                starts: AtomicUsize::new(0),
                ends: AtomicUsize::new(0),
            }
        }

        fn get(&self) -> (usize, usize) {
            (self.starts.load(Ordering::SeqCst), self.ends.load(Ordering::SeqCst))
        }
    }

    struct Hooked {
        heap: DlHeap,
        counts: &'static Counts,
    }

    impl Hooked {
        fn new(counts: &'static Counts) -> Self {
            Self {
                heap: DlHeap::new(),
                counts,
            }
        }
    }

    unsafe impl Allocator for Hooked {
        const THREAD_HOOKS: bool = true;

        fn allocate(&self, size: usize) -> *mut u8 {
            self.heap.allocate(size)
        }

        unsafe fn free(&self, ptr: *mut u8) {
            self.heap.free(ptr)
        }

        fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
            self.heap.aligned_allocate(align, size)
        }

        unsafe fn size_of(&self, ptr: *mut u8) -> usize {
            self.heap.size_of(ptr)
        }

        fn lock(&self) {
            self.heap.lock()
        }

        unsafe fn unlock(&self) {
            self.heap.unlock()
        }

        fn on_thread_start(&self) {
            self.counts.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_thread_end(&self) {
            self.counts.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    static RETURNING: Counts = Counts::new();
    static EXITING: Counts = Counts::new();
    static QUIET: Counts = Counts::new();

    crate::surface!(Wrapped => Hooked = || Hooked::new(&RETURNING));
    crate::surface!(Exiting => Hooked = || Hooked::new(&EXITING));
    crate::surface!(Quiet => Hooked = || Hooked::new(&QUIET));

    unsafe fn spawn_and_join<R: Redirect>(start: StartRoutine, arg: usize) -> usize {
        let mut thread: pthread_t = std::mem::zeroed();
        let rc = create_with::<R>(
            libc::pthread_create,
            &mut thread,
            ptr::null(),
            start,
            arg as *mut c_void,
        );
        assert_eq!(rc, 0);
        let mut result = ptr::null_mut();
        assert_eq!(libc::pthread_join(thread, &mut result), 0);
        result as usize
    }

    extern "C" fn doubles(arg: *mut c_void) -> *mut c_void {
        assert!(started_here());
        (arg as usize * 2) as *mut c_void
    }

    extern "C" fn leaves_early(arg: *mut c_void) -> *mut c_void {
        assert!(started_here());
        unsafe { pthread_exit::<Exiting>(arg) }
    }

    extern "C" fn reports_start(_: *mut c_void) -> *mut c_void {
        started_here() as usize as *mut c_void
    }

    #[test]
    fn trampoline_runs_hooks_and_returns_the_result() {
        Wrapped::surface().declare(Ready::THREADS);
        assert_eq!(unsafe { spawn_and_join::<Wrapped>(doubles, 21) }, 42);
        assert!(any_thread_created());
        assert_eq!(RETURNING.get(), (1, 1));
    }

    #[test]
    fn pthread_exit_ends_the_thread_exactly_once() {
        Exiting::surface().declare(Ready::THREADS);
        for round in 1..=3 {
            assert_eq!(unsafe { spawn_and_join::<Exiting>(leaves_early, 7) }, 7);
            assert_eq!(EXITING.get(), (round, round));
        }
    }

    #[test]
    fn hooks_stay_silent_until_threads_are_declared() {
        assert!(!Quiet::surface().is_ready(Ready::THREADS));
        assert_eq!(unsafe { spawn_and_join::<Quiet>(reports_start, 0) }, 0);
        begin::<Quiet>();
        end::<Quiet>();
        assert_eq!(QUIET.get(), (0, 0));
    }

    #[test]
    fn exit_key_destructor_runs_the_stored_end() {
        static RAN: AtomicUsize = AtomicUsize::new(0);
        fn count() {
            RAN.fetch_add(1, Ordering::SeqCst);
        }

        let key = exit_key();
        assert!(key.is_some());
        assert_eq!(exit_key(), key);
        let worker = std::thread::spawn(move || {
            let end: fn() = count;
            unsafe { libc::pthread_setspecific(key.unwrap(), end as *const c_void) };
        });
        worker.join().unwrap();
        assert_eq!(RAN.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn real_functions_resolve() {
        assert!(prepare::<Wrapped>());
    }
}

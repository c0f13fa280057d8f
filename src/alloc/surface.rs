//! The interception surface: the one place every backend calls into.
//!
//! A [`Surface`] decides, per call, whether a request can go to the bridge or
//! has to be served from the bootstrap arena:
//!
//! - before the bridge's allocator exists, the first caller builds it;
//! - while it is being built (re-entrantly, or by a racing thread), requests
//!   go to the arena;
//! - while the calling thread is inside the framework's own symbol lookup,
//!   its requests go to the arena, since the resolver may be holding locks
//!   our allocator needs. Other threads carry on with the bridge.
//!
//! After that, the arena is only ever consulted to recognise its own
//! pointers on `free` and `size_of`.

use std::{
    alloc::{GlobalAlloc, Layout},
    cell::Cell,
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam::utils::CachePadded;

use crate::{
    alloc::{
        adapter::Allocator,
        bootstrap::{BootstrapArena, Readiness, Ready},
        bridge::Bridge,
    },
    intercept::darwin::ZoneCell,
    util::{
        fatal,
        hint::{cold, unlikely},
        num::checked_total,
        print::trace,
    },
};

/// Process-wide binding of one allocator to the interception surface.
///
/// Lives in a `static` (see [`crate::surface!`]), so it is never dropped and
/// stays usable while `exit()` runs destructors.
pub struct Surface<A> {
    bridge: Bridge<A>,
    ready: CachePadded<Readiness>,
    held: AtomicUsize,
    arena: BootstrapArena,
}

thread_local! {
    // How deep the current thread is in `Surface::resolving`. Const and
    // without a destructor, like the thread phase, so reading it never
    // allocates.
    static RESOLVING: Cell<usize> = const { Cell::new(0) };
}

#[inline]
fn resolving_here() -> bool {
    RESOLVING.try_with(|depth| depth.get() != 0).unwrap_or(false)
}

// SAFETY: the bridge only hands out `&A` where `A: Sync`; everything else is
// atomics and the arena, which is `Sync` itself.
unsafe impl<A: Allocator> Sync for Surface<A> {}

/// Ties a marker type to its process-wide [`Surface`]. Every backend is
/// generic over this, so all of them reach the same instance.
///
/// Implemented by [`crate::surface!`]; there should be exactly one per
/// process.
pub trait Redirect: Sized + 'static {
    type Alloc: Allocator;

    fn surface() -> &'static Surface<Self::Alloc>;

    /// The emulated `malloc_zone_t` handed to Darwin callers. Other
    /// platforms never force it.
    fn zone() -> &'static ZoneCell;
}

impl<A: Allocator> Surface<A> {
    pub const fn new(init: fn() -> A) -> Self {
        Self {
            bridge: Bridge::new(init),
            ready: CachePadded::new(Readiness::new()),
            held: AtomicUsize::new(0),
            arena: BootstrapArena::new(),
        }
    }

    /// The bridge, if requests may go there right now. Binds the allocator on
    /// first use.
    #[inline]
    fn route(&self) -> Option<&Bridge<A>> {
        if unlikely(resolving_here()) {
            return None;
        }
        if self.ready.contains(Ready::BRIDGE) {
            return Some(&self.bridge);
        }
        cold(|| self.bind())
    }

    fn bind(&self) -> Option<&Bridge<A>> {
        match self.bridge.bind() {
            Ok(_) => {
                if self.ready.set(Ready::BRIDGE) {
                    trace!("bridge bound, arena used ", self.arena.used(), " bytes");
                }
                Some(&self.bridge)
            }
            Err(_) => None,
        }
    }

    #[cold]
    fn arena_allocate(&self, size: usize, align: usize) -> *mut u8 {
        match self.arena.allocate(size, align) {
            Some(ptr) => {
                trace!("arena served ", size, " bytes at ", ptr.as_ptr());
                ptr.as_ptr()
            }
            None => fatal("bootstrap arena exhausted"),
        }
    }

    /// Bind the allocator now rather than on the first request. Returns
    /// whether the bridge is live afterwards.
    pub fn warm_up(&self) -> bool {
        self.bind().is_some()
    }

    pub fn readiness(&self) -> Ready {
        self.ready.get()
    }

    pub fn is_ready(&self, flags: Ready) -> bool {
        self.ready.contains(flags)
    }

    /// Mark start-up milestones. Flags are never cleared.
    pub fn declare(&self, flags: Ready) {
        self.ready.set(flags);
    }

    /// Run `f` with every allocation this thread makes served from the
    /// arena. For code that calls into the loader or libc internals which
    /// may themselves call `malloc()` while holding their own locks.
    pub fn resolving<T>(&self, f: impl FnOnce() -> T) -> T {
        struct Exit;
        impl Drop for Exit {
            fn drop(&mut self) {
                let _ = RESOLVING.try_with(|depth| depth.set(depth.get() - 1));
            }
        }

        let entered = RESOLVING
            .try_with(|depth| depth.set(depth.get() + 1))
            .is_ok();
        let _exit = entered.then_some(Exit);
        f()
    }

    /// Whether `ptr` was handed out by the bootstrap arena.
    #[inline]
    pub fn is_bootstrap(&self, ptr: *const u8) -> bool {
        self.arena.contains(ptr)
    }

    pub fn bridge(&self) -> &Bridge<A> {
        &self.bridge
    }

    /// The allocator, binding it if nobody has yet. `None` while it is being
    /// constructed.
    pub fn allocator(&self) -> Option<&A> {
        self.bridge.bind().ok()
    }

    #[inline]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        match self.route() {
            Some(bridge) => bridge.allocate(size),
            None => self.arena_allocate(size, A::MIN_ALIGN),
        }
    }

    /// # Safety
    ///
    /// `ptr` is null, an arena pointer, or a live handle from this surface.
    #[inline]
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() || self.arena.contains(ptr) {
            return;
        }
        // A pointer that isn't ours can't have come from an unbound bridge.
        if self.bridge.is_bound() {
            self.bridge.free(ptr)
        }
    }

    #[inline]
    pub fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            return ptr::null_mut();
        }
        match self.route() {
            Some(bridge) => bridge.aligned_allocate(align, size),
            None => self.arena_allocate(size, align.max(A::MIN_ALIGN)),
        }
    }

    /// Usable size of `ptr`. Arena pointers report the space left in the
    /// arena; pointers nobody recognises report 0.
    ///
    /// # Safety
    ///
    /// `ptr` is null, an arena pointer, or something the allocator's
    /// `size_of` is prepared to inspect.
    #[inline]
    pub unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            0
        } else if self.arena.contains(ptr) {
            self.arena.remaining_from(ptr)
        } else if self.bridge.is_bound() {
            self.bridge.size_of(ptr)
        } else {
            0
        }
    }

    /// # Safety
    ///
    /// `ptr` is null, an arena pointer, or a live handle from this surface.
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if self.arena.contains(ptr) {
            if size == 0 {
                return ptr::null_mut();
            }
            // Arena blocks don't record their size; copy what might be there.
            let new = self.allocate(size);
            if !new.is_null() {
                let n = self.arena.remaining_from(ptr).min(size);
                ptr::copy(ptr, new, n);
            }
            return new;
        }
        // Existing blocks go back to the bridge even while resolving; only new
        // requests are diverted.
        if self.bridge.is_bound() {
            return self.bridge.resize(ptr, size);
        }
        // Not bound yet, so this isn't ours. Hand back fresh memory and leave
        // the original alone.
        if size == 0 {
            ptr::null_mut()
        } else {
            self.allocate(size)
        }
    }

    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = checked_total(count, size) else {
            return ptr::null_mut();
        };
        match self.route() {
            Some(bridge) => bridge.zero_allocate(count, size),
            None => {
                let ptr = self.arena_allocate(total, A::MIN_ALIGN);
                // SAFETY: the arena just handed us `total` bytes.
                unsafe { ptr::write_bytes(ptr, 0, total) };
                ptr
            }
        }
    }

    /// Lock the allocator ahead of `fork()`. Binds it first if needed, so the
    /// lock taken here is the one `unlock` releases. Taken even when this
    /// thread is resolving: the child must not inherit a heap mid-update.
    pub fn lock(&self) {
        if let Some(bridge) = self.bind() {
            bridge.lock();
            self.held.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Release a lock taken by [`Surface::lock`]. Unbalanced calls are
    /// ignored.
    pub fn unlock(&self) {
        let took = self
            .held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if took {
            // SAFETY: `held` counted a matching `lock()`.
            unsafe { self.bridge.unlock() }
        }
    }

    pub fn on_thread_start(&self) {
        if A::THREAD_HOOKS && self.ready.contains(Ready::THREADS) {
            self.bridge.on_thread_start()
        }
    }

    pub fn on_thread_end(&self) {
        if A::THREAD_HOOKS && self.ready.contains(Ready::THREADS) {
            self.bridge.on_thread_end()
        }
    }

    /// The bootstrap arena, for diagnostics.
    pub fn arena(&self) -> &BootstrapArena {
        &self.arena
    }
}

/// A `#[global_allocator]` that routes Rust allocations through the same
/// surface as the C entry points.
///
/// ```ignore
/// heapswap::surface!(pub Heap => DlHeap = DlHeap::new);
///
/// #[global_allocator]
/// static GLOBAL: heapswap::Global<Heap> = heapswap::Global::new();
/// ```
pub struct Global<R>(PhantomData<fn() -> R>);

impl<R> Global<R> {
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<R> Default for Global<R> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<R: Redirect> GlobalAlloc for Global<R> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let surface = R::surface();
        if layout.align() <= R::Alloc::MIN_ALIGN {
            surface.allocate(layout.size())
        } else {
            surface.aligned_allocate(layout.align(), layout.size())
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        R::surface().free(ptr)
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= R::Alloc::MIN_ALIGN {
            R::surface().zero_allocate(1, layout.size())
        } else {
            let ptr = self.alloc(layout);
            if !ptr.is_null() {
                ptr::write_bytes(ptr, 0, layout.size());
            }
            ptr
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= R::Alloc::MIN_ALIGN && new_size != 0 {
            return R::surface().resize(ptr, new_size);
        }
        // SAFETY: caller upholds `GlobalAlloc::realloc`'s contract.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new = self.alloc(new_layout);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicBool, mpsc},
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{config::BOOTSTRAP_ARENA_SIZE, heaps::DlHeap};

    crate::surface!(Plain => DlHeap = DlHeap::new);
    crate::surface!(Shared => DlHeap = DlHeap::new);
    crate::surface!(Forked => DlHeap = DlHeap::new);

    #[test]
    fn first_request_binds_the_bridge() {
        let surface = Plain::surface();
        let p = surface.allocate(100);
        assert!(!p.is_null());
        assert!(!surface.is_bootstrap(p));
        assert!(surface.is_ready(Ready::BRIDGE));
        unsafe { surface.free(p) };
    }

    #[test]
    fn requests_while_resolving_come_from_the_arena() {
        let surface = Plain::surface();
        surface.warm_up();
        let p = surface.resolving(|| surface.allocate(10));
        assert!(surface.is_bootstrap(p));
        assert_eq!(p as usize % 16, 0);
        assert!(unsafe { surface.size_of(p) } >= 10);
        // Freed arena pointers are simply forgotten.
        unsafe { surface.free(p) };

        let q = surface.allocate(10);
        assert!(!surface.is_bootstrap(q));
        unsafe { surface.free(q) };
    }

    #[test]
    fn resolving_on_one_thread_leaves_the_others_on_the_bridge() {
        let surface = Shared::surface();
        surface.warm_up();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let resolver = thread::spawn(move || {
            let surface = Shared::surface();
            surface.resolving(|| {
                let p = surface.allocate(32);
                assert!(surface.is_bootstrap(p));
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        });
        entered_rx.recv().unwrap();

        let small = surface.allocate(64);
        assert!(!surface.is_bootstrap(small));
        // More than the arena could ever hold.
        let big = surface.allocate(BOOTSTRAP_ARENA_SIZE * 2);
        assert!(!big.is_null());
        assert!(!surface.is_bootstrap(big));
        unsafe {
            surface.free(small);
            surface.free(big);
        }

        release_tx.send(()).unwrap();
        resolver.join().unwrap();
    }

    #[test]
    fn fork_lock_is_taken_while_resolving() {
        let surface = Forked::surface();
        surface.resolving(|| surface.lock());

        let (done_tx, done_rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let surface = Forked::surface();
            let p = surface.allocate(8);
            unsafe { surface.free(p) };
            done_tx.send(()).unwrap();
        });
        assert!(done_rx.recv_timeout(Duration::from_millis(200)).is_err());

        surface.unlock();
        done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn arena_pointers_can_be_resized_out() {
        let surface = Plain::surface();
        let p = surface.resolving(|| surface.allocate(24));
        unsafe { ptr::write_bytes(p, 0x5a, 24) };
        let q = unsafe { surface.resize(p, 4096) };
        assert!(!surface.is_bootstrap(q));
        let prefix = unsafe { std::slice::from_raw_parts(q, 24) };
        assert!(prefix.iter().all(|&b| b == 0x5a));
        unsafe { surface.free(q) };
    }

    struct Reentrant {
        inner: DlHeap,
        saw_arena: bool,
    }

    static REENTERED: AtomicBool = AtomicBool::new(false);

    impl Reentrant {
        fn new() -> Self {
            // Constructing the allocator calls back into the surface, as a
            // real allocator's init might through `dlsym()` or TLS setup.
            let surface = Nested::surface();
            let p = surface.allocate(48);
            let saw_arena = surface.is_bootstrap(p);
            unsafe { surface.free(p) };
            REENTERED.store(true, Ordering::Relaxed);
            Self {
                inner: DlHeap::new(),
                saw_arena,
            }
        }
    }

    unsafe impl Allocator for Reentrant {
        fn allocate(&self, size: usize) -> *mut u8 {
            self.inner.allocate(size)
        }

        unsafe fn free(&self, ptr: *mut u8) {
            self.inner.free(ptr)
        }

        fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
            self.inner.aligned_allocate(align, size)
        }

        unsafe fn size_of(&self, ptr: *mut u8) -> usize {
            self.inner.size_of(ptr)
        }

        fn lock(&self) {
            self.inner.lock()
        }

        unsafe fn unlock(&self) {
            self.inner.unlock()
        }
    }

    crate::surface!(Nested => Reentrant = Reentrant::new);

    #[test]
    fn reentrant_construction_is_served_from_the_arena() {
        let surface = Nested::surface();
        let p = surface.allocate(64);
        assert!(!p.is_null());
        assert!(REENTERED.load(Ordering::Relaxed));
        assert!(surface.allocator().map(|a| a.saw_arena).unwrap_or(false));
        assert!(!surface.is_bootstrap(p));
        unsafe { surface.free(p) };
    }

    #[test]
    fn lock_and_unlock_balance() {
        let surface = Plain::surface();
        for _ in 0..5 {
            surface.lock();
            surface.unlock();
        }
        // Extra unlocks are ignored rather than releasing someone else's lock.
        surface.unlock();
        surface.unlock();
        let p = surface.allocate(16);
        assert!(!p.is_null());
        unsafe { surface.free(p) };
    }

    #[test]
    fn global_alloc_shares_the_surface() {
        let global: Global<Plain> = Global::new();
        unsafe {
            let layout = Layout::from_size_align(256, 64).unwrap();
            let p = global.alloc_zeroed(layout);
            assert_eq!(p as usize % 64, 0);
            assert!(std::slice::from_raw_parts(p, 256).iter().all(|&b| b == 0));
            let q = global.realloc(p, layout, 1024);
            assert_eq!(q as usize % 64, 0);
            global.dealloc(q, Layout::from_size_align(1024, 64).unwrap());

            let small = Layout::from_size_align(24, 8).unwrap();
            let r = global.alloc(small);
            assert!(Plain::surface().size_of(r) >= 24);
            global.dealloc(r, small);
        }
    }
}

//! The contract a concrete allocator implements to sit behind `malloc()`.

use crate::config::MIN_ALIGNMENT;

/// The minimal set of operations a heap exposes to be redirected to.
///
/// Handles are plain addresses. The framework never looks inside them, it only
/// asks the allocator to size and free what it handed out.
///
/// # Safety
///
/// Implementors promise that:
/// - a non-null pointer from [`Allocator::allocate`] or
///   [`Allocator::aligned_allocate`] is valid for reads and writes of at least
///   the requested size, aligned to at least [`Allocator::MIN_ALIGN`] (or the
///   requested alignment, if larger), and not aliased by any other live
///   allocation;
/// - [`Allocator::size_of`] of such a pointer is at least the requested size;
/// - every method may be called concurrently from any thread, including while
///   a previous call on the same thread is still inside `lock()`/`unlock()`
///   bookkeeping of the fork coordinator.
pub unsafe trait Allocator: Sync + 'static {
    /// Alignment of every pointer `allocate` returns.
    const MIN_ALIGN: usize = MIN_ALIGNMENT;

    /// Whether [`Allocator::on_thread_start`]/[`Allocator::on_thread_end`] do
    /// anything. When `false` the thread coordinator skips wrapping thread
    /// entry points altogether.
    const THREAD_HOOKS: bool = false;

    /// Allocate `size` bytes. `allocate(0)` may return null or a minimal
    /// valid handle.
    fn allocate(&self, size: usize) -> *mut u8;

    /// Release a handle. Null is never passed here; the bridge filters it.
    ///
    /// # Safety
    ///
    /// `ptr` came from this allocator and hasn't been freed.
    unsafe fn free(&self, ptr: *mut u8);

    /// Allocate `size` bytes aligned to `align`, a power of two.
    fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8;

    /// Usable size of a handle; 0 if the allocator doesn't recognise it.
    ///
    /// # Safety
    ///
    /// `ptr` is non-null. It need not be one of ours: implementations that
    /// can tell should return 0 for foreign pointers.
    unsafe fn size_of(&self, ptr: *mut u8) -> usize;

    /// Take every lock the heap needs to be in a consistent state. Called
    /// right before `fork()`.
    fn lock(&self);

    /// Undo [`Allocator::lock`]. Called in both the parent and the child
    /// after `fork()`.
    ///
    /// # Safety
    ///
    /// Must pair with a preceding `lock()`.
    unsafe fn unlock(&self);

    /// Resize a handle, preserving the prefix. `ptr` is non-null and
    /// `new_size` is nonzero; the bridge takes care of the other cases.
    ///
    /// The default allocates, copies and frees.
    ///
    /// # Safety
    ///
    /// `ptr` came from this allocator and hasn't been freed.
    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        crate::alloc::bridge::fallback_resize(self, ptr, new_size)
    }

    /// Called once on every new thread before it runs user code, when
    /// `THREAD_HOOKS` is set.
    fn on_thread_start(&self) {}

    /// Called once on every exiting thread that saw `on_thread_start`.
    fn on_thread_end(&self) {}
}

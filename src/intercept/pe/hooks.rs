//! What the patched CRT entry points land on.
//!
//! Blocks allocated before the patches went in belong to the CRT heap and
//! keep turning up here. Each replacement first asks whether a pointer is
//! ours ([`probe::owned_size`]). Foreign pointers are handed to the CRT's own
//! function when redirection is disabled and we know where it is; while
//! enabled, freeing one is dropped and resizing one copies it out.

use std::{
    ffi::{c_char, c_int, c_void, CStr},
    mem, ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    alloc::Redirect,
    intercept::{
        cstd,
        pe::{is_enabled, probe},
    },
    util::num::checked_total,
};

/// Hooked names that share a signature share a saved original.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Malloc,
    Free,
    Calloc,
    Realloc,
    Msize,
    Expand,
    Recalloc,
    Strdup,
    New,
    Delete,
}

impl Family {
    const COUNT: usize = 10;
}

#[allow(clippy::declare_interior_mutable_const)]
const UNKNOWN: AtomicUsize = AtomicUsize::new(0);
static ORIGINALS: [AtomicUsize; Family::COUNT] = [UNKNOWN; Family::COUNT];

/// Remember where the CRT's version of `family` lives. The first address
/// saved wins.
pub fn save_original(family: Family, addr: usize) {
    if addr != 0 {
        let _ = ORIGINALS[family as usize].compare_exchange(
            0,
            addr,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

pub fn has_original(family: Family) -> bool {
    ORIGINALS[family as usize].load(Ordering::Acquire) != 0
}

/// # Safety
///
/// `F` is the function pointer type of `family`.
unsafe fn original<F: Copy>(family: Family) -> Option<F> {
    let addr = ORIGINALS[family as usize].load(Ordering::Acquire);
    (addr != 0).then(|| mem::transmute_copy::<usize, F>(&addr))
}

/// The original, but only while redirection is off.
unsafe fn passthrough<F: Copy>(family: Family) -> Option<F> {
    if is_enabled() {
        None
    } else {
        original(family)
    }
}

type AllocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type MsizeFn = unsafe extern "C" fn(*mut c_void) -> usize;
type RecallocFn = unsafe extern "C" fn(*mut c_void, usize, usize) -> *mut c_void;
type StrdupFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;

/// Whether `ptr` belongs to the surface (arena or allocator).
unsafe fn is_ours<R: Redirect>(ptr: *mut c_void) -> bool {
    R::surface().is_bootstrap(ptr.cast()) || probe::owned_size::<R>(ptr.cast()) != 0
}

unsafe fn release<R: Redirect>(ptr: *mut c_void, family: Family) {
    if ptr.is_null() {
        return;
    }
    if is_ours::<R>(ptr) {
        return R::surface().free(ptr.cast());
    }
    if let Some(free) = passthrough::<FreeFn>(family) {
        free(ptr)
    }
}

/// Move a CRT block into the surface. The CRT block is left alone: we can't
/// free it, and its size is unknown, so we copy as much as is readable.
unsafe fn adopt<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    if size == 0 {
        return ptr::null_mut();
    }
    let new = R::surface().allocate(size);
    if !new.is_null() {
        let n = probe::readable_len(ptr.cast(), size);
        ptr::copy_nonoverlapping(ptr.cast::<u8>(), new, n);
    }
    new.cast()
}

pub unsafe extern "C" fn malloc<R: Redirect>(size: usize) -> *mut c_void {
    match passthrough::<AllocFn>(Family::Malloc) {
        Some(malloc) => malloc(size),
        None => cstd::malloc::<R>(size),
    }
}

pub unsafe extern "C" fn free<R: Redirect>(ptr: *mut c_void) {
    release::<R>(ptr, Family::Free)
}

pub unsafe extern "C" fn calloc<R: Redirect>(count: usize, size: usize) -> *mut c_void {
    match passthrough::<CallocFn>(Family::Calloc) {
        Some(calloc) => calloc(count, size),
        None => cstd::calloc::<R>(count, size),
    }
}

pub unsafe extern "C" fn realloc<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return malloc::<R>(size);
    }
    if is_ours::<R>(ptr) {
        return cstd::realloc::<R>(ptr, size);
    }
    match passthrough::<ReallocFn>(Family::Realloc) {
        Some(realloc) => realloc(ptr, size),
        None => adopt::<R>(ptr, size),
    }
}

pub unsafe extern "C" fn msize<R: Redirect>(ptr: *mut c_void) -> usize {
    let size = probe::owned_size::<R>(ptr.cast());
    if size != 0 || ptr.is_null() {
        return size;
    }
    match passthrough::<MsizeFn>(Family::Msize) {
        Some(msize) => msize(ptr),
        None => 0,
    }
}

/// In-place resizing is never offered for our blocks.
pub unsafe extern "C" fn expand<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() || is_ours::<R>(ptr) {
        return ptr::null_mut();
    }
    match passthrough::<ReallocFn>(Family::Expand) {
        Some(expand) => expand(ptr, size),
        None => ptr::null_mut(),
    }
}

/// `realloc` to `count * size` bytes, zeroing whatever the block grew by.
pub unsafe extern "C" fn recalloc<R: Redirect>(
    ptr: *mut c_void,
    count: usize,
    size: usize,
) -> *mut c_void {
    let ours = ptr.is_null() || is_ours::<R>(ptr);
    if !ours {
        if let Some(recalloc) = passthrough::<RecallocFn>(Family::Recalloc) {
            return recalloc(ptr, count, size);
        }
    }
    let Some(total) = checked_total(count, size) else {
        return ptr::null_mut();
    };
    // A foreign block's old size is unknown; only the copy bounds it.
    let old = if !ours {
        total
    } else if R::surface().is_bootstrap(ptr.cast()) {
        0
    } else {
        probe::owned_size::<R>(ptr.cast())
    };
    let new = realloc::<R>(ptr, total);
    if !new.is_null() {
        let from = old.min(total);
        ptr::write_bytes(new.cast::<u8>().add(from), 0, total - from);
    }
    new
}

pub unsafe extern "C" fn strdup<R: Redirect>(s: *const c_char) -> *mut c_char {
    match passthrough::<StrdupFn>(Family::Strdup) {
        Some(strdup) => strdup(s),
        None => cstd::strdup::<R>(s),
    }
}

pub unsafe extern "C" fn malloc_dbg<R: Redirect>(
    size: usize,
    _block: c_int,
    _file: *const c_char,
    _line: c_int,
) -> *mut c_void {
    malloc::<R>(size)
}

pub unsafe extern "C" fn free_dbg<R: Redirect>(ptr: *mut c_void, _block: c_int) {
    free::<R>(ptr)
}

pub unsafe extern "C" fn calloc_dbg<R: Redirect>(
    count: usize,
    size: usize,
    _block: c_int,
    _file: *const c_char,
    _line: c_int,
) -> *mut c_void {
    calloc::<R>(count, size)
}

pub unsafe extern "C" fn realloc_dbg<R: Redirect>(
    ptr: *mut c_void,
    size: usize,
    _block: c_int,
    _file: *const c_char,
    _line: c_int,
) -> *mut c_void {
    realloc::<R>(ptr, size)
}

pub unsafe extern "C" fn msize_dbg<R: Redirect>(ptr: *mut c_void, _block: c_int) -> usize {
    msize::<R>(ptr)
}

pub unsafe extern "C" fn new<R: Redirect>(size: usize) -> *mut c_void {
    match passthrough::<AllocFn>(Family::New) {
        Some(new) => new(size),
        None => cstd::new::<R>(size),
    }
}

pub unsafe extern "C" fn delete<R: Redirect>(ptr: *mut c_void) {
    release::<R>(ptr, Family::Delete)
}

/// One name to redirect.
#[derive(Clone, Copy, Debug)]
pub struct Hook {
    pub symbol: &'static CStr,
    pub family: Family,
    pub replacement: usize,
}

macro_rules! hooks {
    ($($symbol:literal => $family:ident = $replacement:expr),* $(,)?) => {
        /// Entries in [`hooks`].
        pub const HOOK_COUNT: usize = [$($symbol),*].len();

        /// Every CRT name the PE backend redirects, for `R`.
        pub fn hooks<R: Redirect>() -> [Hook; HOOK_COUNT] {
            [$(Hook {
                symbol: $symbol,
                family: Family::$family,
                replacement: $replacement as usize,
            }),*]
        }
    };
}

#[cfg(target_pointer_width = "64")]
hooks! {
    c"malloc" => Malloc = malloc::<R>,
    c"_malloc_base" => Malloc = malloc::<R>,
    c"_malloc_crt" => Malloc = malloc::<R>,
    c"free" => Free = free::<R>,
    c"_free_base" => Free = free::<R>,
    c"_free_crt" => Free = free::<R>,
    c"calloc" => Calloc = calloc::<R>,
    c"_calloc_base" => Calloc = calloc::<R>,
    c"_calloc_crt" => Calloc = calloc::<R>,
    c"realloc" => Realloc = realloc::<R>,
    c"_realloc_base" => Realloc = realloc::<R>,
    c"_realloc_crt" => Realloc = realloc::<R>,
    c"_msize" => Msize = msize::<R>,
    c"_expand" => Expand = expand::<R>,
    c"_recalloc" => Recalloc = recalloc::<R>,
    c"_recalloc_base" => Recalloc = recalloc::<R>,
    c"_recalloc_crt" => Recalloc = recalloc::<R>,
    c"strdup" => Strdup = strdup::<R>,
    c"_strdup" => Strdup = strdup::<R>,
    c"_malloc_dbg" => Malloc = malloc_dbg::<R>,
    c"_free_dbg" => Free = free_dbg::<R>,
    c"_calloc_dbg" => Calloc = calloc_dbg::<R>,
    c"_realloc_dbg" => Realloc = realloc_dbg::<R>,
    c"_msize_dbg" => Msize = msize_dbg::<R>,
    c"??2@YAPEAX_K@Z" => New = new::<R>,
    c"??_U@YAPEAX_K@Z" => New = new::<R>,
    c"??3@YAXPEAX@Z" => Delete = delete::<R>,
    c"??_V@YAXPEAX@Z" => Delete = delete::<R>,
}

#[cfg(target_pointer_width = "32")]
hooks! {
    c"malloc" => Malloc = malloc::<R>,
    c"_malloc_base" => Malloc = malloc::<R>,
    c"_malloc_crt" => Malloc = malloc::<R>,
    c"free" => Free = free::<R>,
    c"_free_base" => Free = free::<R>,
    c"_free_crt" => Free = free::<R>,
    c"calloc" => Calloc = calloc::<R>,
    c"_calloc_base" => Calloc = calloc::<R>,
    c"_calloc_crt" => Calloc = calloc::<R>,
    c"realloc" => Realloc = realloc::<R>,
    c"_realloc_base" => Realloc = realloc::<R>,
    c"_realloc_crt" => Realloc = realloc::<R>,
    c"_msize" => Msize = msize::<R>,
    c"_expand" => Expand = expand::<R>,
    c"_recalloc" => Recalloc = recalloc::<R>,
    c"_recalloc_base" => Recalloc = recalloc::<R>,
    c"_recalloc_crt" => Recalloc = recalloc::<R>,
    c"strdup" => Strdup = strdup::<R>,
    c"_strdup" => Strdup = strdup::<R>,
    c"_malloc_dbg" => Malloc = malloc_dbg::<R>,
    c"_free_dbg" => Free = free_dbg::<R>,
    c"_calloc_dbg" => Calloc = calloc_dbg::<R>,
    c"_realloc_dbg" => Realloc = realloc_dbg::<R>,
    c"_msize_dbg" => Msize = msize_dbg::<R>,
    c"??2@YAPAXI@Z" => New = new::<R>,
    c"??_U@YAPAXI@Z" => New = new::<R>,
    c"??3@YAXPAX@Z" => Delete = delete::<R>,
    c"??_V@YAXPAX@Z" => Delete = delete::<R>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heaps::DlHeap;

    crate::surface!(Hooked => DlHeap = DlHeap::new);

    #[test]
    fn hook_names_are_unique() {
        let hooks = hooks::<Hooked>();
        for (i, a) in hooks.iter().enumerate() {
            assert!(hooks[i + 1..].iter().all(|b| b.symbol != a.symbol), "{:?}", a.symbol);
            assert_ne!(a.replacement, 0);
        }
    }

    #[test]
    fn our_blocks_round_trip_through_the_hooks() {
        unsafe {
            let p = calloc::<Hooked>(8, 8);
            assert!(msize::<Hooked>(p) >= 64);
            assert!(expand::<Hooked>(p, 128).is_null());
            let q = recalloc::<Hooked>(p, 32, 8);
            let bytes = std::slice::from_raw_parts(q.cast::<u8>(), 256);
            assert!(bytes.iter().all(|&b| b == 0));
            free::<Hooked>(q);
        }
    }

    #[test]
    fn foreign_blocks_are_copied_out_and_never_freed() {
        let theirs = Box::into_raw(Box::new([9u8; 96]));
        unsafe {
            free::<Hooked>(theirs.cast());
            assert_eq!(msize::<Hooked>(theirs.cast()), 0);
            let adopted = realloc::<Hooked>(theirs.cast(), 96);
            assert!(!adopted.is_null());
            assert!(std::slice::from_raw_parts(adopted.cast::<u8>(), 96).iter().all(|&b| b == 9));
            free::<Hooked>(adopted);
            drop(Box::from_raw(theirs));
        }
    }
}

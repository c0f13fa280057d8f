//! The C and C++ allocation contracts, written once on top of the surface.
//!
//! Each backend exports these under its own names; the semantics here are
//! the ones every platform agrees on. Platform quirks (Darwin's `realloc`,
//! the CRT's `_recalloc`) live with their backends.

use std::{ffi::c_char, ptr};

use libc::{c_int, c_void};

use crate::{
    alloc::Redirect,
    config::PATH_MAX,
    os::{errno::set_errno, mem::page_size},
    util::{fatal, num::checked_total, num::round_up},
};

#[inline]
fn enomem<T>(ptr: *mut T) -> *mut T {
    if ptr.is_null() {
        set_errno(libc::ENOMEM);
    }
    ptr
}

/// `malloc`: null and `ENOMEM` on failure.
pub fn malloc<R: Redirect>(size: usize) -> *mut c_void {
    enomem(R::surface().allocate(size).cast())
}

/// `free`. Null is a no-op.
///
/// # Safety
///
/// `ptr` came from this surface, the bootstrap arena, or is null.
pub unsafe fn free<R: Redirect>(ptr: *mut c_void) {
    if !ptr.is_null() {
        R::surface().free(ptr.cast())
    }
}

pub fn calloc<R: Redirect>(count: usize, size: usize) -> *mut c_void {
    enomem(R::surface().zero_allocate(count, size).cast())
}

/// `realloc` as glibc defines it: null grows from nothing, size 0 frees and
/// returns null. On failure the original block is untouched.
///
/// # Safety
///
/// As for [`free`].
pub unsafe fn realloc<R: Redirect>(ptr: *mut c_void, size: usize) -> *mut c_void {
    let new = R::surface().resize(ptr.cast(), size);
    if size != 0 {
        enomem(new.cast())
    } else {
        new.cast()
    }
}

/// # Safety
///
/// As for [`free`].
pub unsafe fn reallocarray<R: Redirect>(
    ptr: *mut c_void,
    count: usize,
    size: usize,
) -> *mut c_void {
    match checked_total(count, size) {
        Some(total) => realloc::<R>(ptr, total),
        None => {
            set_errno(libc::ENOMEM);
            ptr::null_mut()
        }
    }
}

pub fn memalign<R: Redirect>(align: usize, size: usize) -> *mut c_void {
    if !align.is_power_of_two() {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    enomem(R::surface().aligned_allocate(align, size).cast())
}

/// `posix_memalign`: the result goes through `out`, errors come back as the
/// return value and `errno` is left alone.
///
/// # Safety
///
/// `out` is valid for a pointer-sized write.
pub unsafe fn posix_memalign<R: Redirect>(
    out: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    *out = ptr::null_mut();
    if !align.is_power_of_two() || align % std::mem::size_of::<*mut c_void>() != 0 {
        return libc::EINVAL;
    }
    let p = R::surface().aligned_allocate(align, size);
    if p.is_null() {
        return libc::ENOMEM;
    }
    *out = p.cast();
    0
}

/// C11 `aligned_alloc`: `size` has to be a multiple of `align`.
pub fn aligned_alloc<R: Redirect>(align: usize, size: usize) -> *mut c_void {
    if align == 0 || size % align != 0 {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    memalign::<R>(align, size)
}

pub fn valloc<R: Redirect>(size: usize) -> *mut c_void {
    memalign::<R>(page_size(), size)
}

/// Like [`valloc`], with `size` rounded up to whole pages.
pub fn pvalloc<R: Redirect>(size: usize) -> *mut c_void {
    let page = page_size();
    match round_up(size.max(1), page) {
        Some(size) => memalign::<R>(page, size),
        None => enomem(ptr::null_mut()),
    }
}

/// # Safety
///
/// As for [`free`].
pub unsafe fn usable_size<R: Redirect>(ptr: *mut c_void) -> usize {
    R::surface().size_of(ptr.cast())
}

/// # Safety
///
/// `s` is null or NUL terminated.
pub unsafe fn strdup<R: Redirect>(s: *const c_char) -> *mut c_char {
    if s.is_null() {
        return ptr::null_mut();
    }
    let len = std::ffi::CStr::from_ptr(s).to_bytes_with_nul().len();
    let new = malloc::<R>(len) as *mut c_char;
    if !new.is_null() {
        ptr::copy_nonoverlapping(s, new, len);
    }
    new
}

/// # Safety
///
/// `s` is null, or readable up to its NUL or `n` bytes, whichever is first.
pub unsafe fn strndup<R: Redirect>(s: *const c_char, n: usize) -> *mut c_char {
    if s.is_null() {
        return ptr::null_mut();
    }
    let mut len = 0;
    while len < n && *s.add(len) != 0 {
        len += 1;
    }
    let new = malloc::<R>(len + 1) as *mut c_char;
    if !new.is_null() {
        ptr::copy_nonoverlapping(s, new, len);
        *new.add(len) = 0;
    }
    new
}

/// The real `getcwd`, whichever one we are wrapping.
pub type GetcwdFn = unsafe extern "C" fn(*mut c_char, usize) -> *mut c_char;

/// `getcwd` with glibc's extension: a null `buf` means "allocate one", from
/// our heap rather than whichever one `real` would use, so the caller's
/// `free()` lands in the right place.
///
/// # Safety
///
/// `real` is a `getcwd`; `buf` is null or valid for `size` bytes.
pub unsafe fn getcwd_with<R: Redirect>(
    real: GetcwdFn,
    buf: *mut c_char,
    size: usize,
) -> *mut c_char {
    if !buf.is_null() {
        return real(buf, size);
    }
    let size = if size == 0 { PATH_MAX } else { size };
    let buf = malloc::<R>(size) as *mut c_char;
    if buf.is_null() {
        return buf;
    }
    let result = real(buf, size);
    if result.is_null() {
        free::<R>(buf.cast());
    }
    result
}

// C++ `operator new`/`delete`. Throwing variants can't unwind across the C
// ABI, so running out of memory there is fatal.

pub fn new<R: Redirect>(size: usize) -> *mut c_void {
    let p = R::surface().allocate(size.max(1));
    if p.is_null() {
        fatal("operator new: out of memory");
    }
    p.cast()
}

pub fn new_nothrow<R: Redirect>(size: usize) -> *mut c_void {
    R::surface().allocate(size.max(1)).cast()
}

pub fn new_aligned<R: Redirect>(size: usize, align: usize) -> *mut c_void {
    let p = R::surface().aligned_allocate(align, size.max(1));
    if p.is_null() {
        fatal("aligned operator new: out of memory");
    }
    p.cast()
}

pub fn new_aligned_nothrow<R: Redirect>(size: usize, align: usize) -> *mut c_void {
    R::surface().aligned_allocate(align, size.max(1)).cast()
}

/// Every `operator delete` overload ends up here; size and alignment hints
/// are not needed.
///
/// # Safety
///
/// As for [`free`].
pub unsafe fn delete<R: Redirect>(ptr: *mut c_void) {
    free::<R>(ptr)
}

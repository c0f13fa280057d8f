//! ELF backend. The dynamic linker binds every reference to the first
//! definition in search order, so an image that is preloaded or linked ahead
//! of libc only has to define the names. [`crate::install!`] emits those
//! definitions; this module has the pieces that aren't plain surface calls.

use std::ffi::{c_char, c_int};

use crate::{
    alloc::Redirect,
    intercept::cstd::{self, GetcwdFn},
    os::{dl::NextSymbol, errno::set_errno},
};

/// glibc's `struct mallinfo`. We report nothing.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mallinfo {
    pub arena: c_int,
    pub ordblks: c_int,
    pub smblks: c_int,
    pub hblks: c_int,
    pub hblkhd: c_int,
    pub usmblks: c_int,
    pub fsmblks: c_int,
    pub uordblks: c_int,
    pub fordblks: c_int,
    pub keepcost: c_int,
}

static REAL_GETCWD: NextSymbol = NextSymbol::new(c"getcwd");

/// `getcwd` that allocates its buffer from the surface when asked to.
///
/// # Safety
///
/// As for `getcwd`.
pub unsafe fn getcwd<R: Redirect>(buf: *mut c_char, size: usize) -> *mut c_char {
    match REAL_GETCWD.get(R::surface()) {
        Some(addr) => {
            let real = std::mem::transmute::<usize, GetcwdFn>(addr);
            cstd::getcwd_with::<R>(real, buf, size)
        }
        None => {
            set_errno(libc::ENOSYS);
            std::ptr::null_mut()
        }
    }
}

pub fn mallopt(_param: c_int, _value: c_int) -> c_int {
    1
}

pub fn malloc_trim(_pad: usize) -> c_int {
    0
}

pub fn mallinfo() -> Mallinfo {
    Mallinfo::default()
}

/// Runs from the image's `.init_array` constructor.
pub fn on_load<R: Redirect>() {
    super::on_load::<R>(true);
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;

    use super::*;
    use crate::heaps::DlHeap;

    crate::surface!(Elf => DlHeap = DlHeap::new);

    #[test]
    fn getcwd_through_the_next_definition() {
        unsafe {
            let cwd = getcwd::<Elf>(std::ptr::null_mut(), 0);
            assert!(!cwd.is_null());
            let expected = std::env::current_dir().unwrap();
            assert_eq!(CStr::from_ptr(cwd).to_str().unwrap(), expected.to_str().unwrap());
            cstd::free::<Elf>(cwd.cast());

            let mut buf = [0 as c_char; 8];
            // Too small for any real path; the caller's buffer is used as is.
            if expected.as_os_str().len() >= buf.len() {
                assert!(getcwd::<Elf>(buf.as_mut_ptr(), buf.len()).is_null());
            }
        }
    }

    #[test]
    fn tuning_calls_are_accepted_and_ignored() {
        assert_eq!(mallopt(1, 2), 1);
        assert_eq!(malloc_trim(0), 0);
        assert_eq!(mallinfo(), Mallinfo::default());
    }
}

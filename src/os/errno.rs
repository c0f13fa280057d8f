use libc::c_int;

/// Set the calling thread's `errno`. A no-op where the C runtime doesn't
/// expose it.
#[inline]
pub fn set_errno(code: c_int) {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: `__errno_location` always returns the live thread's slot.
            unsafe { *libc::__errno_location() = code }
        } else if #[cfg(target_vendor = "apple")] {
            // SAFETY: as above, for Darwin's spelling.
            unsafe { *libc::__error() = code }
        } else {
            let _ = code;
        }
    }
}

/// Read the calling thread's `errno`, or 0 where unavailable.
#[inline]
pub fn errno() -> c_int {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            unsafe { *libc::__errno_location() }
        } else if #[cfg(target_vendor = "apple")] {
            unsafe { *libc::__error() }
        } else {
            0
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trips_on_this_thread() {
        set_errno(libc::ENOMEM);
        assert_eq!(errno(), libc::ENOMEM);
        set_errno(0);
        assert_eq!(errno(), 0);
    }
}

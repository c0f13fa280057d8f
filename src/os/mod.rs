#[cfg(unix)]
pub mod dl;
pub mod errno;
pub mod lock;
pub mod mem;

/// A cheap, allocation-free token for the calling thread. Unique among live
/// threads; may be reused once a thread exits.
#[inline]
pub fn thread_token() -> usize {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            // SAFETY: always safe to call.
            unsafe { libc::pthread_self() as usize }
        } else if #[cfg(windows)] {
            // SAFETY: always safe to call.
            unsafe { windows_sys::Win32::System::Threading::GetCurrentThreadId() as usize }
        } else {
            0
        }
    }
}

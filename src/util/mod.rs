pub mod hint;
pub mod num;
pub mod print;

/// Report an unrecoverable condition and abort the process.
///
/// Used where continuing would hand out memory we can no longer vouch for.
/// Unwinding is not an option: most callers sit behind an `extern "C"`
/// boundary.
#[cold]
#[inline(never)]
pub fn fatal(reason: &str) -> ! {
    crate::putln!("heapswap: fatal: ", reason);
    std::process::abort()
}

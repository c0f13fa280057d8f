/// mark some stuff as #[cold]
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}

/// Branch hint for conditions that almost never hold on the hot path.
#[inline(always)]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold(|| ());
    }
    b
}

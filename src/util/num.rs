/// Round up `n` to the nearest multiple of `to`. `None` on overflow.
pub const fn round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(m) => Some(to * (m / to)),
        None => None,
    }
}

/// Round `n` up to a multiple of the power of two `align`. `None` on overflow.
#[inline]
pub const fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    match n.checked_add(align - 1) {
        Some(m) => Some(m & !(align - 1)),
        None => None,
    }
}

/// `count * size`, rejecting overflow the way `calloc()` has to:
/// `size != 0 && total / size != count` means the product wrapped.
#[inline]
pub const fn checked_total(count: usize, size: usize) -> Option<usize> {
    let total = count.wrapping_mul(size);
    if size != 0 && total / size != count {
        None
    } else {
        Some(total)
    }
}

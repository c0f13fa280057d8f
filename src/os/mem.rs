use std::num::NonZeroUsize;

use once_cell::race::OnceNonZeroUsize;

use crate::config::FALLBACK_PAGE_SIZE;

static PAGE_SIZE: OnceNonZeroUsize = OnceNonZeroUsize::new();

const FALLBACK: NonZeroUsize = match NonZeroUsize::new(FALLBACK_PAGE_SIZE) {
    Some(n) => n,
    None => panic!("fallback page size must be nonzero"),
};

/// The OS page size. Racing first callers may both ask the OS; neither
/// allocates, so that is harmless.
pub fn page_size() -> usize {
    PAGE_SIZE
        .get_or_init(|| {
            NonZeroUsize::new(page_size::get()).unwrap_or(FALLBACK)
        })
        .get()
}

#[cfg(test)]
mod tests {
    use super::page_size;

    #[test]
    fn page_size_is_a_sane_power_of_two() {
        let ps = page_size();
        assert!(ps.is_power_of_two());
        assert!(ps >= 4096);
        assert_eq!(ps, page_size());
    }
}

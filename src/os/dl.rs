//! Finding the definitions we are shadowing.

use std::{ffi::CStr, num::NonZeroUsize};

use once_cell::race::OnceNonZeroUsize;

use crate::{
    alloc::{Allocator, Surface},
    util::hint::cold,
};

/// The next definition of `name` after the calling object in the lookup
/// order, i.e. the one our own definition hides.
///
/// `dlsym()` may call `malloc()` itself; callers that are part of the
/// allocation path must go through [`NextSymbol::get`] instead so those calls
/// land in the bootstrap arena.
pub fn next_symbol(name: &CStr) -> Option<NonZeroUsize> {
    // SAFETY: `name` is NUL terminated; RTLD_NEXT is always a valid handle.
    NonZeroUsize::new(unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) } as usize)
}

/// A lazily resolved, cached [`next_symbol`].
pub struct NextSymbol {
    name: &'static CStr,
    addr: OnceNonZeroUsize,
}

impl NextSymbol {
    pub const fn new(name: &'static CStr) -> Self {
        Self {
            name,
            addr: OnceNonZeroUsize::new(),
        }
    }

    pub fn name(&self) -> &'static CStr {
        self.name
    }

    /// The address, resolving it on first use with `surface` diverting any
    /// allocation the loader makes meanwhile.
    #[inline]
    pub fn get<A: Allocator>(&self, surface: &Surface<A>) -> Option<usize> {
        match self.addr.get() {
            Some(addr) => Some(addr.get()),
            None => cold(|| surface.resolving(|| self.resolve())),
        }
    }

    /// Resolve without diverting allocations. Only for code that already
    /// runs where re-entry is handled, like an allocator's constructor.
    pub fn resolve(&self) -> Option<usize> {
        let addr = next_symbol(self.name)?;
        // Racing resolvers all find the same address.
        Some(self.addr.get_or_init(|| addr).get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heaps::DlHeap;

    crate::surface!(Resolver => DlHeap = DlHeap::new);

    #[test]
    fn finds_libc_definitions() {
        use crate::alloc::Redirect;

        static STRLEN: NextSymbol = NextSymbol::new(c"strlen");
        let addr = STRLEN.get(Resolver::surface()).unwrap();
        assert_eq!(STRLEN.get(Resolver::surface()), Some(addr));
        assert!(next_symbol(c"definitely_not_a_symbol_heapswap").is_none());
    }
}

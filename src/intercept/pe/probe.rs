//! Telling our blocks from the CRT's without faulting.
//!
//! Anything allocated before the patches went in came from the CRT heap and
//! may still be freed or resized through our hooks. Before the allocator is
//! asked about such a pointer we make sure the bytes it will look at are
//! mapped and readable.

use std::mem::{size_of, zeroed};

use windows_sys::Win32::System::Memory::{
    VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ,
    PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_READONLY, PAGE_READWRITE,
    PAGE_WRITECOPY,
};

use crate::{alloc::Redirect, config::PROBE_LOOKBEHIND};

const READABLE: u32 = PAGE_READONLY
    | PAGE_READWRITE
    | PAGE_WRITECOPY
    | PAGE_EXECUTE_READ
    | PAGE_EXECUTE_READWRITE
    | PAGE_EXECUTE_WRITECOPY;

/// End of the readable region containing `addr`, if it is readable.
fn readable_until(addr: usize) -> Option<usize> {
    // SAFETY: VirtualQuery only inspects the address space.
    let mut info: MEMORY_BASIC_INFORMATION = unsafe { zeroed() };
    let written = unsafe {
        VirtualQuery(
            addr as *const _,
            &mut info,
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0
        || info.State != MEM_COMMIT
        || info.Protect & PAGE_GUARD != 0
        || info.Protect & READABLE == 0
    {
        return None;
    }
    Some(info.BaseAddress as usize + info.RegionSize)
}

/// How many of the `want` bytes from `ptr` can be read.
pub fn readable_len(ptr: *const u8, want: usize) -> usize {
    let start = ptr as usize;
    let goal = start.saturating_add(want);
    let mut at = start;
    while at < goal {
        match readable_until(at) {
            Some(end) if end > at => at = end,
            _ => break,
        }
    }
    at.min(goal) - start
}

pub fn is_readable(ptr: *const u8, len: usize) -> bool {
    readable_len(ptr, len) == len
}

/// The usable size of `ptr` if it is one of ours, 0 if it isn't (or can't
/// safely be asked about).
///
/// # Safety
///
/// `ptr` may be anything; if it is ours it must be live.
pub unsafe fn owned_size<R: Redirect>(ptr: *mut u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let surface = R::surface();
    if surface.is_bootstrap(ptr) {
        return surface.size_of(ptr);
    }
    let from = (ptr as usize).saturating_sub(PROBE_LOOKBEHIND);
    if !is_readable(from as *const u8, ptr as usize - from + 1) {
        return 0;
    }
    surface.size_of(ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heaps::DlHeap;

    crate::surface!(Probed => DlHeap = DlHeap::new);

    #[test]
    fn stack_is_readable_and_null_page_is_not() {
        let local = [0u8; 64];
        assert!(is_readable(local.as_ptr(), local.len()));
        assert_eq!(readable_len(16 as *const u8, 64), 0);
    }

    #[test]
    fn only_our_blocks_have_a_size() {
        let surface = Probed::surface();
        let ours = surface.allocate(48);
        assert!(unsafe { owned_size::<Probed>(ours) } >= 48);
        let theirs = Box::into_raw(Box::new([7u8; 48])) as *mut u8;
        assert_eq!(unsafe { owned_size::<Probed>(theirs) }, 0);
        assert_eq!(unsafe { owned_size::<Probed>(0x10 as *mut u8) }, 0);
        unsafe {
            surface.free(ours);
            drop(Box::from_raw(theirs as *mut [u8; 48]));
        }
    }
}

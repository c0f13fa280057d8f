use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr,
};

use dlmalloc::Dlmalloc;

use crate::{
    alloc::Allocator,
    config::MIN_ALIGNMENT,
    os::lock::RawLock,
    util::{fatal, hint::cold, num::align_up},
};

// https://gee.cs.oswego.edu/dl/html/malloc.html

const HEADER_SIZE: usize = 32;
const COOKIE: usize = 0x6865_6170_7377_6170_u64 as usize;

/// Written immediately before every block so we can size and free it, and
/// tell our blocks apart from anybody else's.
///
/// ```text
/// base                      user
///  |<-------- lead -------->|<--- size --->|
///  | padding ... | Header   | data ...     |
/// ```
#[repr(C)]
struct Header {
    /// Usable bytes after `user`.
    size: usize,
    /// `user - base`.
    lead: u32,
    /// Alignment the block was requested with, as passed to dlmalloc.
    align: u32,
    /// Which heap of a pool owns this block.
    owner: u32,
    _pad: u32,
    /// `COOKIE ^ user ^ size ^ owner`.
    check: usize,
}

const _: () = assert!(size_of::<Header>() <= HEADER_SIZE);

impl Header {
    #[inline]
    fn checksum(user: *mut u8, size: usize, owner: u32) -> usize {
        COOKIE ^ user as usize ^ size ^ owner as usize
    }

    /// The header of `user`, if it looks like one of ours.
    ///
    /// # Safety
    ///
    /// The `HEADER_SIZE` bytes before `user` must be readable.
    #[inline]
    unsafe fn of(user: *mut u8) -> Option<*mut Header> {
        if user as usize % MIN_ALIGNMENT != 0 || (user as usize) < HEADER_SIZE {
            return None;
        }
        let header = user.sub(HEADER_SIZE) as *mut Header;
        let h = header.read();
        (h.check == Header::checksum(user, h.size, h.owner)).then_some(header)
    }
}

/// A lock-protected [`Dlmalloc`] instance. Every block carries a small
/// header, so frees and size queries need nothing but the pointer.
///
/// A `DlHeap` only ever gets memory from the OS directly (`mmap`), so it is
/// safe to use underneath an interposed `malloc()`.
pub struct DlHeap {
    lock: RawLock,
    dl: UnsafeCell<Dlmalloc>,
    id: u32,
}

// SAFETY: `dl` is only touched with `lock` held.
unsafe impl Sync for DlHeap {}
unsafe impl Send for DlHeap {}

impl DlHeap {
    pub const fn new() -> Self {
        Self::with_id(0)
    }

    /// A heap whose blocks are tagged with `id`, for pools of heaps.
    pub const fn with_id(id: u32) -> Self {
        Self {
            lock: RawLock::new(),
            dl: UnsafeCell::new(Dlmalloc::new()),
            id,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Which heap allocated `ptr`, if any `DlHeap` did.
    ///
    /// # Safety
    ///
    /// The 32 bytes before `ptr` must be readable.
    pub unsafe fn owner_of(ptr: *mut u8) -> Option<u32> {
        Header::of(ptr).map(|h| (*h).owner)
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&mut Dlmalloc) -> R) -> R {
        let _guard = self.lock.guard();
        // SAFETY: we hold the lock, so nobody else has a reference.
        f(unsafe { &mut *self.dl.get() })
    }

    fn allocate_aligned(&self, align: usize, size: usize) -> *mut u8 {
        let align = align.max(MIN_ALIGNMENT);
        let (Some(size), Some(lead)) = (
            align_up(size.max(1), MIN_ALIGNMENT),
            align_up(HEADER_SIZE, align),
        ) else {
            return ptr::null_mut();
        };
        let (Ok(lead32), Ok(align32)) = (u32::try_from(lead), u32::try_from(align)) else {
            return ptr::null_mut();
        };
        let Some(total) = lead.checked_add(size) else {
            return ptr::null_mut();
        };
        // SAFETY: `align` is a power of two no smaller than dlmalloc's.
        let base = self.with(|dl| unsafe { dl.malloc(total, align) });
        if base.is_null() {
            return base;
        }
        // SAFETY: `base..base + total` is ours and `lead >= HEADER_SIZE`.
        unsafe {
            let user = base.add(lead);
            (user.sub(HEADER_SIZE) as *mut Header).write(Header {
                size,
                lead: lead32,
                align: align32,
                owner: self.id,
                _pad: 0,
                check: Header::checksum(user, size, self.id),
            });
            user
        }
    }

    /// # Safety
    ///
    /// `header` belongs to `user`, and `user` is a live block of this heap.
    unsafe fn release(&self, user: *mut u8, header: *mut Header) {
        let h = header.read();
        // Scrub so a double free is caught instead of corrupting dlmalloc.
        (*header).check = 0;
        let lead = h.lead as usize;
        self.with(|dl| dl.free(user.sub(lead), lead + h.size, h.align as usize));
    }
}

impl Default for DlHeap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Allocator for DlHeap {
    #[inline]
    fn allocate(&self, size: usize) -> *mut u8 {
        self.allocate_aligned(MIN_ALIGNMENT, size)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        match Header::of(ptr) {
            Some(header) if (*header).owner == self.id => self.release(ptr, header),
            Some(_) => cold(|| fatal("block freed through a heap that doesn't own it")),
            // Not ours. Dropping it is the only safe thing to do.
            None => {}
        }
    }

    #[inline]
    fn aligned_allocate(&self, align: usize, size: usize) -> *mut u8 {
        self.allocate_aligned(align, size)
    }

    unsafe fn size_of(&self, ptr: *mut u8) -> usize {
        match Header::of(ptr) {
            Some(header) => (*header).size,
            None => 0,
        }
    }

    fn lock(&self) {
        self.lock.lock()
    }

    unsafe fn unlock(&self) {
        self.lock.unlock()
    }

    unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        let Some(header) = Header::of(ptr) else {
            return ptr::null_mut();
        };
        let h = header.read();
        if new_size <= h.size {
            return ptr;
        }
        let Some(size) = align_up(new_size, MIN_ALIGNMENT) else {
            return ptr::null_mut();
        };
        let lead = h.lead as usize;
        let Some(total) = lead.checked_add(size) else {
            return ptr::null_mut();
        };
        let base = self.with(|dl| {
            dl.realloc(ptr.sub(lead), lead + h.size, h.align as usize, total)
        });
        if base.is_null() {
            return base;
        }
        let user = base.add(lead);
        let header = user.sub(HEADER_SIZE) as *mut Header;
        (*header).size = size;
        (*header).check = Header::checksum(user, size, h.owner);
        user
    }
}

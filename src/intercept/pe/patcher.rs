//! All writes into other modules' memory happen here, and every one of them
//! is recorded so it can be undone.

use std::{cell::UnsafeCell, ffi::CStr, ptr};

use windows_sys::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache,
    Memory::{VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, PAGE_READWRITE},
    Threading::GetCurrentProcess,
};

use crate::{
    config::PATCH_CAPACITY,
    error::{Error, Result},
    intercept::pe::{image::ImageView, is_crt_import, jump},
    os::lock::RawLock,
};

#[derive(Clone, Copy)]
enum Kind {
    /// An import slot; `original` is what the loader had put there.
    Slot,
    /// The first bytes of a function, overwritten with a jump.
    Prologue { saved: [u8; jump::MAX_LEN], len: usize },
}

#[derive(Clone, Copy)]
struct Patch {
    module: usize,
    symbol: Option<&'static CStr>,
    address: usize,
    original: usize,
    kind: Kind,
    live: bool,
}

impl Patch {
    const EMPTY: Patch = Patch {
        module: 0,
        symbol: None,
        address: 0,
        original: 0,
        kind: Kind::Slot,
        live: false,
    };
}

struct Registry {
    lock: RawLock,
    len: UnsafeCell<usize>,
    patches: UnsafeCell<[Patch; PATCH_CAPACITY]>,
}

// SAFETY: the cells are only touched with `lock` held.
unsafe impl Sync for Registry {}

static REGISTRY: Registry = Registry {
    lock: RawLock::new(),
    len: UnsafeCell::new(0),
    patches: UnsafeCell::new([Patch::EMPTY; PATCH_CAPACITY]),
};

impl Registry {
    fn with<T>(&self, f: impl FnOnce(&mut usize, &mut [Patch; PATCH_CAPACITY]) -> T) -> T {
        let _guard = self.lock.guard();
        // SAFETY: we hold the lock.
        unsafe { f(&mut *self.len.get(), &mut *self.patches.get()) }
    }
}

/// Copy `bytes` to `addr`, lifting write protection for the duration.
///
/// # Safety
///
/// `addr..addr + bytes.len()` is mapped, and nothing executes or reads it
/// concurrently in a way a torn write would break.
unsafe fn write_protected(addr: usize, bytes: &[u8], code: bool) -> Result<()> {
    let access = if code { PAGE_EXECUTE_READWRITE } else { PAGE_READWRITE };
    let mut old: PAGE_PROTECTION_FLAGS = 0;
    if VirtualProtect(addr as *const _, bytes.len(), access, &mut old) == 0 {
        return Err(Error::ProtectionDenied { addr });
    }
    ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
    let mut ignored: PAGE_PROTECTION_FLAGS = 0;
    VirtualProtect(addr as *const _, bytes.len(), old, &mut ignored);
    if code {
        FlushInstructionCache(GetCurrentProcess(), addr as *const _, bytes.len());
    }
    Ok(())
}

unsafe fn restore(patch: &Patch) -> Result<()> {
    match patch.kind {
        Kind::Slot => write_protected(patch.address, &patch.original.to_ne_bytes(), false),
        Kind::Prologue { saved, len } => write_protected(patch.address, &saved[..len], true),
    }
}

const MAX_SLOTS: usize = 8;

/// Point every import of `symbol` from a CRT DLL in `module` at
/// `replacement`. Returns the address the first slot held before.
///
/// # Safety
///
/// `module` is a loaded module; `replacement` has the signature of `symbol`.
unsafe fn rewrite_imports(
    module: usize,
    symbol: &'static CStr,
    replacement: usize,
) -> Result<usize> {
    let view = ImageView::from_module(module as *const u8)?;
    let mut slots = [0usize; MAX_SLOTS];
    let mut found = 0;
    view.for_each_import(|import| {
        if found < MAX_SLOTS && import.symbol == symbol && is_crt_import(import.dll.to_bytes()) {
            slots[found] = module + import.slot_rva as usize;
            found += 1;
        }
    });
    if found == 0 {
        return Err(Error::SymbolNotFound(symbol));
    }

    REGISTRY.with(|len, patches| {
        let mut first = None;
        for &slot in &slots[..found] {
            let original = (slot as *const usize).read_volatile();
            if original == replacement {
                continue;
            }
            if *len == PATCH_CAPACITY {
                return Err(Error::RegistryFull(PATCH_CAPACITY));
            }
            write_protected(slot, &replacement.to_ne_bytes(), false)?;
            patches[*len] = Patch {
                module,
                symbol: Some(symbol),
                address: slot,
                original,
                kind: Kind::Slot,
                live: true,
            };
            *len += 1;
            first.get_or_insert(original);
        }
        first.ok_or(Error::SymbolNotFound(symbol))
    })
}

/// Overwrite the start of `module`'s export `symbol` with a jump to
/// `replacement`. Returns the export's address; it can't be called any more.
///
/// # Safety
///
/// As for [`rewrite_imports`], and no thread may be executing the first few
/// bytes of the function.
unsafe fn splice_prologue(
    module: usize,
    symbol: &'static CStr,
    replacement: usize,
) -> Result<usize> {
    use windows_sys::Win32::System::LibraryLoader::GetProcAddress;

    let target = match GetProcAddress(module as _, symbol.as_ptr() as *const u8) {
        Some(f) => f as usize,
        None => return Err(Error::SymbolNotFound(symbol)),
    };
    let code = jump::for_host(target, replacement)?;
    REGISTRY.with(|len, patches| {
        if *len == PATCH_CAPACITY {
            return Err(Error::RegistryFull(PATCH_CAPACITY));
        }
        let mut saved = [0u8; jump::MAX_LEN];
        ptr::copy_nonoverlapping(target as *const u8, saved.as_mut_ptr(), code.len());
        write_protected(target, code.as_bytes(), true)?;
        patches[*len] = Patch {
            module,
            symbol: Some(symbol),
            address: target,
            original: target,
            kind: Kind::Prologue {
                saved,
                len: code.len(),
            },
            live: true,
        };
        *len += 1;
        Ok(target)
    })
}

/// Redirect `symbol` in `module` to `replacement`, with whichever strategy
/// this build uses: rewriting `module`'s imports, or (with `pe-prologue`)
/// patching `module`'s own export.
///
/// # Safety
///
/// See [`rewrite_imports`] and [`splice_prologue`].
pub unsafe fn install_override(
    module: usize,
    symbol: &'static CStr,
    replacement: usize,
) -> Result<usize> {
    if cfg!(feature = "pe-prologue") {
        splice_prologue(module, symbol, replacement)
    } else {
        rewrite_imports(module, symbol, replacement)
    }
}

/// Undo every live patch of `symbol` in `module`. Returns how many were
/// undone.
///
/// # Safety
///
/// No thread may be executing patched prologue bytes.
pub unsafe fn remove_override(module: usize, symbol: &'static CStr) -> Result<usize> {
    let restored = REGISTRY.with(|len, patches| {
        let mut restored = 0;
        for patch in patches[..*len]
            .iter_mut()
            .filter(|p| p.live && p.module == module && p.symbol == Some(symbol))
        {
            match restore(patch) {
                Ok(()) => {
                    patch.live = false;
                    restored += 1;
                }
                Err(err) => log::warn!("could not restore {symbol:?}: {err}"),
            }
        }
        restored
    });
    if restored == 0 {
        Err(Error::NotInstalled(symbol))
    } else {
        Ok(restored)
    }
}

/// Undo every live patch, newest first. Returns how many were undone.
///
/// # Safety
///
/// As for [`remove_override`].
pub unsafe fn remove_all() -> usize {
    REGISTRY.with(|len, patches| {
        let mut restored = 0;
        for patch in patches[..*len].iter_mut().rev().filter(|p| p.live) {
            match restore(patch) {
                Ok(()) => {
                    patch.live = false;
                    restored += 1;
                }
                Err(err) => log::warn!("could not restore patch at {:#x}: {err}", patch.address),
            }
        }
        restored
    })
}

/// Patches currently in place.
pub fn live_count() -> usize {
    REGISTRY.with(|len, patches| patches[..*len].iter().filter(|p| p.live).count())
}

//! PE backend. Windows has no symbol interposition, so at process attach we
//! walk every loaded module and patch its way into the CRT: rewriting import
//! slots by default, or splicing jumps into the CRT's own functions with the
//! `pe-prologue` feature.
//!
//! Image parsing and jump encoding don't touch the OS and build everywhere;
//! the rest is Windows-only.

pub mod image;
pub mod jump;

#[cfg(windows)]
pub mod hooks;
#[cfg(windows)]
pub mod patcher;
#[cfg(windows)]
pub mod probe;

use crate::config::{CRT_IMPORT_DLLS, CRT_MODULE_MARKERS};

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty()
        || haystack
            .windows(needle.len())
            .any(|w| w.eq_ignore_ascii_case(needle))
}

fn starts_with_ignore_case(s: &[u8], prefix: &[u8]) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Whether an import descriptor's DLL name is one whose allocation imports we
/// rewrite.
pub fn is_crt_import(dll: &[u8]) -> bool {
    CRT_IMPORT_DLLS
        .iter()
        .any(|name| dll.eq_ignore_ascii_case(name.as_bytes()))
        || starts_with_ignore_case(dll, b"msvcr")
        || starts_with_ignore_case(dll, b"vcruntime")
}

/// Whether a module, by its file name, is part of the C runtime.
pub fn is_crt_module(path: &[u8]) -> bool {
    let name = match path.iter().rposition(|&b| b == b'\\' || b == b'/') {
        Some(sep) => &path[sep + 1..],
        None => path,
    };
    CRT_MODULE_MARKERS
        .iter()
        .any(|marker| contains_ignore_case(name, marker.as_bytes()))
}

#[cfg(windows)]
pub use self::live::*;

#[cfg(windows)]
mod live {
    use std::{
        mem,
        sync::atomic::{AtomicBool, Ordering},
    };

    use windows_sys::Win32::{
        Foundation::HMODULE,
        System::{
            LibraryLoader::GetModuleFileNameA,
            ProcessStatus::EnumProcessModules,
            SystemServices::{
                DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, DLL_THREAD_ATTACH, DLL_THREAD_DETACH,
            },
            Threading::GetCurrentProcess,
        },
    };

    use super::{hooks, is_crt_module, patcher};
    use crate::{
        alloc::{Ready, Redirect},
        config::MAX_MODULES,
        error::Error,
        threads,
    };

    static ENABLED: AtomicBool = AtomicBool::new(false);
    static INSTALLED: AtomicBool = AtomicBool::new(false);

    /// Whether hooked calls go to the surface. When off, they pass through to
    /// the CRT wherever its original function is known.
    #[inline]
    pub fn is_enabled() -> bool {
        ENABLED.load(Ordering::Acquire)
    }

    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::Acquire)
    }

    pub fn enable() {
        ENABLED.store(true, Ordering::Release);
    }

    pub fn disable() {
        ENABLED.store(false, Ordering::Release);
    }

    /// Fill `out` with the process's modules. Returns how many there are,
    /// capped at `out.len()`.
    fn loaded_modules(out: &mut [HMODULE; MAX_MODULES]) -> usize {
        let mut needed = 0u32;
        // SAFETY: `out` is writable for the byte count we pass.
        let ok = unsafe {
            EnumProcessModules(
                GetCurrentProcess(),
                out.as_mut_ptr(),
                mem::size_of_val(out) as u32,
                &mut needed,
            )
        };
        if ok == 0 {
            return 0;
        }
        (needed as usize / mem::size_of::<HMODULE>()).min(MAX_MODULES)
    }

    fn module_is_crt(module: HMODULE) -> bool {
        let mut path = [0u8; 260];
        // SAFETY: `path` is writable for its whole length.
        let len =
            unsafe { GetModuleFileNameA(module, path.as_mut_ptr(), path.len() as u32) } as usize;
        len != 0 && is_crt_module(&path[..len.min(path.len())])
    }

    /// Patch one module. Returns how many names were redirected.
    unsafe fn patch_module<R: Redirect>(base: usize) -> usize {
        let mut patched = 0;
        for hook in hooks::hooks::<R>() {
            match patcher::install_override(base, hook.symbol, hook.replacement) {
                Ok(original) => {
                    // A spliced prologue can't be called through any more.
                    if !cfg!(feature = "pe-prologue") {
                        hooks::save_original(hook.family, original);
                    }
                    patched += 1;
                }
                Err(Error::SymbolNotFound(_)) => {}
                Err(err) => log::warn!("module {base:#x}: skipping {:?}: {err}", hook.symbol),
            }
        }
        patched
    }

    /// `DLL_PROCESS_ATTACH`: redirect every other module's CRT allocation
    /// calls, then switch redirection on.
    ///
    /// # Safety
    ///
    /// Runs under the loader lock, before any other thread can reach the
    /// hooks. `own_module` is the module containing the surface.
    pub unsafe fn attach<R: Redirect>(own_module: usize) {
        let surface = R::surface();
        surface.warm_up();

        // SAFETY: module handles are plain integers or pointers; zero is a
        // valid placeholder for either.
        let mut modules: [HMODULE; MAX_MODULES] = mem::zeroed();
        let count = loaded_modules(&mut modules);
        let (mut touched, mut patched) = (0, 0);
        for &module in &modules[..count] {
            let base = module as usize;
            if base == 0 || base == own_module {
                continue;
            }
            if cfg!(feature = "pe-prologue") && !module_is_crt(module) {
                continue;
            }
            let n = patch_module::<R>(base);
            if n != 0 {
                touched += 1;
                patched += n;
            }
        }

        INSTALLED.store(true, Ordering::Release);
        enable();
        surface.declare(Ready::PATCHED | Ready::THREADS);
        log::debug!("redirected {patched} CRT entry points in {touched} of {count} modules");
        crate::util::print::trace!("patched ", patched, " entry points in ", touched, " modules");
    }

    /// `DLL_PROCESS_DETACH`. The patches stay: other modules' destructors may
    /// still free our blocks, and the hooks recognise those even when
    /// disabled.
    pub fn detach() {
        disable();
    }

    /// Everything `DllMain` has to do, by `reason`. The thread that loads us
    /// gets no `DLL_THREAD_ATTACH`, so its hooks run from process attach.
    ///
    /// # Safety
    ///
    /// Called only from the image's `DllMain`, with its arguments.
    pub unsafe fn dll_main<R: Redirect>(module: usize, reason: u32) -> bool {
        match reason {
            DLL_PROCESS_ATTACH => {
                attach::<R>(module);
                threads::begin::<R>();
            }
            DLL_THREAD_ATTACH => threads::windows::attach::<R>(),
            DLL_THREAD_DETACH => threads::windows::detach::<R>(),
            DLL_PROCESS_DETACH => {
                threads::end::<R>();
                detach();
            }
            _ => {}
        }
        true
    }

    /// Switch redirection off and undo every patch. Returns how many were
    /// undone.
    ///
    /// # Safety
    ///
    /// Blocks handed out by the surface must not reach the CRT afterwards;
    /// no other thread may be inside a patched prologue.
    pub unsafe fn uninstall() -> usize {
        disable();
        let restored = patcher::remove_all();
        INSTALLED.store(false, Ordering::Release);
        restored
    }
}

use std::ffi::CStr;

/// Failures of the few operations that happen off the allocation path:
/// installing overrides and registering fork handlers.
///
/// None of these are fatal. The caller logs them and moves on, because a
/// partially redirected process is still better than one that won't start.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("symbol {0:?} not found")]
    SymbolNotFound(&'static CStr),
    #[error("changing page protection at {addr:#x} was denied")]
    ProtectionDenied { addr: usize },
    #[error("module at {base:#x} is not a valid PE image: {reason}")]
    NotAnImage { base: usize, reason: &'static str },
    #[error("override registry is full ({0} entries)")]
    RegistryFull(usize),
    #[error("no override installed for {0:?}")]
    NotInstalled(&'static CStr),
    #[error("jump from {from:#x} to {to:#x} cannot be encoded")]
    JumpOutOfRange { from: usize, to: usize },
    #[error("pthread_atfork() failed with code {0}")]
    AtFork(i32),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

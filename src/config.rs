//! Build-time knobs. Nothing here is read from the environment: the backend
//! and the allocator are fixed when the interposing image is linked.

/// Every handle handed out through the surface is aligned to at least this.
pub const MIN_ALIGNMENT: usize = 16;

/// Bytes available to serve requests before the bridge is bound.
pub const BOOTSTRAP_ARENA_SIZE: usize = 64 * 1024;

/// Alignment of every bootstrap arena pointer.
pub const BOOTSTRAP_ALIGNMENT: usize = 16;

/// Page size to assume if the OS can't tell us.
#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
pub const FALLBACK_PAGE_SIZE: usize = 16384;
#[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Buffer size `getcwd(NULL, 0)` allocates.
pub const PATH_MAX: usize = 4096;

/// Name the emulated malloc zone reports to introspection tools.
pub const ZONE_NAME: &std::ffi::CStr = c"heapswapDefaultZone";

/// How many individual import slots / prologues the PE patcher can track.
pub const PATCH_CAPACITY: usize = 1024;

/// How many loaded modules the PE backend will walk at process attach.
pub const MAX_MODULES: usize = 1024;

/// Substrings (lowercase) identifying a module as part of the C runtime.
pub const CRT_MODULE_MARKERS: &[&str] = &["crt", "msvcr", "msvcp", "vcruntime"];

/// DLLs whose imports the import-table strategy rewrites.
pub const CRT_IMPORT_DLLS: &[&str] = &[
    "ucrtbase.dll",
    "ucrtbased.dll",
    "api-ms-win-crt-heap-l1-1-0.dll",
    "msvcrt.dll",
];

/// How far before a pointer an allocator's `size_of` may look (for a block
/// header). The PE backend checks this much is readable before asking about a
/// pointer it didn't hand out.
pub const PROBE_LOOKBEHIND: usize = 64;

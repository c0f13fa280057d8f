//! Interposes everything and hands it straight back to libc's allocator.
//! Useful for checking that the interception itself is transparent.
//!
//! ```text
//! cargo build --release --example preload_system
//! LD_PRELOAD=target/release/examples/libpreload_system.so git status
//! ```

#[cfg(unix)]
mod redirect {
    use heapswap::heaps::SystemHeap;

    heapswap::surface!(pub Passthrough => SystemHeap = SystemHeap::new);
    heapswap::install!(Passthrough);
}

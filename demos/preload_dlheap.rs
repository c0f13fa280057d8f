//! Every allocation in the process served by a lock-protected dlmalloc.
//!
//! ```text
//! cargo build --release --example preload_dlheap
//! LD_PRELOAD=target/release/examples/libpreload_dlheap.so ls -l
//! DYLD_INSERT_LIBRARIES=target/release/examples/libpreload_dlheap.dylib ls -l
//! ```

use heapswap::heaps::DlHeap;

heapswap::surface!(pub Heap => DlHeap = DlHeap::new);
heapswap::install!(Heap);

// Rust code in this image goes through the same surface as C callers.
#[global_allocator]
static GLOBAL: heapswap::Global<Heap> = heapswap::Global::new();

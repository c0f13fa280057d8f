//! Threads spread over eight dlmalloc heaps, so they rarely share a lock.
//!
//! ```text
//! cargo build --release --example preload_pooled
//! LD_PRELOAD=target/release/examples/libpreload_pooled.so make -j8
//! ```

use heapswap::heaps::PooledHeap;

heapswap::surface!(pub Pooled => PooledHeap<8> = PooledHeap::new);
heapswap::install!(Pooled);

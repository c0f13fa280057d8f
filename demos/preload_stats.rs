//! Counts what the process allocates and prints a summary at exit.
//!
//! ```text
//! cargo build --release --example preload_stats
//! LD_PRELOAD=target/release/examples/libpreload_stats.so python3 -c 'print(1)'
//! ```

use heapswap::{
    heaps::{DlHeap, StatsHeap},
    Redirect,
};

heapswap::surface!(pub Counted => StatsHeap<DlHeap> = || StatsHeap::new(DlHeap::new()));
heapswap::install!(Counted);

extern "C" fn report() {
    let Some(heap) = Counted::surface().allocator() else {
        return;
    };
    let stats = heap.snapshot();
    // Runs while libc is tearing down; `putln!` never allocates.
    heapswap::putln!(
        "heapswap: ",
        stats.allocations,
        " allocations, ",
        stats.frees,
        " frees, peak ",
        stats.peak_bytes,
        " bytes, ",
        stats.threads_started,
        " threads"
    );
}

#[cfg(all(unix, not(target_vendor = "apple")))]
#[used]
#[link_section = ".fini_array"]
static REPORT: extern "C" fn() = report;

#[cfg(target_vendor = "apple")]
#[used]
#[link_section = "__DATA,__mod_term_func"]
static REPORT: extern "C" fn() = report;

#[cfg(windows)]
#[no_mangle]
pub extern "C" fn heapswap_demo_report() {
    report()
}

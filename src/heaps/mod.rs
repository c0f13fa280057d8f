//! Small concrete allocators to put behind the surface.
//!
//! None of them is the point of this crate. They exist so there is something
//! real to redirect to in the demos and the tests.

mod dlheap;
mod pooled;
mod stats;
#[cfg(unix)]
mod system;

pub use dlheap::DlHeap;
pub use pooled::PooledHeap;
pub use stats::{Stats, StatsHeap};
#[cfg(unix)]
pub use system::SystemHeap;

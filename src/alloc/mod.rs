pub mod adapter;
pub mod ansi;
pub mod bootstrap;
pub mod bridge;
pub mod surface;
pub mod table;

pub use adapter::Allocator;
pub use ansi::Ansi;
pub use bootstrap::{BootstrapArena, Ready};
pub use bridge::Bridge;
pub use surface::{Global, Redirect, Surface};
pub use table::SurfaceTable;

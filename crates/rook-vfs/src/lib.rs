//! Virtual filesystem layer: every byte the bookie persists goes through
//! these traits, so tests can swap the real filesystem for an in-memory
//! one with power-loss simulation.

pub mod memory;
pub mod traits;
pub mod unix;

pub use memory::MemoryVfs;
pub use traits::{OpenFlags, Vfs, VfsFile};
pub use unix::UnixVfs;

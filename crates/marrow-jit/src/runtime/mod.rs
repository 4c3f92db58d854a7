//! Interfaces to the runtime embedding the cache.
//!
//! The cache does not own threads, methods, or the managed heap; it shares
//! method descriptors with the interpreter and compiler, asks the runtime's
//! checkpoint service to walk mutator stacks, and stores compressed heap
//! references in committed root tables. Everything here is the contract,
//! not the machinery.

mod checkpoint;
mod method;

pub use checkpoint::{StackSnapshot, StaticCheckpoint, StackWalker, ThreadCheckpoint};
pub use method::{AllocatorId, Method};

/// A compressed managed-heap reference, as stored in committed root tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef(pub u32);

/// Well-known entrypoints the cache redirects methods to.
#[derive(Debug, Clone, Copy)]
pub struct EntryPoints {
    /// Target a method runs through while it has no (or no longer has)
    /// compiled code.
    pub interpreter_bridge: usize,
}

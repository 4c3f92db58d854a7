//! JIT code cache for the Marrow VM.
//!
//! Stores natively-compiled method code and its auxiliary metadata in a
//! dual-view (W^X) memory region, grows on demand under a hard capacity
//! ceiling, and reclaims unreachable code with a checkpoint-based mark-sweep
//! collector. It includes:
//! - Raw mapping and memory-file plumbing (`mmap`)
//! - Bounded arena allocation over the code and data halves (`arena`)
//! - The dual-view region with commit and capacity growth (`region`)
//! - The per-method code header ABI (`header`)
//! - The method registry and PC lookup (`registry`)
//! - Per-method profiling records (`profiling`)
//! - The cache façade used by the compiler and stack walker (`cache`)
//! - Mark-sweep collection over live return PCs (`collector`)
//! - Interfaces to the embedding runtime (`runtime`)
//!
//! One `CodeCache` instance is created at runtime startup and passed by
//! reference to every consumer; there is no global cache.

pub mod arena;
pub mod bitmap;
pub mod cache;
pub mod config;
pub mod error;
pub mod header;
pub mod mmap;
pub mod profiling;
pub mod region;
pub mod registry;
pub mod runtime;

mod collector;

pub use cache::{CodeCache, CommitRequest};
pub use config::CacheConfig;
pub use error::CacheError;
pub use header::{CodeHeader, FrameInfo, CODE_ALIGNMENT};
pub use profiling::{ClassId, InlineCache, ProfilingInfo};
pub use runtime::{
    AllocatorId, EntryPoints, Method, ObjectRef, StackSnapshot, StackWalker, StaticCheckpoint,
    ThreadCheckpoint,
};

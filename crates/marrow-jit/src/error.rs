//! Error taxonomy for code cache initialization.
//!
//! Only the OS-level mapping work at construction time can fail with an
//! error value; it is fatal to the JIT and the embedder reacts by running
//! interpreter-only. Everything past initialization (arena exhaustion,
//! cache-flush failure) reports through `Option`/`bool` sentinels to the
//! immediate caller and is handled there.

use std::io;
use thiserror::Error;

/// Failure creating the cache memory region.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache capacities: initial={initial}, max={max}")]
    InvalidCapacity { initial: usize, max: usize },

    #[error("failed to create jit memory file: {0}")]
    MemoryFile(#[source] io::Error),

    #[error("failed to map {what}: {source}")]
    Map {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to protect {what}: {source}")]
    Protect {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to seal zygote memory file: {0}")]
    Seal(#[source] io::Error),

    #[error("dual-view mapping unavailable and rwx fallback not permitted: {0}")]
    DualViewUnavailable(#[source] io::Error),
}

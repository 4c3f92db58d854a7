//! Runtime-side method identity shared with the code cache.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::profiling::ProfilingInfo;
use std::ptr::NonNull;

/// Identity of the external allocation arena a method's metadata lives in
/// (class-loader scoped); unloading such an arena removes every method it
/// owns from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocatorId(pub u64);

/// A method as the runtime sees it. The cache reads and writes the
/// entrypoint and profiling slots; everything else belongs to the runtime.
pub struct Method {
    name: String,
    owner: AllocatorId,
    entry_point: AtomicUsize,
    profiling_info: AtomicPtr<ProfilingInfo>,
    /// Invocation warmth driving compilation decisions; reset when the
    /// method's compiled code is collected.
    warmth: AtomicU32,
}

impl Method {
    pub fn new(name: impl Into<String>, owner: AllocatorId, initial_entry_point: usize) -> Self {
        Method {
            name: name.into(),
            owner,
            entry_point: AtomicUsize::new(initial_entry_point),
            profiling_info: AtomicPtr::new(ptr::null_mut()),
            warmth: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> AllocatorId {
        self.owner
    }

    /// Address invocations transfer control to: compiled code, or the
    /// interpreter bridge while none is attached.
    pub fn entry_point(&self) -> usize {
        self.entry_point.load(Ordering::Acquire)
    }

    pub fn set_entry_point(&self, entry_point: usize) {
        self.entry_point.store(entry_point, Ordering::Release);
    }

    pub fn profiling_info(&self) -> Option<NonNull<ProfilingInfo>> {
        NonNull::new(self.profiling_info.load(Ordering::Acquire))
    }

    pub fn set_profiling_info(&self, info: Option<NonNull<ProfilingInfo>>) {
        let raw = info.map_or(ptr::null_mut(), NonNull::as_ptr);
        self.profiling_info.store(raw, Ordering::Release);
    }

    pub fn warmth(&self) -> u32 {
        self.warmth.load(Ordering::Relaxed)
    }

    pub fn increment_warmth(&self) -> u32 {
        self.warmth.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn reset_warmth(&self) {
        self.warmth.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("entry_point", &self.entry_point.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_updates() {
        let method = Method::new("Widget.render", AllocatorId(1), 0x1000);
        assert_eq!(method.entry_point(), 0x1000);
        method.set_entry_point(0x2000);
        assert_eq!(method.entry_point(), 0x2000);
    }

    #[test]
    fn test_profiling_slot_starts_empty() {
        let method = Method::new("Widget.render", AllocatorId(1), 0);
        assert!(method.profiling_info().is_none());
    }

    #[test]
    fn test_warmth_counts_and_resets() {
        let method = Method::new("Widget.render", AllocatorId(1), 0);
        assert_eq!(method.increment_warmth(), 1);
        assert_eq!(method.increment_warmth(), 2);
        method.reset_warmth();
        assert_eq!(method.warmth(), 0);
    }
}

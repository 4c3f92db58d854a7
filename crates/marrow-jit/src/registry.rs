//! Mutable index over live cache entries.
//!
//! The only place that knows which committed address belongs to which
//! method. Ordered by code address so a PC can be resolved with a
//! lower-bound probe; also tracks every live `ProfilingInfo` allocation so
//! the sweep and arena teardown can find them.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::profiling::ProfilingInfo;
use crate::runtime::Method;

/// A profiling record and the method it was created for.
pub struct ProfilingEntry {
    pub method: Arc<Method>,
    pub info: NonNull<ProfilingInfo>,
}

#[derive(Default)]
pub struct Registry {
    /// Committed code address -> owning method.
    method_code_map: BTreeMap<usize, Arc<Method>>,
    profiling_infos: Vec<ProfilingEntry>,
}

// Safety: the NonNull in ProfilingEntry points into the region's data half;
// the cache lock serializes every access.
unsafe impl Send for Registry {}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, code_ptr: usize, method: Arc<Method>) {
        let previous = self.method_code_map.insert(code_ptr, method);
        debug_assert!(previous.is_none(), "code allocations never overlap");
    }

    pub fn remove(&mut self, code_ptr: usize) -> Option<Arc<Method>> {
        self.method_code_map.remove(&code_ptr)
    }

    /// Entry with the greatest code address at or below `pc`: the only one
    /// whose range can contain it.
    pub fn find_code_at_or_before(&self, pc: usize) -> Option<(usize, &Arc<Method>)> {
        self.method_code_map
            .range(..=pc)
            .next_back()
            .map(|(&addr, method)| (addr, method))
    }

    pub fn iter_code(&self) -> impl Iterator<Item = (usize, &Arc<Method>)> {
        self.method_code_map.iter().map(|(&addr, method)| (addr, method))
    }

    pub fn code_addresses(&self) -> Vec<usize> {
        self.method_code_map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.method_code_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.method_code_map.is_empty()
    }

    pub fn contains_method(&self, method: &Arc<Method>) -> bool {
        self.method_code_map
            .values()
            .any(|m| Arc::ptr_eq(m, method))
    }

    pub fn add_profiling(&mut self, method: Arc<Method>, info: NonNull<ProfilingInfo>) {
        self.profiling_infos.push(ProfilingEntry { method, info });
    }

    pub fn profiling_entries(&self) -> &[ProfilingEntry] {
        &self.profiling_infos
    }

    pub fn take_profiling_entries(&mut self) -> Vec<ProfilingEntry> {
        std::mem::take(&mut self.profiling_infos)
    }

    /// Remove and return the profiling entries whose method satisfies `pred`.
    pub fn extract_profiling_if(
        &mut self,
        mut pred: impl FnMut(&Arc<Method>) -> bool,
    ) -> Vec<ProfilingEntry> {
        let mut extracted = Vec::new();
        let mut kept = Vec::with_capacity(self.profiling_infos.len());
        for entry in self.profiling_infos.drain(..) {
            if pred(&entry.method) {
                extracted.push(entry);
            } else {
                kept.push(entry);
            }
        }
        self.profiling_infos = kept;
        extracted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::AllocatorId;

    fn make_method(name: &str) -> Arc<Method> {
        Arc::new(Method::new(name, AllocatorId(0), 0))
    }

    #[test]
    fn test_lower_bound_lookup() {
        let mut registry = Registry::new();
        let m1 = make_method("a");
        let m2 = make_method("b");
        registry.insert(0x1000, Arc::clone(&m1));
        registry.insert(0x2000, Arc::clone(&m2));

        let (addr, found) = registry.find_code_at_or_before(0x1800).unwrap();
        assert_eq!(addr, 0x1000);
        assert!(Arc::ptr_eq(found, &m1));

        let (addr, _) = registry.find_code_at_or_before(0x2000).unwrap();
        assert_eq!(addr, 0x2000);

        assert!(registry.find_code_at_or_before(0xFFF).is_none());
    }

    #[test]
    fn test_remove_erases_entry() {
        let mut registry = Registry::new();
        let m = make_method("a");
        registry.insert(0x1000, Arc::clone(&m));
        assert!(registry.contains_method(&m));
        assert!(registry.remove(0x1000).is_some());
        assert!(!registry.contains_method(&m));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_extract_profiling_if_partitions() {
        let mut registry = Registry::new();
        let m1 = make_method("a");
        let m2 = make_method("b");
        let mut backing = vec![0u8; ProfilingInfo::required_size(0) * 2];
        let (left, right) = backing.split_at_mut(ProfilingInfo::required_size(0));
        let i1 = unsafe { ProfilingInfo::write_new(left.as_mut_ptr(), &[]) };
        let i2 = unsafe { ProfilingInfo::write_new(right.as_mut_ptr(), &[]) };
        registry.add_profiling(Arc::clone(&m1), i1);
        registry.add_profiling(Arc::clone(&m2), i2);

        let extracted = registry.extract_profiling_if(|m| Arc::ptr_eq(m, &m1));
        assert_eq!(extracted.len(), 1);
        assert_eq!(registry.profiling_entries().len(), 1);
        assert!(Arc::ptr_eq(&registry.profiling_entries()[0].method, &m2));
    }
}

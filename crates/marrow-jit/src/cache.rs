//! The code cache façade.
//!
//! One explicitly-owned instance per runtime, handed by reference to the
//! compiler (commit side), the stack walker and deoptimizer (lookup side),
//! and the class unloader (removal side). A single lock guards the registry
//! and both arenas; `contains_pc` and the miss path of
//! `lookup_method_header` stay lock-free because every stack walk calls
//! them once per frame.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::bitmap::LiveBitmap;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::header::{from_code_to_allocation, CodeHeader, FrameInfo};
use crate::profiling::ProfilingInfo;
use crate::region::MemoryRegion;
use crate::registry::Registry;
use crate::runtime::{AllocatorId, EntryPoints, Method, ObjectRef, ThreadCheckpoint};

/// Everything the compiler hands over when committing one method.
pub struct CommitRequest<'a> {
    /// PC-to-bytecode mapping table, already placed in the data half.
    pub mapping_table: Option<NonNull<u8>>,
    /// Register-location table, already placed in the data half.
    pub vmap_table: Option<NonNull<u8>>,
    /// GC reference map, already placed in the data half.
    pub gc_map: Option<NonNull<u8>>,
    pub frame: FrameInfo,
    pub code: &'a [u8],
    pub has_should_deoptimize_flag: bool,
}

pub(crate) struct CacheState {
    pub region: MemoryRegion,
    pub registry: Registry,
    pub collection_in_progress: bool,
    pub last_update: Option<Instant>,
}

pub struct CodeCache {
    pub(crate) state: Mutex<CacheState>,
    pub(crate) collection_done: Condvar,
    pub(crate) live_bitmap: LiveBitmap,
    /// Bounds of the exec mapping, immutable after construction; the basis
    /// of the lock-free `contains_pc`.
    exec_begin: usize,
    exec_end: usize,
    pub(crate) checkpoint: Arc<dyn ThreadCheckpoint>,
    pub(crate) entry_points: EntryPoints,
}

impl CodeCache {
    pub fn new(
        config: CacheConfig,
        checkpoint: Arc<dyn ThreadCheckpoint>,
        entry_points: EntryPoints,
    ) -> Result<Self, CacheError> {
        let region = MemoryRegion::new(&config)?;
        let (exec_begin, exec_end) = region.exec_range();
        let live_bitmap = LiveBitmap::new(exec_begin, exec_end);
        tracing::debug!(
            current_capacity = region.current_capacity(),
            max_capacity = region.max_capacity(),
            "created jit code cache"
        );
        Ok(CodeCache {
            state: Mutex::new(CacheState {
                region,
                registry: Registry::new(),
                collection_in_progress: false,
                last_update: None,
            }),
            collection_done: Condvar::new(),
            live_bitmap,
            exec_begin,
            exec_end,
            checkpoint,
            entry_points,
        })
    }

    /// Whether `pc` falls inside the cache's executable mapping. Lock-free;
    /// called for every frame of every stack walk.
    #[inline]
    pub fn contains_pc(&self, pc: usize) -> bool {
        pc >= self.exec_begin && pc < self.exec_end
    }

    pub fn contains_method(&self, method: &Arc<Method>) -> bool {
        self.state.lock().registry.contains_method(method)
    }

    /// Commit compiled code for `method`. On exhaustion runs one collection
    /// pass and retries once; None after that means the method stays on the
    /// interpreter entrypoint.
    pub fn commit_code(
        &self,
        method: &Arc<Method>,
        request: &CommitRequest<'_>,
    ) -> Option<NonNull<u8>> {
        match self.commit_code_internal(method, request) {
            Some(code_ptr) => Some(code_ptr),
            None => {
                self.garbage_collect();
                self.commit_code_internal(method, request)
            }
        }
    }

    fn commit_code_internal(
        &self,
        method: &Arc<Method>,
        request: &CommitRequest<'_>,
    ) -> Option<NonNull<u8>> {
        let total_size = CodeHeader::aligned_size() + request.code.len();

        let mut state = self.state.lock();
        self.wait_for_collection_to_complete(&mut state);

        let alloc = state.region.allocate_code(total_size)?;
        let code_ptr = match state.region.commit_code(
            alloc,
            request.code,
            request.mapping_table,
            request.vmap_table,
            request.gc_map,
            request.frame,
            request.has_should_deoptimize_flag,
        ) {
            Some(code_ptr) => code_ptr,
            None => {
                // The bytes cannot be trusted; give the space back untouched.
                state.region.free_code(alloc);
                return None;
            }
        };

        state.registry.insert(code_ptr.as_ptr() as usize, Arc::clone(method));
        // We checked above that no collection is in progress; publishing the
        // entrypoint under the lock keeps the sweep from ever seeing a
        // half-registered method.
        debug_assert!(!state.collection_in_progress);
        method.set_entry_point(code_ptr.as_ptr() as usize);
        state.last_update = Some(Instant::now());

        tracing::debug!(
            method = method.name(),
            code_bytes = request.code.len(),
            code_cache_bytes = state.region.used_for_code(),
            data_cache_bytes = state.region.used_for_data(),
            "committed jit code"
        );
        Some(code_ptr)
    }

    /// Find the header of the entry containing `pc`. The not-here answer is
    /// lock-free; a hit takes the lock for the registry probe.
    pub fn lookup_method_header(
        &self,
        pc: usize,
        method_hint: Option<&Arc<Method>>,
    ) -> Option<&CodeHeader> {
        if !self.contains_pc(pc) {
            return None;
        }
        let state = self.state.lock();
        let (code_addr, method) = state.registry.find_code_at_or_before(pc)?;
        // Safety: registry entries point at live committed code; the header
        // sits immediately below the code and outlives the guard because
        // frees only happen through this same lock.
        let header = unsafe { CodeHeader::from_code_ptr(code_addr as *const u8) };
        if !header.contains(pc) {
            return None;
        }
        if let Some(hint) = method_hint {
            debug_assert!(
                Arc::ptr_eq(method, hint),
                "pc {pc:#x} resolved to {:?}, caller expected {:?}",
                method.name(),
                hint.name()
            );
        }
        Some(header)
    }

    /// Reserve `size` bytes in the data half, collecting once on exhaustion.
    pub fn reserve_data(&self, size: usize) -> Option<NonNull<u8>> {
        match self.reserve_data_internal(size) {
            Some(data) => Some(data),
            None => {
                self.garbage_collect();
                self.reserve_data_internal(size)
            }
        }
    }

    fn reserve_data_internal(&self, size: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        self.wait_for_collection_to_complete(&mut state);
        state.region.allocate_data(size)
    }

    /// Copy `bytes` into a fresh data allocation (mapping tables, gc maps).
    /// The blob lives until its owning entry is collected or cleared.
    pub fn add_data_array(&self, bytes: &[u8]) -> Option<NonNull<u8>> {
        let data = self.reserve_data(bytes.len())?;
        let mut state = self.state.lock();
        state.region.copy_into_data(data, bytes);
        Some(data)
    }

    /// Free a data allocation that will not be referenced by a commit.
    pub fn clear_data(&self, data: NonNull<u8>) {
        let mut state = self.state.lock();
        state.region.free_data(data);
    }

    /// Write a root table and stack map into reserved data space.
    pub fn commit_data(
        &self,
        reserved: NonNull<u8>,
        roots: &[ObjectRef],
        stack_map: &[u8],
    ) -> bool {
        let mut state = self.state.lock();
        state.region.commit_data(reserved, roots, stack_map)
    }

    /// Remove every entry whose method lives in `alloc` (a class-loader
    /// arena being torn down). The caller guarantees no collection runs
    /// concurrently; waiting here could deadlock against the class-linker
    /// lock it holds.
    pub fn remove_methods_in(&self, alloc: AllocatorId) {
        let mut state = self.state.lock();
        let state = &mut *state;
        let doomed: Vec<usize> = state
            .registry
            .iter_code()
            .filter(|(_, method)| method.owner() == alloc)
            .map(|(addr, _)| addr)
            .collect();
        for code_addr in doomed {
            state.registry.remove(code_addr);
            Self::free_entry(&mut state.region, code_addr);
        }
        for entry in state.registry.extract_profiling_if(|m| m.owner() == alloc) {
            entry.method.set_profiling_info(None);
            if let Some(data) = NonNull::new(entry.info.as_ptr() as *mut u8) {
                state.region.free_data(data);
            }
        }
    }

    /// Create a profiling record for `method` sized to `entries` call sites.
    /// Returns the existing record if another thread won the race. With
    /// `retry_allocation`, exhaustion triggers one collection and a retry.
    pub fn add_profiling_info(
        &self,
        method: &Arc<Method>,
        entries: &[u32],
        retry_allocation: bool,
    ) -> Option<NonNull<ProfilingInfo>> {
        match self.add_profiling_info_internal(method, entries) {
            Some(info) => Some(info),
            None if retry_allocation => {
                self.garbage_collect();
                self.add_profiling_info_internal(method, entries)
            }
            None => None,
        }
    }

    fn add_profiling_info_internal(
        &self,
        method: &Arc<Method>,
        entries: &[u32],
    ) -> Option<NonNull<ProfilingInfo>> {
        let size = ProfilingInfo::required_size(entries.len());
        let mut state = self.state.lock();
        self.wait_for_collection_to_complete(&mut state);

        if let Some(existing) = method.profiling_info() {
            return Some(existing);
        }

        let data = state.region.allocate_data(size)?;
        let write_ptr = state.region.writable_data_ptr(data);
        // Safety: `data` spans `size` writable-view bytes, pointer-aligned
        // by the data arena.
        unsafe { ProfilingInfo::write_new(write_ptr, entries) };
        // Hand out the read-view record; mutation goes back through the
        // writable alias.
        let info = data.cast::<ProfilingInfo>();
        method.set_profiling_info(Some(info));
        state.registry.add_profiling(Arc::clone(method), info);
        Some(info)
    }

    /// Record an inline-cache observation in a record returned by
    /// [`CodeCache::add_profiling_info`].
    pub fn record_class_observation(
        &self,
        info: NonNull<ProfilingInfo>,
        bytecode_pc: u32,
        klass: crate::profiling::ClassId,
    ) {
        let state = self.state.lock();
        let write_ptr =
            state.region.writable_data_ptr(info.cast()) as *mut ProfilingInfo;
        // Safety: profiling records live until a sweep frees them, and the
        // sweep takes this same lock.
        unsafe { (*write_ptr).record_observation(bytecode_pc, klass) };
    }

    pub fn code_cache_size(&self) -> usize {
        self.state.lock().region.used_for_code()
    }

    pub fn data_cache_size(&self) -> usize {
        self.state.lock().region.used_for_data()
    }

    pub fn number_of_compiled_methods(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn current_capacity(&self) -> usize {
        self.state.lock().region.current_capacity()
    }

    /// When the cache last gained an entry; profile saving uses this to skip
    /// idle periods.
    pub fn last_update_time(&self) -> Option<Instant> {
        self.state.lock().last_update
    }

    pub fn entry_points(&self) -> EntryPoints {
        self.entry_points
    }

    /// Block until no collection is in flight. Returns whether we waited.
    pub(crate) fn wait_for_collection_to_complete(
        &self,
        state: &mut MutexGuard<'_, CacheState>,
    ) -> bool {
        let mut waited = false;
        while state.collection_in_progress {
            waited = true;
            self.collection_done.wait(state);
        }
        waited
    }

    /// Free one committed entry: its metadata blobs, then the code
    /// allocation itself.
    pub(crate) fn free_entry(region: &mut MemoryRegion, code_addr: usize) {
        // Safety: callers only pass addresses still present in the registry.
        let header = unsafe { CodeHeader::from_code_ptr(code_addr as *const u8) };
        for table in [header.gc_map(), header.mapping_table(), header.vmap_table()] {
            if let Some(table) = table {
                region.free_data(table);
            }
        }
        if let Some(alloc) = NonNull::new(from_code_to_allocation(code_addr) as *mut u8) {
            region.free_code(alloc);
        }
    }
}

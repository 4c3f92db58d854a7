//! The JIT memory region: raw mappings, the W^X scheme, and the arenas.
//!
//! The region reserves one span of address space for the lifetime of the
//! cache and splits it half data, half code. Under the preferred dual-view
//! scheme the span is backed by an anonymous memory file mapped twice: an
//! executable, never-writable primary view and writable, never-executable
//! shadows at unrelated addresses. Code is written through the shadow and
//! executed through the primary, so no page is ever writable and executable
//! at once. Where the kernel cannot back dual views, a single RWX-capable
//! mapping is used instead (if the embedder permits it) and the code half is
//! toggled writable only inside a scoped write window.
//!
//! The mappings look like:
//!
//! ```text
//!       VA                  PA
//!       +---------------+
//!       | shadow code  W|\
//!       +---------------+ \
//!       | shadow data  W|\ \
//!       +---------------+ \ \
//!       :               :\ \ \
//!       +---------------+.\.\.+---------------+
//!       |  exec code  RX|  \ \|     code      |
//!       +---------------+...\.+---------------+
//!       | readonly data |    \|     data      |
//!       +---------------+.....+---------------+
//! ```
//!
//! Data precedes code in the primary span so the 32-bit back-offsets stored
//! in code headers can reach their tables.

use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::arena::Arena;
use crate::config::{CacheConfig, MB};
use crate::error::CacheError;
use crate::header::{CodeHeader, FrameInfo, CODE_ALIGNMENT};
use crate::mmap::{self, MemMap, Protection};
use crate::runtime::ObjectRef;

/// Data gets one half of the capacity, code the other.
const CAPACITY_DIVIDER: usize = 2;

/// A code-half address, valid in both the exec view and the writable view.
/// Translation is one stored offset; nothing outside the region ever sees
/// the writable alias.
#[derive(Debug, Clone, Copy)]
pub struct CodePtr {
    exec: NonNull<u8>,
    write_to_exec: isize,
}

impl CodePtr {
    pub fn exec(self) -> *const u8 {
        self.exec.as_ptr()
    }

    pub fn write(self) -> *mut u8 {
        self.exec.as_ptr().wrapping_offset(-self.write_to_exec)
    }
}

/// Writable shadows of the two halves (dual-view mode only).
struct DualViews {
    non_exec_pages: MemMap,
    writable_data_pages: MemMap,
}

struct Mapped {
    data_pages: MemMap,
    exec_pages: MemMap,
    dual: Option<DualViews>,
}

pub struct MemoryRegion {
    max_capacity: usize,
    current_capacity: usize,
    /// Primary mapping of the data half; read-only in dual-view mode.
    data_pages: MemMap,
    /// Executable mapping of the code half.
    exec_pages: MemMap,
    dual: Option<DualViews>,
    exec_arena: Arena,
    data_arena: Arena,
    /// Footprint high-water marks, fed by the arenas' growth callbacks.
    exec_end: Arc<AtomicUsize>,
    data_end: Arc<AtomicUsize>,
    /// Whether sync-core membarrier registration succeeded at startup.
    membarrier_sync_core: bool,
    zygote: bool,
}

impl MemoryRegion {
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        config.validate()?;

        // Both halves must stay page-aligned, so capacities move in pairs of
        // pages.
        let page_pair = 2 * *mmap::PAGE_SIZE;
        let max_capacity = config.max_capacity / page_pair * page_pair;
        let initial_capacity = (config.initial_capacity / page_pair * page_pair)
            .clamp(page_pair, max_capacity.max(page_pair));
        if max_capacity < page_pair {
            return Err(CacheError::InvalidCapacity {
                initial: config.initial_capacity,
                max: config.max_capacity,
            });
        }

        let data_capacity = max_capacity / CAPACITY_DIVIDER;
        let exec_capacity = max_capacity - data_capacity;

        // Zygote code is never collected, so it gets the full capacity up
        // front.
        let current_capacity = if config.zygote { max_capacity } else { initial_capacity };

        let mapped = match Self::map_dual(max_capacity, data_capacity, exec_capacity, config.zygote)
        {
            Ok(mapped) => mapped,
            Err(err) if config.allow_rwx_fallback => {
                tracing::debug!(
                    error = %err,
                    "dual-view mapping unavailable, falling back to single mapping"
                );
                Self::map_single(max_capacity, data_capacity)?
            }
            Err(err) => return Err(CacheError::DualViewUnavailable(err)),
        };

        let writable_code_base = mapped
            .dual
            .as_ref()
            .map(|d| d.non_exec_pages.begin_non_null())
            .unwrap_or_else(|| mapped.exec_pages.begin_non_null());
        let writable_data_base = mapped
            .dual
            .as_ref()
            .map(|d| d.writable_data_pages.begin_non_null())
            .unwrap_or_else(|| mapped.data_pages.begin_non_null());

        let exec_end = Arc::new(AtomicUsize::new(0));
        let data_end = Arc::new(AtomicUsize::new(0));
        let exec_grow = {
            let end = Arc::clone(&exec_end);
            Box::new(move |_old: usize, new: usize| {
                end.store(new, Ordering::Relaxed);
                true
            })
        };
        let data_grow = {
            let end = Arc::clone(&data_end);
            Box::new(move |_old: usize, new: usize| {
                end.store(new, Ordering::Relaxed);
                true
            })
        };

        let exec_arena = Arena::with_base(writable_code_base, 0, exec_grow);
        let data_arena = Arena::with_base(writable_data_base, 0, data_grow);

        let mut region = MemoryRegion {
            max_capacity,
            current_capacity,
            data_pages: mapped.data_pages,
            exec_pages: mapped.exec_pages,
            dual: mapped.dual,
            exec_arena,
            data_arena,
            exec_end,
            data_end,
            membarrier_sync_core: membarrier::register_sync_core(),
            zygote: config.zygote,
        };
        region.set_footprint_limit(current_capacity);

        tracing::debug!(
            data_bytes = region.data_pages.len(),
            exec_bytes = region.exec_pages.len(),
            dual_view = region.dual.is_some(),
            zygote = region.zygote,
            "created jit memory region"
        );
        Ok(region)
    }

    fn map_dual(
        max_capacity: usize,
        data_capacity: usize,
        exec_capacity: usize,
        zygote: bool,
    ) -> io::Result<Mapped> {
        use std::os::fd::AsRawFd;

        let mem_fd = mmap::create_memfd("marrow-jit-cache", max_capacity, zygote)?;
        let fd = mem_fd.as_raw_fd();

        // Primary span: [data | exec] carved from one reservation so offsets
        // between the halves are fixed.
        let mut data_pages =
            MemMap::map_file("data-code-cache", max_capacity, Protection::ReadOnly, fd, 0)?;
        let exec_pages = data_pages.remap_at_end(
            data_capacity,
            "jit-code-cache",
            Protection::ReadExec,
            Some((fd, data_capacity)),
        )?;

        // The writable shadows. Never executable.
        let non_exec_pages = MemMap::map_file(
            "jit-code-cache-rw",
            exec_capacity,
            Protection::ReadWrite,
            fd,
            data_capacity,
        )?;
        let writable_data_pages =
            MemMap::map_file("data-code-cache-rw", data_capacity, Protection::ReadWrite, fd, 0)?;

        // With every view in place, the zygote seals the file so no process
        // can map it writable again.
        if zygote {
            mmap::seal_memfd(&mem_fd)?;
        }

        Ok(Mapped {
            data_pages,
            exec_pages,
            dual: Some(DualViews { non_exec_pages, writable_data_pages }),
        })
    }

    fn map_single(max_capacity: usize, data_capacity: usize) -> Result<Mapped, CacheError> {
        let mut data_pages =
            MemMap::map_anonymous("data-code-cache", max_capacity, Protection::ReadWrite)
                .map_err(|source| CacheError::Map { what: "data-code-cache", source })?;
        let exec_pages = data_pages
            .remap_at_end(data_capacity, "jit-code-cache", Protection::ReadExec, None)
            .map_err(|source| CacheError::Protect { what: "jit-code-cache", source })?;
        Ok(Mapped { data_pages, exec_pages, dual: None })
    }

    pub fn exec_range(&self) -> (usize, usize) {
        (self.exec_pages.begin() as usize, self.exec_pages.end() as usize)
    }

    pub fn is_in_exec_space(&self, addr: usize) -> bool {
        self.exec_pages.contains(addr)
    }

    pub fn is_in_data_space(&self, addr: usize) -> bool {
        self.data_pages.contains(addr)
    }

    pub fn has_dual_mapping(&self) -> bool {
        self.dual.is_some()
    }

    pub fn is_zygote(&self) -> bool {
        self.zygote
    }

    pub fn current_capacity(&self) -> usize {
        self.current_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn used_for_code(&self) -> usize {
        self.exec_arena.used_bytes()
    }

    pub fn used_for_data(&self) -> usize {
        self.data_arena.used_bytes()
    }

    pub fn code_footprint(&self) -> usize {
        self.exec_end.load(Ordering::Relaxed)
    }

    pub fn data_footprint(&self) -> usize {
        self.data_end.load(Ordering::Relaxed)
    }

    fn write_to_exec_delta(&self) -> isize {
        (self.exec_pages.begin() as isize) - (self.exec_arena.base() as isize)
    }

    fn data_write_to_read_delta(&self) -> isize {
        (self.data_pages.begin() as isize) - (self.data_arena.base() as isize)
    }

    fn code_ptr(&self, exec_addr: NonNull<u8>) -> CodePtr {
        CodePtr { exec: exec_addr, write_to_exec: self.write_to_exec_delta() }
    }

    /// Allocate `size` bytes in the code half. Returns the exec-view address
    /// even though the arena's own bookkeeping is anchored on the writable
    /// view. None on exhaustion; never blocks or retries.
    pub fn allocate_code(&mut self, size: usize) -> Option<NonNull<u8>> {
        let write_ptr = self.exec_arena.alloc(size, CODE_ALIGNMENT)?;
        let delta = self.write_to_exec_delta();
        NonNull::new(write_ptr.as_ptr().wrapping_offset(delta))
    }

    /// Free a code allocation by its exec-view address.
    pub fn free_code(&mut self, alloc: NonNull<u8>) {
        let delta = self.write_to_exec_delta();
        if let Some(write_ptr) = NonNull::new(alloc.as_ptr().wrapping_offset(-delta)) {
            self.exec_arena.free(write_ptr);
        }
    }

    /// Allocate `size` bytes in the data half. Returns the read-view address.
    pub fn allocate_data(&mut self, size: usize) -> Option<NonNull<u8>> {
        let write_ptr = self.data_arena.alloc(size, mem::size_of::<usize>())?;
        let delta = self.data_write_to_read_delta();
        NonNull::new(write_ptr.as_ptr().wrapping_offset(delta))
    }

    /// Free a data allocation by its read-view address.
    pub fn free_data(&mut self, data: NonNull<u8>) {
        let delta = self.data_write_to_read_delta();
        if let Some(write_ptr) = NonNull::new(data.as_ptr().wrapping_offset(-delta)) {
            self.data_arena.free(write_ptr);
        }
    }

    pub(crate) fn writable_data_ptr(&self, data: NonNull<u8>) -> *mut u8 {
        data.as_ptr().wrapping_offset(-self.data_write_to_read_delta())
    }

    /// Copy raw bytes into a data allocation through the writable view.
    pub fn copy_into_data(&mut self, data: NonNull<u8>, bytes: &[u8]) {
        let dst = self.writable_data_ptr(data);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
    }

    /// Write code and its header into an allocation returned by
    /// [`MemoryRegion::allocate_code`], flush caches, and synchronize
    /// instruction pipelines across cores. Returns the exec-view code
    /// address. None when a flush step fails, in which case the caller must
    /// abandon the allocation.
    #[allow(clippy::too_many_arguments)]
    pub fn commit_code(
        &mut self,
        alloc: NonNull<u8>,
        code: &[u8],
        mapping_table: Option<NonNull<u8>>,
        vmap_table: Option<NonNull<u8>>,
        gc_map: Option<NonNull<u8>>,
        frame: FrameInfo,
        has_should_deoptimize_flag: bool,
    ) -> Option<NonNull<u8>> {
        debug_assert!(self.is_in_exec_space(alloc.as_ptr() as usize));
        debug_assert!(code.len() < (1 << 31));
        let header_size = CodeHeader::aligned_size();
        let total_size = header_size + code.len();

        let code_alloc = self.code_ptr(alloc);
        let exec_code_ptr = code_alloc.exec().wrapping_add(header_size);
        {
            let _write_window = ScopedCodeCacheWrite::open(self)?;
            unsafe {
                let write_base = code_alloc.write();
                let code_dst = write_base.add(header_size);
                ptr::copy_nonoverlapping(code.as_ptr(), code_dst, code.len());
                let header = CodeHeader::new(
                    self.table_offset(exec_code_ptr, mapping_table),
                    self.table_offset(exec_code_ptr, vmap_table),
                    self.table_offset(exec_code_ptr, gc_map),
                    frame,
                    code.len() as u32,
                    has_should_deoptimize_flag,
                );
                (code_dst.sub(mem::size_of::<CodeHeader>()) as *mut CodeHeader).write(header);
            }
        }

        // Flush the d-cache for the writable alias so the dirty lines reach
        // the point of unification, then invalidate the i-cache for the exec
        // view. Recycled cache memory may otherwise serve stale code.
        let mut flushed = true;
        if self.dual.is_some() {
            flushed = flush_cpu_caches(code_alloc.write() as *const u8, total_size);
        }
        if flushed {
            flushed = flush_cpu_caches(code_alloc.exec(), total_size);
        }
        if !flushed {
            tracing::error!("cache flush failed, abandoning committed code");
            return None;
        }

        // An i-cache flush does not drain instruction pipelines on other
        // cores; sync-core membarrier does, on kernels that have it.
        if !self.pipeline_sync() {
            tracing::error!("pipeline synchronization failed, abandoning committed code");
            return None;
        }

        NonNull::new(exec_code_ptr as *mut u8)
    }

    fn table_offset(&self, code_ptr: *const u8, table: Option<NonNull<u8>>) -> u32 {
        match table {
            Some(table) => {
                debug_assert!(self.is_in_data_space(table.as_ptr() as usize));
                (code_ptr as usize - table.as_ptr() as usize) as u32
            }
            None => 0,
        }
    }

    /// Write a root table (count-prefixed object references) followed by the
    /// raw stack map into a reserved data allocation. False when the flush
    /// fails.
    pub fn commit_data(
        &mut self,
        reserved: NonNull<u8>,
        roots: &[ObjectRef],
        stack_map: &[u8],
    ) -> bool {
        let table_size = root_table_size(roots.len());
        let total = table_size + stack_map.len();
        let write_ptr = self.writable_data_ptr(reserved);
        unsafe {
            let counts = write_ptr as *mut u32;
            counts.write_unaligned(roots.len() as u32);
            for (i, root) in roots.iter().enumerate() {
                counts.add(1 + i).write_unaligned(root.0);
            }
            ptr::copy_nonoverlapping(stack_map.as_ptr(), write_ptr.add(table_size), stack_map.len());
        }
        flush_cpu_caches(write_ptr as *const u8, total)
    }

    /// Grow toward `max_capacity`: double below 1 MiB, else add 1 MiB.
    /// False once the ceiling is reached.
    pub fn increase_capacity(&mut self) -> bool {
        if self.current_capacity == self.max_capacity {
            return false;
        }
        if self.current_capacity < MB {
            self.current_capacity *= 2;
        } else {
            self.current_capacity += MB;
        }
        if self.current_capacity > self.max_capacity {
            self.current_capacity = self.max_capacity;
        }
        tracing::debug!(capacity = self.current_capacity, "increased code cache capacity");
        self.set_footprint_limit(self.current_capacity);
        true
    }

    fn set_footprint_limit(&mut self, new_footprint: usize) {
        let data_footprint = new_footprint / CAPACITY_DIVIDER;
        self.data_arena.set_footprint_limit(data_footprint);
        self.exec_arena.set_footprint_limit(new_footprint - data_footprint);
    }

    fn pipeline_sync(&self) -> bool {
        if !self.membarrier_sync_core {
            // Kernels without sync-core registration (pre-4.16): proceed,
            // the mprotect/TLB traffic on these systems serves as the
            // cross-core serialization point.
            return true;
        }
        membarrier::private_expedited_sync_core()
    }
}

/// Opens a transient write window over the exec half in single-view mode.
/// Dual-view writes go through the shadow mapping and need no window.
struct ScopedCodeCacheWrite {
    begin: *mut u8,
    len: usize,
    active: bool,
}

impl ScopedCodeCacheWrite {
    fn open(region: &MemoryRegion) -> Option<Self> {
        if region.dual.is_some() {
            return Some(ScopedCodeCacheWrite { begin: ptr::null_mut(), len: 0, active: false });
        }
        region.exec_pages.protect(Protection::ReadWriteExec).ok()?;
        Some(ScopedCodeCacheWrite {
            begin: region.exec_pages.begin(),
            len: region.exec_pages.len(),
            active: true,
        })
    }
}

impl Drop for ScopedCodeCacheWrite {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let rc = unsafe {
            libc::mprotect(
                self.begin as *mut libc::c_void,
                self.len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            // Failing to drop write permission would leave W+X pages; there
            // is no way to continue from that.
            tracing::error!("failed to re-protect jit code pages");
            std::process::abort();
        }
    }
}

pub fn root_table_size(roots: usize) -> usize {
    (1 + roots) * mem::size_of::<u32>()
}

/// Flush CPU caches over `[start, start + len)` so the exec view observes
/// freshly written bytes. x86 keeps instruction caches coherent, so ordering
/// the stores suffices; aarch64 needs the d-cache cleaned and the i-cache
/// invalidated.
fn flush_cpu_caches(start: *const u8, len: usize) -> bool {
    #[cfg(target_arch = "aarch64")]
    {
        extern "C" {
            fn __clear_cache(start: *mut core::ffi::c_char, end: *mut core::ffi::c_char);
        }
        unsafe {
            __clear_cache(start as *mut _, start.add(len) as *mut _);
        }
        true
    }
    #[cfg(not(target_arch = "aarch64"))]
    {
        let _ = (start, len);
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
        true
    }
}

mod membarrier {
    //! sync-core membarrier: after code bytes change, cores may still hold
    //! the old instructions in their pipelines; this forces every core
    //! through a serializing event.

    #[cfg(target_os = "linux")]
    mod imp {
        const MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_long = 1 << 5;
        const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE: libc::c_long = 1 << 6;

        pub fn register_sync_core() -> bool {
            unsafe {
                libc::syscall(
                    libc::SYS_membarrier,
                    MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_SYNC_CORE,
                    0,
                ) == 0
            }
        }

        pub fn private_expedited_sync_core() -> bool {
            unsafe {
                libc::syscall(libc::SYS_membarrier, MEMBARRIER_CMD_PRIVATE_EXPEDITED_SYNC_CORE, 0)
                    == 0
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    mod imp {
        pub fn register_sync_core() -> bool {
            false
        }

        pub fn private_expedited_sync_core() -> bool {
            true
        }
    }

    pub use imp::{private_expedited_sync_core, register_sync_core};
}

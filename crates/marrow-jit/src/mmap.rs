//! Raw OS memory mappings.
//!
//! Thin RAII wrappers over `mmap`/`mprotect`/`munmap`, plus the anonymous
//! memory-file plumbing (`memfd_create`) that lets the region map the same
//! physical pages at two virtual addresses with different protections.

use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::ptr::NonNull;

use once_cell::sync::Lazy;

/// System page size, queried once per process.
pub static PAGE_SIZE: Lazy<usize> =
    Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

pub fn round_up_to_page(size: usize) -> usize {
    let page = *PAGE_SIZE;
    (size + page - 1) & !(page - 1)
}

pub fn round_down_to_page(size: usize) -> usize {
    size & !(*PAGE_SIZE - 1)
}

/// Page protection of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
    ReadExec,
    ReadWriteExec,
}

impl Protection {
    fn as_raw(self) -> libc::c_int {
        match self {
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
            Protection::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }
}

/// An owned `mmap` region, unmapped on drop.
///
/// The `name` is carried for diagnostics only; POSIX has no equivalent of
/// named anonymous mappings outside Linux-specific tricks.
pub struct MemMap {
    ptr: NonNull<u8>,
    len: usize,
    name: &'static str,
}

// Safety: MemMap owns its range exclusively; all mutation of the underlying
// pages goes through &self raw-pointer writes that the callers serialize.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    /// Map `len` bytes of private anonymous memory.
    pub fn map_anonymous(name: &'static str, len: usize, prot: Protection) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot.as_raw(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        Self::from_raw(ptr, len, name)
    }

    /// Map `len` bytes of `fd` starting at `offset`, shared, at a
    /// kernel-chosen address.
    pub fn map_file(
        name: &'static str,
        len: usize,
        prot: Protection,
        fd: RawFd,
        offset: usize,
    ) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot.as_raw(),
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        Self::from_raw(ptr, len, name)
    }

    fn from_raw(ptr: *mut libc::c_void, len: usize, name: &'static str) -> io::Result<Self> {
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // mmap never returns null on success.
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(io::Error::last_os_error)?;
        Ok(MemMap { ptr, len, name })
    }

    /// Carve the tail of this mapping off into its own mapping.
    ///
    /// `self` keeps `[begin, begin + divider)`. When `fd` is given, the tail
    /// is remapped shared from it at `fd_offset` (the dual-view case);
    /// otherwise the tail just gets its protection changed in place.
    pub fn remap_at_end(
        &mut self,
        divider: usize,
        name: &'static str,
        prot: Protection,
        fd: Option<(RawFd, usize)>,
    ) -> io::Result<MemMap> {
        debug_assert!(divider <= self.len);
        debug_assert_eq!(divider % *PAGE_SIZE, 0);
        let tail_ptr = unsafe { self.ptr.as_ptr().add(divider) };
        let tail_len = self.len - divider;
        match fd {
            Some((fd, fd_offset)) => {
                let remapped = unsafe {
                    libc::mmap(
                        tail_ptr as *mut libc::c_void,
                        tail_len,
                        prot.as_raw(),
                        libc::MAP_SHARED | libc::MAP_FIXED,
                        fd,
                        fd_offset as libc::off_t,
                    )
                };
                if remapped == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                debug_assert_eq!(remapped as *mut u8, tail_ptr);
            }
            None => {
                let rc = unsafe {
                    libc::mprotect(tail_ptr as *mut libc::c_void, tail_len, prot.as_raw())
                };
                if rc != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        self.len = divider;
        Ok(MemMap {
            // Tail of a successful mapping, never null.
            ptr: unsafe { NonNull::new_unchecked(tail_ptr) },
            len: tail_len,
            name,
        })
    }

    /// Change the protection of the whole mapping.
    pub fn protect(&self, prot: Protection) -> io::Result<()> {
        let rc = unsafe {
            libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.len, prot.as_raw())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn begin(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn begin_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn end(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        let begin = self.ptr.as_ptr() as usize;
        addr >= begin && addr < begin + self.len
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Create the anonymous memory file backing the dual views, sized to `len`.
///
/// `allow_sealing` is required for the zygote hand-off, where the file is
/// later sealed against any future write mapping.
#[cfg(target_os = "linux")]
pub fn create_memfd(name: &str, len: usize, allow_sealing: bool) -> io::Result<OwnedFd> {
    use std::os::fd::{AsRawFd, FromRawFd};

    let c_name = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "memfd name contains NUL"))?;
    let flags = if allow_sealing { libc::MFD_ALLOW_SEALING } else { 0 };
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Dual views need a kernel with `memfd_create`; elsewhere the region falls
/// back to the single RWX-toggled mapping (when the embedder permits it).
#[cfg(not(target_os = "linux"))]
pub fn create_memfd(_name: &str, _len: usize, _allow_sealing: bool) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "memfd_create unavailable on this platform",
    ))
}

/// Seal the memory file against shrinking, growing, and any future write
/// mapping. The already-created writable views stay usable.
#[cfg(target_os = "linux")]
pub fn seal_memfd(fd: &OwnedFd) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let seals =
        libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_SEAL | libc::F_SEAL_FUTURE_WRITE;
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn seal_memfd(_fd: &OwnedFd) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(target_os = "linux")]
    use std::os::fd::AsRawFd;

    #[test]
    fn test_anonymous_map_read_write() {
        let map = MemMap::map_anonymous("test-map", *PAGE_SIZE, Protection::ReadWrite).unwrap();
        assert_eq!(map.len(), *PAGE_SIZE);
        unsafe {
            map.begin().write(0xAB);
            assert_eq!(map.begin().read(), 0xAB);
        }
        assert!(map.contains(map.begin() as usize));
        assert!(!map.contains(map.end() as usize));
    }

    #[test]
    fn test_remap_at_end_splits_length() {
        let len = 4 * *PAGE_SIZE;
        let mut head = MemMap::map_anonymous("test-head", len, Protection::ReadWrite).unwrap();
        let tail = head
            .remap_at_end(2 * *PAGE_SIZE, "test-tail", Protection::ReadOnly, None)
            .unwrap();
        assert_eq!(head.len(), 2 * *PAGE_SIZE);
        assert_eq!(tail.len(), 2 * *PAGE_SIZE);
        assert_eq!(head.end(), tail.begin());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dual_views_alias_same_pages() {
        let len = 2 * *PAGE_SIZE;
        let fd = create_memfd("test-dual", len, false).unwrap();
        let read_view =
            MemMap::map_file("test-r", len, Protection::ReadOnly, fd.as_raw_fd(), 0).unwrap();
        let write_view =
            MemMap::map_file("test-rw", len, Protection::ReadWrite, fd.as_raw_fd(), 0).unwrap();
        unsafe {
            write_view.begin().add(17).write(0x5C);
            assert_eq!(read_view.begin().add(17).read(), 0x5C);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sealed_memfd_rejects_new_write_mapping() {
        let len = *PAGE_SIZE;
        let fd = create_memfd("test-seal", len, true).unwrap();
        let _rw = MemMap::map_file("pre-seal-rw", len, Protection::ReadWrite, fd.as_raw_fd(), 0)
            .unwrap();
        seal_memfd(&fd).unwrap();
        assert!(
            MemMap::map_file("post-seal-rw", len, Protection::ReadWrite, fd.as_raw_fd(), 0)
                .is_err()
        );
    }

    #[test]
    fn test_page_rounding() {
        let page = *PAGE_SIZE;
        assert_eq!(round_up_to_page(1), page);
        assert_eq!(round_up_to_page(page), page);
        assert_eq!(round_down_to_page(page + 1), page);
    }
}

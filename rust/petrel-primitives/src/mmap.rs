//! File-backed memory-mapped regions for cross-process shared memory.
//!
//! `MmapRegion` maps a file with `MAP_SHARED` so the driver and its clients
//! observe the same bytes. Unlike a transient IPC segment, driver files are
//! deliberately left on disk when the mapping is dropped: the CnC file and
//! loss report are post-mortem artifacts, and reclaiming a directory is the
//! arbiter's job, not the mapping's.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::Region;

/// File-backed memory-mapped region for cross-process shared memory.
pub struct MmapRegion {
    /// Pointer to the mapped memory
    ptr: *mut u8,
    /// Length of the mapping in bytes
    len: usize,
    /// The underlying file (kept open to maintain the mapping)
    #[allow(dead_code)]
    file: File,
    /// Path to the file
    path: PathBuf,
}

impl MmapRegion {
    /// Create a new file-backed region.
    ///
    /// The file is created (truncating any existing content), sized, and
    /// mapped read/write with `MAP_SHARED`. Permissions are 0600. A freshly
    /// sized file reads as zeroes. With `sparse` set the blocks are left
    /// unallocated; otherwise they are preallocated up front so the hot path
    /// never takes a page-allocation stall.
    pub fn create(path: &Path, size: usize, sparse: bool) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "size must be > 0",
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        if !sparse {
            preallocate(&file, size)?;
        }

        let ptr = map_shared(&file, size)?;

        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
        })
    }

    /// Attach to an existing file-backed region.
    ///
    /// Opens the file read/write and maps it; the file size determines the
    /// mapping size.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let metadata = file.metadata()?;
        let size = metadata.len() as usize;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "mapped file is empty",
            ));
        }

        let ptr = map_shared(&file, size)?;

        Ok(Self {
            ptr,
            len: size,
            file,
            path: path.to_path_buf(),
        })
    }

    /// Get a `Region` view of this mmap.
    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: The mmap is valid for the lifetime of MmapRegion
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    /// Get the size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the region is empty (zero bytes).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the path to the backing file.
    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map_shared(file: &File, size: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }

    Ok(ptr as *mut u8)
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: usize) -> io::Result<()> {
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn preallocate(_file: &File, _size: usize) -> io::Result<()> {
    // No portable preallocation; the lazy-zero mapping is still correct.
    Ok(())
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // Unmap only; the file stays behind for post-mortem inspection.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: The mmap region is valid for the lifetime of MmapRegion and can be
// safely accessed from multiple threads (the underlying memory is shared).
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

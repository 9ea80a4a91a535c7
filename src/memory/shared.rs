//! memfd-backed segments.
//!
//! Objects in the store's CPU arena live in these, so a process that
//! receives the fd maps the very pages the producer wrote.

use super::{IpcHandle, MemorySegment, MemoryType};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr::NonNull;

/// A read-write shared mapping of an anonymous memfd.
///
/// The kernel frees the pages once every mapping and fd is gone.
///
/// # Example
///
/// ```rust
/// use shmtensor::memory::{MemorySegment, SharedMemorySegment};
///
/// let producer = SharedMemorySegment::new("payload", 4096)?;
/// let handle = producer.ipc_handle().expect("memfd segments are shareable");
/// let consumer = unsafe { SharedMemorySegment::from_ipc(handle)? };
/// assert_eq!(consumer.len(), 4096);
/// # Ok::<(), shmtensor::Error>(())
/// ```
pub struct SharedMemorySegment {
    fd: OwnedFd,
    ptr: NonNull<u8>,
    len: usize,
    label: Option<String>,
}

impl SharedMemorySegment {
    /// Create and map a memfd of `size` bytes, labelled `label` in
    /// `/proc/<pid>/fd`.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] for a zero size or a label containing NUL,
    /// [`Error::System`] if `memfd_create`, `ftruncate` or `mmap` fails.
    pub fn new(label: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Allocation("memfd segments cannot be empty".into()));
        }
        let cname = CString::new(label).map_err(|e| Error::Allocation(format!("memfd label: {e}")))?;
        let fd = rustix::fs::memfd_create(&cname, MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        let ptr = map_shared(&fd, size)?;
        Ok(Self {
            fd,
            ptr,
            len: size,
            label: Some(label.to_string()),
        })
    }

    /// Map a memfd this process already owns.
    ///
    /// # Safety
    ///
    /// `fd` must be a memfd at least `size` bytes long.
    pub unsafe fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::Allocation("memfd segments cannot be empty".into()));
        }
        let ptr = map_shared(&fd, size)?;
        Ok(Self {
            fd,
            ptr,
            len: size,
            label: None,
        })
    }

    /// Map the segment behind `handle`. The fd is duplicated, so the handle's
    /// owner keeps its own.
    ///
    /// # Safety
    ///
    /// `handle.fd` must be an open memfd at least `handle.size` bytes long.
    pub unsafe fn from_ipc(handle: IpcHandle) -> Result<Self> {
        // SAFETY: caller guarantees the fd is open.
        let borrowed = unsafe { BorrowedFd::borrow_raw(handle.fd) };
        let fd = rustix::io::fcntl_dupfd_cloexec(borrowed, 0)?;
        // SAFETY: same memfd, same size.
        unsafe { Self::from_fd(fd, handle.size) }
    }

    /// The memfd.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Label given at creation; `None` for mappings of received fds.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    // SAFETY: a new mapping; nothing in Rust aliases it yet.
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::Allocation("mmap returned null".into()))
}

impl MemorySegment for SharedMemorySegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::SharedMemory
    }

    fn ipc_handle(&self) -> Option<IpcHandle> {
        Some(IpcHandle {
            fd: self.fd.as_raw_fd(),
            size: self.len,
        })
    }
}

impl Drop for SharedMemorySegment {
    fn drop(&mut self) {
        // SAFETY: exactly the range mapped in `map_shared`.
        if let Err(e) = unsafe { rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len) } {
            tracing::warn!(error = %e, len = self.len, "munmap failed");
        }
    }
}

// SAFETY: a process-wide mapping plus a kernel-refcounted fd.
unsafe impl Send for SharedMemorySegment {}
unsafe impl Sync for SharedMemorySegment {}

impl AsFd for SharedMemorySegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl std::fmt::Debug for SharedMemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemorySegment")
            .field("fd", &self.as_raw_fd())
            .field("len", &self.len)
            .field("label", &self.label)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_labelled_segment() {
        let segment = SharedMemorySegment::new("tensor-object", 4096).unwrap();
        assert_eq!(segment.len(), 4096);
        assert_eq!(segment.memory_type(), MemoryType::SharedMemory);
        assert_eq!(segment.label(), Some("tensor-object"));
        assert!(segment.ipc_handle().is_some());
    }

    #[test]
    fn test_empty_segment_rejected() {
        assert!(matches!(SharedMemorySegment::new("empty", 0), Err(Error::Allocation(_))));
    }

    #[test]
    fn test_second_mapping_shares_pages() {
        let producer = SharedMemorySegment::new("pages", 4096).unwrap();
        let consumer = unsafe { SharedMemorySegment::from_ipc(producer.ipc_handle().unwrap()).unwrap() };
        assert_ne!(producer.as_raw_fd(), consumer.as_raw_fd());
        assert_eq!(consumer.label(), None);

        unsafe {
            producer.as_mut_ptr().unwrap().write(77);
            assert_eq!(consumer.as_ptr().read(), 77);
            consumer.as_mut_ptr().unwrap().add(100).write(88);
            assert_eq!(producer.as_ptr().add(100).read(), 88);
        }
    }
}

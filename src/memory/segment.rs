//! The `MemorySegment` abstraction shared by host, memfd and device memory.

/// Where a segment's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryType {
    /// Process-private host memory.
    Cpu,
    /// memfd-backed host memory that other processes can map.
    SharedMemory,
    /// Device memory. Reach its bytes through a
    /// [`DeviceApi`](crate::device::DeviceApi) copy, never by dereferencing.
    GpuDevice,
}

/// File descriptor and length of a mappable segment.
///
/// Pass the fd to another process (e.g. with `SCM_RIGHTS`) and map it there
/// with [`SharedMemorySegment::from_ipc`](super::SharedMemorySegment::from_ipc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHandle {
    /// Raw memfd.
    pub fd: std::os::unix::io::RawFd,
    /// Mapped length in bytes.
    pub size: usize,
}

/// A contiguous, fixed-size region backing a tensor or a store object.
///
/// Pointers returned by a segment stay valid until the segment is dropped.
/// For [`MemoryType::GpuDevice`] segments they are device addresses.
pub trait MemorySegment: Send + Sync {
    /// Base address.
    fn as_ptr(&self) -> *const u8;

    /// Writable base address, `None` for read-only segments.
    fn as_mut_ptr(&self) -> Option<*mut u8>;

    /// Length in bytes.
    fn len(&self) -> usize;

    /// True for zero-length segments.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing memory kind.
    fn memory_type(&self) -> MemoryType;

    /// Mapping handle for other processes, if the segment can be shared.
    fn ipc_handle(&self) -> Option<IpcHandle> {
        None
    }

    /// View the bytes.
    ///
    /// # Safety
    ///
    /// The memory must be host accessible and nobody may write to it while
    /// the slice is alive.
    unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: caller contract.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }
}

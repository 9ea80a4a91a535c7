//! Heap-backed memory segment.

use super::{MemorySegment, MemoryType};
use crate::error::{Error, Result};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Default alignment for tensor payloads, matching common SIMD widths.
pub const DEFAULT_ALIGNMENT: usize = 64;

/// A memory segment backed by an aligned, zeroed heap allocation.
///
/// This is the host allocation behind [`TensorHandle::empty`] on the CPU.
/// It does not support cross-process sharing.
///
/// # Example
///
/// ```rust
/// use shmtensor::memory::{HeapSegment, MemorySegment};
///
/// let segment = HeapSegment::new(1024).unwrap();
/// assert_eq!(segment.len(), 1024);
/// ```
///
/// [`TensorHandle::empty`]: crate::tensor::TensorHandle::empty
pub struct HeapSegment {
    ptr: NonNull<u8>,
    layout: Layout,
    memory_type: MemoryType,
}

impl HeapSegment {
    /// Create a new heap segment with the given size and [`DEFAULT_ALIGNMENT`].
    ///
    /// A zero-sized segment is valid and holds no allocation.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator fails.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_alignment(size, DEFAULT_ALIGNMENT)
    }

    /// Create a new heap segment with specific alignment.
    ///
    /// # Arguments
    ///
    /// * `size` - Size in bytes.
    /// * `align` - Required alignment (must be a power of 2).
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails or alignment is invalid.
    pub fn with_alignment(size: usize, align: usize) -> Result<Self> {
        Self::tagged(size, align, MemoryType::Cpu)
    }

    /// Allocate host memory that reports a different memory type.
    ///
    /// Used by simulated device backends whose "device memory" lives on the host.
    pub(crate) fn tagged(size: usize, align: usize, memory_type: MemoryType) -> Result<Self> {
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::Allocation(format!("invalid layout ({size}, {align}): {e}")))?;

        let ptr = if size == 0 {
            // Dangling but well-aligned; never dereferenced.
            NonNull::new(std::ptr::without_provenance_mut::<u8>(align))
                .ok_or_else(|| Error::Allocation("alignment must be non-zero".into()))?
        } else {
            // SAFETY: layout has non-zero size.
            let raw = unsafe { alloc::alloc_zeroed(layout) };
            NonNull::new(raw)
                .ok_or_else(|| Error::Allocation(format!("allocator refused {size} bytes")))?
        };

        Ok(Self {
            ptr,
            layout,
            memory_type,
        })
    }

    /// Alignment of the allocation.
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }
}

impl MemorySegment for HeapSegment {
    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        // We have exclusive ownership, so we can provide mutable access.
        Some(self.ptr.as_ptr())
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn memory_type(&self) -> MemoryType {
        self.memory_type
    }
}

impl Drop for HeapSegment {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: allocated in `tagged` with this exact layout.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

// SAFETY: the allocation is uniquely owned by the segment and carries no
// thread-local state; synchronisation of the bytes is the caller's concern.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}

//! Reference-counted tensor handle.
//!
//! A [`TensorHandle`] points at a heap-allocated container that embeds the
//! tensor's descriptor and whatever keeps its memory alive. Cloning a handle
//! bumps an atomic counter; dropping the last handle runs the container's
//! cleanup exactly once.

use super::descriptor::{Deleter, ManagedTensor, TensorDescriptor};
use super::layout::{self, Dims};
use super::{DataType, Device, Element};
use crate::device::{DeviceRegistry, Stream};
use crate::error::{Error, Result};
use crate::observability::trace_deleter_failure;
use crate::memory::{DEFAULT_ALIGNMENT, MemorySegment};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// What keeps a container's memory alive.
enum Owner {
    /// Memory allocated by a device backend.
    Allocation(Arc<dyn MemorySegment>),
    /// Memory owned by a foreign deleter, fired when the container dies.
    Managed(Option<Deleter>),
    /// A view: holds a reference on the container it was carved from.
    View(TensorHandle),
}

/// Shared state behind every clone of a [`TensorHandle`].
struct Container {
    desc: TensorDescriptor,
    /// Number of live handles. Zero only before the first handle attaches.
    ref_counter: AtomicUsize,
    owner: Owner,
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Owner::Managed(deleter) = &mut self.owner {
            if let Some(deleter) = deleter.take() {
                let object = deleter.object_id();
                if let Err(e) = deleter.fire() {
                    trace_deleter_failure(object, &e);
                }
            }
        }
    }
}

/// Reference-counted handle to a tensor.
///
/// Clones share the same container and therefore the same bytes: a write
/// through one handle's memory is visible through every clone. Equality is
/// identity ([`same_as`](Self::same_as)), not content.
///
/// # Example
///
/// ```rust
/// use shmtensor::device::DeviceRegistry;
/// use shmtensor::tensor::{Device, TensorHandle};
///
/// let registry = DeviceRegistry::new();
/// let t = TensorHandle::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], Device::CPU, &registry)?;
/// let u = t.clone();
/// assert_eq!(t.use_count(), 2);
/// assert!(t.same_as(&u));
/// assert_eq!(u.to_vec::<f32>(&registry)?, vec![1.0, 2.0, 3.0, 4.0]);
/// # Ok::<(), shmtensor::Error>(())
/// ```
pub struct TensorHandle {
    container: NonNull<Container>,
}

// SAFETY: the container is shared only through atomic reference counting and
// its owner is touched exclusively by the final drop.
unsafe impl Send for TensorHandle {}
unsafe impl Sync for TensorHandle {}

impl TensorHandle {
    fn attach(container: Container) -> Self {
        let container = NonNull::from(Box::leak(Box::new(container)));
        // SAFETY: freshly leaked, nobody else can see it.
        unsafe { container.as_ref() }
            .ref_counter
            .fetch_add(1, Ordering::Relaxed);
        Self { container }
    }

    #[inline]
    fn inner(&self) -> &Container {
        // SAFETY: the container lives as long as any handle does.
        unsafe { self.container.as_ref() }
    }

    /// Allocate an uninitialised (zeroed on the bundled backends) tensor on
    /// `device`.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] if the size overflows,
    /// [`Error::UnsupportedDevice`] if no backend serves `device`, or the
    /// backend's allocation error.
    pub fn empty(shape: &[i64], dtype: DataType, device: Device, registry: &DeviceRegistry) -> Result<Self> {
        let nbytes = layout::byte_size(shape, dtype)?;
        let segment = registry.alloc(device, nbytes, DEFAULT_ALIGNMENT)?;
        let data = segment
            .as_mut_ptr()
            .ok_or_else(|| Error::Allocation(format!("{device} returned read-only memory")))?;
        Ok(Self::attach(Container {
            desc: TensorDescriptor::new(data, device, dtype, shape),
            ref_counter: AtomicUsize::new(0),
            owner: Owner::Allocation(segment),
        }))
    }

    /// Take ownership of a foreign tensor without copying.
    ///
    /// The tensor's deleter fires when the last handle is dropped.
    pub fn from_managed(tensor: ManagedTensor) -> Self {
        let (desc, deleter) = tensor.into_parts();
        Self::attach(Container {
            desc,
            ref_counter: AtomicUsize::new(0),
            owner: Owner::Managed(Some(deleter)),
        })
    }

    /// Allocate on `device` and fill from a host slice.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `data.len()` differs from the element count
    /// of `shape`, plus any error of [`empty`](Self::empty).
    pub fn from_slice<T: Element>(data: &[T], shape: &[i64], device: Device, registry: &DeviceRegistry) -> Result<Self> {
        let handle = Self::empty(shape, T::DTYPE, device, registry)?;
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let expected = handle.byte_size()?;
        if bytes.len() != expected {
            return Err(Error::ShapeMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        // SAFETY: `handle` was just allocated with `expected` bytes and
        // `bytes` is a live host slice of the same length.
        unsafe {
            registry.copy_bytes(handle.data_ptr(), bytes.as_ptr(), expected, Device::CPU, device, None)?;
        }
        Ok(handle)
    }

    /// Copy the elements into a host vector.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMetadata`] if `T` does not match the dtype,
    /// [`Error::NonContiguousInput`] for strided tensors, or a copy error.
    pub fn to_vec<T: Element>(&self, registry: &DeviceRegistry) -> Result<Vec<T>> {
        if self.dtype() != T::DTYPE {
            return Err(Error::InvalidMetadata(format!(
                "tensor holds {}, requested {}",
                self.dtype(),
                T::DTYPE
            )));
        }
        self.inner().desc.ensure_contiguous()?;
        let mut out = vec![T::zeroed(); self.num_elements()?];
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut out);
        // SAFETY: the container keeps the source alive and `out` has exactly
        // byte_size bytes.
        unsafe {
            registry.copy_bytes(bytes.as_mut_ptr(), self.data_ptr(), bytes.len(), self.device(), Device::CPU, None)?;
        }
        Ok(out)
    }

    /// Copy bytes from another handle into this one.
    ///
    /// Synchronous unless both sides are off-host and `stream` is a
    /// non-default stream; then the destination is valid only after
    /// [`DeviceRegistry::synchronize`].
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if byte sizes differ,
    /// [`Error::NonContiguousInput`] for strided operands, or a copy error.
    pub fn copy_from(&self, src: &TensorHandle, registry: &DeviceRegistry, stream: Option<Stream>) -> Result<()> {
        // SAFETY: `src` keeps its memory alive for the duration of the call.
        unsafe { self.copy_from_descriptor(src.descriptor(), registry, stream) }
    }

    /// Copy bytes from a raw descriptor into this handle.
    ///
    /// # Safety
    ///
    /// `src.data` must be valid for `src.byte_offset + byte_size` bytes on
    /// `src.device` until the copy completes.
    ///
    /// # Errors
    ///
    /// Same as [`copy_from`](Self::copy_from).
    pub unsafe fn copy_from_descriptor(
        &self,
        src: &TensorDescriptor,
        registry: &DeviceRegistry,
        stream: Option<Stream>,
    ) -> Result<()> {
        let dst = &self.inner().desc;
        dst.ensure_contiguous()?;
        src.ensure_contiguous()?;
        let expected = dst.byte_size()?;
        let actual = src.byte_size()?;
        if expected != actual {
            return Err(Error::ShapeMismatch { expected, actual });
        }
        // SAFETY: destination owned by this container, source per caller.
        unsafe { registry.copy_bytes(dst.data_ptr(), src.data_ptr(), expected, src.device, dst.device, stream) }
    }

    /// Copy this handle's bytes into `dst`.
    pub fn copy_to(&self, dst: &TensorHandle, registry: &DeviceRegistry, stream: Option<Stream>) -> Result<()> {
        dst.copy_from(self, registry, stream)
    }

    /// Synchronous copy onto another device.
    pub fn to_device(&self, device: Device, registry: &DeviceRegistry) -> Result<TensorHandle> {
        let out = Self::empty(self.shape(), self.dtype(), device, registry)?;
        out.copy_from(self, registry, None)?;
        Ok(out)
    }

    /// Synchronous copy on the same device.
    pub fn deep_clone(&self, registry: &DeviceRegistry) -> Result<TensorHandle> {
        self.to_device(self.device(), registry)
    }

    /// A new handle over the same memory with a different shape, dtype and
    /// byte offset.
    ///
    /// The view holds a reference on this handle's container. On failure the
    /// reference count is unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfBounds`] if `offset` plus the view's byte size runs past
    /// the end of the original allocation, [`Error::NonContiguousInput`] if this tensor
    /// is strided.
    pub fn create_view(&self, shape: &[i64], dtype: DataType, offset: usize) -> Result<TensorHandle> {
        let desc = &self.inner().desc;
        desc.ensure_contiguous()?;
        let available = self.allocation_extent()?;
        let requested = layout::byte_size(shape, dtype)?;
        let fits = offset
            .checked_add(requested)
            .is_some_and(|end| end <= available);
        if !fits {
            return Err(Error::OutOfBounds {
                offset,
                requested,
                available,
            });
        }

        let mut view = TensorDescriptor::new(desc.data, desc.device, dtype, shape);
        view.byte_offset = desc.byte_offset + offset as u64;
        Ok(Self::attach(Container {
            desc: view,
            ref_counter: AtomicUsize::new(0),
            owner: Owner::View(self.clone()),
        }))
    }

    /// Bytes from this tensor's first element to the end of the memory it
    /// was originally allocated in.
    fn allocation_extent(&self) -> Result<usize> {
        let inner = self.inner();
        match &inner.owner {
            Owner::Allocation(segment) => Ok(segment.len().saturating_sub(inner.desc.byte_offset as usize)),
            Owner::View(parent) => {
                let skipped = inner.desc.byte_offset.saturating_sub(parent.byte_offset()) as usize;
                Ok(parent.allocation_extent()?.saturating_sub(skipped))
            }
            Owner::Managed(_) => inner.desc.byte_size(),
        }
    }

    /// Export as a [`ManagedTensor`] whose deleter keeps this tensor alive.
    pub fn to_managed(&self) -> ManagedTensor {
        let keep_alive = self.clone();
        // SAFETY: the captured handle keeps the memory alive until the
        // deleter fires.
        unsafe { ManagedTensor::new(self.descriptor().clone(), Deleter::callback(move || drop(keep_alive))) }
    }

    /// The embedded descriptor.
    #[inline]
    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.inner().desc
    }

    /// Shape.
    #[inline]
    pub fn shape(&self) -> &[i64] {
        &self.inner().desc.shape
    }

    /// Explicit strides, if any.
    #[inline]
    pub fn strides(&self) -> Option<&[i64]> {
        self.inner().desc.strides.as_deref()
    }

    /// Strides, recomputed as row-major when absent.
    pub fn strides_or_default(&self) -> Dims {
        self.inner()
            .desc
            .strides
            .clone()
            .unwrap_or_else(|| layout::row_major_strides(self.shape()))
    }

    /// Element type.
    #[inline]
    pub fn dtype(&self) -> DataType {
        self.inner().desc.dtype
    }

    /// Device.
    #[inline]
    pub fn device(&self) -> Device {
        self.inner().desc.device
    }

    /// Byte offset into the base pointer.
    #[inline]
    pub fn byte_offset(&self) -> u64 {
        self.inner().desc.byte_offset
    }

    /// Pointer to the first element.
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        self.inner().desc.data_ptr()
    }

    /// Row-major contiguity, skipping unit dimensions.
    pub fn is_contiguous(&self) -> bool {
        self.inner().desc.is_contiguous()
    }

    /// Number of elements.
    pub fn num_elements(&self) -> Result<usize> {
        self.inner().desc.num_elements()
    }

    /// Payload size in bytes.
    pub fn byte_size(&self) -> Result<usize> {
        self.inner().desc.byte_size()
    }

    /// Number of live handles sharing the container.
    pub fn use_count(&self) -> usize {
        self.inner().ref_counter.load(Ordering::Relaxed)
    }

    /// Identity comparison.
    #[inline]
    pub fn same_as(&self, other: &TensorHandle) -> bool {
        self.container == other.container
    }

    /// Exchange the containers of two handles.
    pub fn swap(&mut self, other: &mut TensorHandle) {
        std::mem::swap(&mut self.container, &mut other.container);
    }
}

impl Clone for TensorHandle {
    fn clone(&self) -> Self {
        self.inner().ref_counter.fetch_add(1, Ordering::Relaxed);
        Self {
            container: self.container,
        }
    }
}

impl Drop for TensorHandle {
    fn drop(&mut self) {
        if self.inner().ref_counter.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Pairs with the Release decrements of the other holders.
        atomic::fence(Ordering::Acquire);
        // SAFETY: the counter reached zero, so this was the last handle and
        // the container came from `Box::leak` in `attach`.
        drop(unsafe { Box::from_raw(self.container.as_ptr()) });
    }
}

impl PartialEq for TensorHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for TensorHandle {}

impl fmt::Debug for TensorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorHandle")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .field("use_count", &self.use_count())
            .finish()
    }
}

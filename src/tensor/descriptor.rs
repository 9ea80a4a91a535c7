//! Tensor descriptors and the one-shot deleter that travels with them.
//!
//! A [`TensorDescriptor`] is a plain record: it never owns the memory its
//! `data` pointer refers to. Ownership travels separately as a [`Deleter`],
//! and a [`ManagedTensor`] pairs the two so the deleter fires exactly once,
//! either explicitly through [`ManagedTensor::dispose`] or on drop.

use super::layout::{self, Dims};
use super::{DataType, Device};
use crate::error::{Error, Result};
use crate::exchange::StoreBridgeContext;
use crate::observability::trace_deleter_failure;
use crate::store::ObjectId;
use std::fmt;

/// Flat description of a tensor: where its bytes are and how to read them.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    /// Base pointer of the backing memory. Not owned.
    pub data: *mut u8,
    /// Device the memory lives on.
    pub device: Device,
    /// Element type.
    pub dtype: DataType,
    /// Extent of each dimension.
    pub shape: Dims,
    /// Per-dimension strides in elements; `None` means row-major contiguous.
    pub strides: Option<Dims>,
    /// Offset in bytes from `data` to the first element.
    pub byte_offset: u64,
}

// SAFETY: the descriptor is an inert record. Dereferencing `data` is unsafe
// on its own and the owner of the memory decides who may do it.
unsafe impl Send for TensorDescriptor {}
unsafe impl Sync for TensorDescriptor {}

impl TensorDescriptor {
    /// Describe a row-major tensor at `data`.
    pub fn new(data: *mut u8, device: Device, dtype: DataType, shape: &[i64]) -> Self {
        Self {
            data,
            device,
            dtype,
            shape: Dims::from_slice(shape),
            strides: None,
            byte_offset: 0,
        }
    }

    /// Attach explicit strides.
    pub fn with_strides(mut self, strides: &[i64]) -> Self {
        self.strides = Some(Dims::from_slice(strides));
        self
    }

    /// Set the byte offset.
    pub fn with_byte_offset(mut self, byte_offset: u64) -> Self {
        self.byte_offset = byte_offset;
        self
    }

    /// Number of dimensions.
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Row-major contiguity, skipping unit dimensions.
    pub fn is_contiguous(&self) -> bool {
        layout::is_contiguous(&self.shape, self.strides.as_deref())
    }

    /// Number of elements.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] on overflow or negative dimensions.
    pub fn num_elements(&self) -> Result<usize> {
        layout::num_elements(&self.shape)
    }

    /// Payload size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] on overflow or negative dimensions.
    pub fn byte_size(&self) -> Result<usize> {
        layout::byte_size(&self.shape, self.dtype)
    }

    /// Pointer to the first element (`data + byte_offset`).
    #[inline]
    pub fn data_ptr(&self) -> *mut u8 {
        self.data.wrapping_add(self.byte_offset as usize)
    }

    /// Fail with [`Error::NonContiguousInput`] unless the layout is row-major.
    pub(crate) fn ensure_contiguous(&self) -> Result<()> {
        if self.is_contiguous() {
            Ok(())
        } else {
            Err(Error::NonContiguousInput {
                shape: self.shape.to_vec(),
                strides: self.strides.as_deref().map(<[i64]>::to_vec).unwrap_or_default(),
            })
        }
    }
}

/// What to do when the last consumer of a descriptor lets go of it.
///
/// A deleter is consumed by [`fire`](Deleter::fire), so running it twice is
/// impossible.
pub enum Deleter {
    /// Nothing owns the memory (borrowed descriptors).
    NoOp,
    /// Release the local store mapping, leaving the object resident.
    ReleaseOnly(StoreBridgeContext),
    /// Release the local store mapping, then delete the object.
    ReleaseAndDelete(StoreBridgeContext),
    /// Arbitrary cleanup.
    Callback(Box<dyn FnOnce() + Send>),
}

impl Deleter {
    /// Wrap a closure.
    pub fn callback(f: impl FnOnce() + Send + 'static) -> Self {
        Deleter::Callback(Box::new(f))
    }

    /// Run the cleanup.
    ///
    /// For store-backed deleters the release happens first; delete runs only
    /// if the release succeeded.
    ///
    /// # Errors
    ///
    /// Propagates store failures from release or delete unchanged.
    pub fn fire(self) -> Result<()> {
        match self {
            Deleter::NoOp => Ok(()),
            Deleter::ReleaseOnly(ctx) => ctx.release(),
            Deleter::ReleaseAndDelete(ctx) => {
                ctx.release()?;
                ctx.delete()
            }
            Deleter::Callback(f) => {
                f();
                Ok(())
            }
        }
    }

    /// Store object this deleter is bound to, if any.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self {
            Deleter::ReleaseOnly(ctx) | Deleter::ReleaseAndDelete(ctx) => Some(ctx.id()),
            Deleter::NoOp | Deleter::Callback(_) => None,
        }
    }
}

impl fmt::Debug for Deleter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deleter::NoOp => f.write_str("NoOp"),
            Deleter::ReleaseOnly(ctx) => f.debug_tuple("ReleaseOnly").field(&ctx.id()).finish(),
            Deleter::ReleaseAndDelete(ctx) => {
                f.debug_tuple("ReleaseAndDelete").field(&ctx.id()).finish()
            }
            Deleter::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// A descriptor together with the deleter that owns its memory.
///
/// The deleter fires exactly once: through [`dispose`](Self::dispose), when
/// ownership moves into a [`TensorHandle`](super::TensorHandle), or on drop.
/// Failures during drop are logged.
#[derive(Debug)]
pub struct ManagedTensor {
    pub(crate) desc: TensorDescriptor,
    pub(crate) deleter: Option<Deleter>,
}

impl ManagedTensor {
    /// Pair a descriptor with the deleter that owns its memory.
    ///
    /// # Safety
    ///
    /// `desc.data` must stay valid for reads (and writes, if the caller will
    /// write) of `desc.byte_offset + byte_size` bytes until `deleter` fires.
    pub unsafe fn new(desc: TensorDescriptor, deleter: Deleter) -> Self {
        Self {
            desc,
            deleter: Some(deleter),
        }
    }

    /// Wrap memory owned elsewhere; dropping does nothing.
    ///
    /// # Safety
    ///
    /// `desc.data` must outlive the returned value.
    pub unsafe fn borrowed(desc: TensorDescriptor) -> Self {
        unsafe { Self::new(desc, Deleter::NoOp) }
    }

    /// The descriptor.
    #[inline]
    pub fn descriptor(&self) -> &TensorDescriptor {
        &self.desc
    }

    /// Shape.
    #[inline]
    pub fn shape(&self) -> &[i64] {
        &self.desc.shape
    }

    /// Strides, if explicit.
    #[inline]
    pub fn strides(&self) -> Option<&[i64]> {
        self.desc.strides.as_deref()
    }

    /// Element type.
    #[inline]
    pub fn dtype(&self) -> DataType {
        self.desc.dtype
    }

    /// Device.
    #[inline]
    pub fn device(&self) -> Device {
        self.desc.device
    }

    /// Store object backing this tensor, if it came from the store.
    pub fn object_id(&self) -> Option<ObjectId> {
        self.deleter.as_ref().and_then(Deleter::object_id)
    }

    /// Payload bytes, when the tensor lives in host memory and is contiguous.
    pub fn host_bytes(&self) -> Option<&[u8]> {
        if !self.desc.device.is_cpu() || !self.desc.is_contiguous() {
            return None;
        }
        let len = self.desc.byte_size().ok()?;
        if len == 0 {
            return Some(&[]);
        }
        // SAFETY: constructors guarantee `data` stays valid for
        // byte_offset + byte_size bytes until the deleter fires, and the
        // deleter cannot fire while `self` is borrowed.
        Some(unsafe { std::slice::from_raw_parts(self.desc.data_ptr(), len) })
    }

    /// Fire the deleter now and report the outcome.
    ///
    /// # Errors
    ///
    /// Propagates the deleter's failure (e.g. [`Error::DoubleRelease`]).
    pub fn dispose(mut self) -> Result<()> {
        match self.deleter.take() {
            Some(deleter) => deleter.fire(),
            None => Ok(()),
        }
    }

    /// Split into descriptor and deleter; the caller becomes responsible for
    /// firing the deleter.
    pub fn into_parts(mut self) -> (TensorDescriptor, Deleter) {
        let deleter = self.deleter.take().unwrap_or(Deleter::NoOp);
        let desc = std::mem::replace(
            &mut self.desc,
            TensorDescriptor::new(std::ptr::null_mut(), Device::CPU, DataType::U8, &[]),
        );
        (desc, deleter)
    }
}

impl Drop for ManagedTensor {
    fn drop(&mut self) {
        if let Some(deleter) = self.deleter.take() {
            let object = deleter.object_id();
            if let Err(e) = deleter.fire() {
                trace_deleter_failure(object, &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_descriptor_sizes() {
        let desc = TensorDescriptor::new(std::ptr::null_mut(), Device::CPU, DataType::F32, &[2, 3]);
        assert_eq!(desc.rank(), 2);
        assert_eq!(desc.num_elements().unwrap(), 6);
        assert_eq!(desc.byte_size().unwrap(), 24);
        assert!(desc.is_contiguous());
        assert!(desc.clone().with_strides(&[3, 1]).is_contiguous());
        assert!(desc.clone().with_strides(&[1, 2]).ensure_contiguous().is_err());
    }

    #[test]
    fn test_deleter_fires_once_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut bytes = [0u8; 4];
        let desc = TensorDescriptor::new(bytes.as_mut_ptr(), Device::CPU, DataType::U8, &[4]);
        let tensor = unsafe {
            ManagedTensor::new(
                desc,
                Deleter::callback(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        assert_eq!(tensor.host_bytes(), Some(&[0u8, 0, 0, 0][..]));
        drop(tensor);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_and_into_parts() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let desc = TensorDescriptor::new(std::ptr::null_mut(), Device::CPU, DataType::U8, &[0]);
        let tensor = unsafe {
            ManagedTensor::new(
                desc.clone(),
                Deleter::callback(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        let (parts_desc, deleter) = tensor.into_parts();
        assert_eq!(parts_desc, desc);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        deleter.fire().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let noop = unsafe { ManagedTensor::borrowed(desc) };
        assert!(noop.object_id().is_none());
        noop.dispose().unwrap();
    }
}

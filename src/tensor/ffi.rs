//! DLPack interchange records and the capsule handshake.
//!
//! Foreign frameworks hand tensors across the C ABI as a
//! [`DLManagedTensor`]: a [`DLTensor`] plus an opaque context and a deleter.
//! Importing takes ownership of the record exactly once; exporting boxes a
//! [`ManagedTensor`] behind an `extern "C"` deleter the foreign side calls
//! when it is done.

use super::descriptor::{Deleter, ManagedTensor, TensorDescriptor};
use super::layout::Dims;
use super::{DataType, DataTypeCode, Device, DeviceType};
use crate::error::{Error, Result};
use std::ffi::{CStr, c_void};
use std::ptr::{self, NonNull};

/// Capsule name of an unconsumed DLPack tensor.
pub const DLPACK_CAPSULE_NAME: &CStr = c"dltensor";

/// Capsule name after the tensor has been consumed.
pub const DLPACK_CAPSULE_NAME_USED: &CStr = c"used_dltensor";

/// DLPack device.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DLDevice {
    /// DLPack device-type code.
    pub device_type: i32,
    /// Device ordinal.
    pub device_id: i32,
}

/// DLPack element type.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DLDataType {
    /// Type code.
    pub code: u8,
    /// Bits per lane.
    pub bits: u8,
    /// Lane count.
    pub lanes: u16,
}

/// DLPack tensor record. Borrowed view, no ownership.
#[repr(C)]
#[derive(Debug)]
pub struct DLTensor {
    /// Base data pointer.
    pub data: *mut c_void,
    /// Device of `data`.
    pub device: DLDevice,
    /// Rank.
    pub ndim: i32,
    /// Element type.
    pub dtype: DLDataType,
    /// `ndim` extents.
    pub shape: *mut i64,
    /// `ndim` strides in elements, or null for row-major.
    pub strides: *mut i64,
    /// Byte offset from `data` to the first element.
    pub byte_offset: u64,
}

/// DLPack tensor with ownership: call `deleter(self)` exactly once.
#[repr(C)]
#[derive(Debug)]
pub struct DLManagedTensor {
    /// The tensor.
    pub dl_tensor: DLTensor,
    /// Producer-owned context.
    pub manager_ctx: *mut c_void,
    /// Frees the record and its context.
    pub deleter: Option<unsafe extern "C" fn(*mut DLManagedTensor)>,
}

impl From<Device> for DLDevice {
    fn from(device: Device) -> Self {
        Self {
            device_type: device.device_type.code(),
            device_id: device.index,
        }
    }
}

impl From<DLDevice> for Device {
    fn from(device: DLDevice) -> Self {
        Device::new(DeviceType::from_code(device.device_type), device.device_id)
    }
}

impl From<DataType> for DLDataType {
    fn from(dtype: DataType) -> Self {
        Self {
            code: dtype.code as u8,
            bits: dtype.bits,
            lanes: dtype.lanes,
        }
    }
}

impl TryFrom<DLDataType> for DataType {
    type Error = Error;

    fn try_from(dtype: DLDataType) -> Result<Self> {
        Ok(DataType {
            code: DataTypeCode::from_u8(dtype.code)?,
            bits: dtype.bits,
            lanes: dtype.lanes,
        })
    }
}

/// Exported tensor kept alive behind `manager_ctx`.
struct ExportContext {
    tensor: ManagedTensor,
}

unsafe extern "C" fn delete_exported(raw: *mut DLManagedTensor) {
    if raw.is_null() {
        return;
    }
    // SAFETY: `raw` and its context were produced by `into_dlpack` via
    // `Box::into_raw`, and DLPack calls the deleter exactly once.
    unsafe {
        let record = Box::from_raw(raw);
        if !record.manager_ctx.is_null() {
            drop(Box::from_raw(record.manager_ctx.cast::<ExportContext>()));
        }
    }
}

/// Owned pointer to a foreign record whose deleter has not run yet.
struct ForeignTensor(NonNull<DLManagedTensor>);

// SAFETY: DLPack deleters may be called from any thread.
unsafe impl Send for ForeignTensor {}

impl ForeignTensor {
    fn release(self) {
        let raw = self.0.as_ptr();
        // SAFETY: we own the record and call its deleter exactly once.
        unsafe {
            if let Some(deleter) = (*raw).deleter {
                deleter(raw);
            }
        }
    }
}

impl ManagedTensor {
    /// Export for a foreign framework.
    ///
    /// The returned record owns this tensor; the foreign side must call its
    /// `deleter` exactly once, which fires this tensor's deleter.
    pub fn into_dlpack(self) -> NonNull<DLManagedTensor> {
        let ctx = Box::into_raw(Box::new(ExportContext { tensor: self }));
        // SAFETY: freshly boxed; the shape/stride pointers taken below stay
        // valid until `delete_exported` frees the context.
        let desc = unsafe { &mut (*ctx).tensor.desc };
        let shape = desc.shape.as_mut_ptr();
        let strides = desc
            .strides
            .as_mut()
            .map_or(ptr::null_mut(), |s| s.as_mut_ptr());
        let dl_tensor = DLTensor {
            data: desc.data.cast(),
            device: desc.device.into(),
            ndim: desc.shape.len() as i32,
            dtype: desc.dtype.into(),
            shape,
            strides,
            byte_offset: desc.byte_offset,
        };
        let record = Box::new(DLManagedTensor {
            dl_tensor,
            manager_ctx: ctx.cast(),
            deleter: Some(delete_exported),
        });
        NonNull::from(Box::leak(record))
    }

    /// Take ownership of a foreign record.
    ///
    /// Shape and strides are copied, so the record may be freed by its
    /// deleter independently of this tensor's descriptor. The foreign
    /// deleter runs when the returned tensor's deleter fires.
    ///
    /// # Safety
    ///
    /// `raw` must point to a valid, unconsumed [`DLManagedTensor`]. On
    /// success ownership passes to the returned value; on error the caller
    /// still owns the record.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMetadata`] for an unknown dtype code or negative rank.
    pub unsafe fn from_dlpack(raw: NonNull<DLManagedTensor>) -> Result<Self> {
        // SAFETY: caller guarantees a valid record.
        let tensor = unsafe { &raw.as_ref().dl_tensor };
        let dtype = DataType::try_from(tensor.dtype)?;
        let ndim = usize::try_from(tensor.ndim)
            .map_err(|_| Error::InvalidMetadata(format!("negative rank {}", tensor.ndim)))?;
        let shape: Dims = if ndim == 0 {
            Dims::new()
        } else {
            // SAFETY: DLPack guarantees `ndim` extents behind `shape`.
            Dims::from_slice(unsafe { std::slice::from_raw_parts(tensor.shape, ndim) })
        };
        let strides = (!tensor.strides.is_null() && ndim > 0)
            // SAFETY: non-null strides hold `ndim` entries.
            .then(|| Dims::from_slice(unsafe { std::slice::from_raw_parts(tensor.strides, ndim) }));

        let desc = TensorDescriptor {
            data: tensor.data.cast(),
            device: tensor.device.into(),
            dtype,
            shape,
            strides,
            byte_offset: tensor.byte_offset,
        };
        let foreign = ForeignTensor(raw);
        // SAFETY: the foreign deleter owns the memory and runs only when our
        // deleter fires.
        Ok(unsafe { ManagedTensor::new(desc, Deleter::callback(move || foreign.release())) })
    }
}

/// A one-shot container for a foreign DLPack tensor.
///
/// [`take`](Self::take) consumes the tensor exactly once and renames the
/// capsule to [`DLPACK_CAPSULE_NAME_USED`]. A capsule dropped without being
/// taken runs the foreign deleter itself.
pub struct DlpackCapsule {
    tensor: Option<NonNull<DLManagedTensor>>,
}

// SAFETY: the capsule uniquely owns the record; see `ForeignTensor`.
unsafe impl Send for DlpackCapsule {}

impl DlpackCapsule {
    /// Wrap a foreign record.
    ///
    /// # Safety
    ///
    /// `raw` must point to a valid, unconsumed [`DLManagedTensor`] that no
    /// one else will free.
    pub unsafe fn new(raw: NonNull<DLManagedTensor>) -> Self {
        Self { tensor: Some(raw) }
    }

    /// Wrap a tensor of ours for handing to a foreign framework.
    pub fn from_managed(tensor: ManagedTensor) -> Self {
        Self {
            tensor: Some(tensor.into_dlpack()),
        }
    }

    /// Current capsule name.
    pub fn name(&self) -> &'static CStr {
        if self.tensor.is_some() {
            DLPACK_CAPSULE_NAME
        } else {
            DLPACK_CAPSULE_NAME_USED
        }
    }

    /// Has the tensor been taken?
    pub fn is_consumed(&self) -> bool {
        self.tensor.is_none()
    }

    /// Take ownership of the tensor.
    ///
    /// # Errors
    ///
    /// [`Error::CapsuleConsumed`] on every call after the first successful
    /// one; [`Error::InvalidMetadata`] if the record cannot be decoded, in
    /// which case the capsule keeps the tensor.
    pub fn take(&mut self) -> Result<ManagedTensor> {
        let raw = self.tensor.ok_or(Error::CapsuleConsumed)?;
        // SAFETY: the capsule owns an unconsumed record.
        let tensor = unsafe { ManagedTensor::from_dlpack(raw)? };
        self.tensor = None;
        Ok(tensor)
    }

    /// Give the raw record to a foreign consumer, which becomes responsible
    /// for calling its deleter.
    pub fn into_raw(mut self) -> Option<NonNull<DLManagedTensor>> {
        self.tensor.take()
    }
}

impl Drop for DlpackCapsule {
    fn drop(&mut self) {
        if let Some(raw) = self.tensor.take() {
            ForeignTensor(raw).release();
        }
    }
}

impl std::fmt::Debug for DlpackCapsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DlpackCapsule").field("name", &self.name()).finish()
    }
}

//! Tensors: descriptors, reference-counted handles and DLPack interchange.
//!
//! - [`TensorDescriptor`]: plain record of where a tensor's bytes are
//! - [`ManagedTensor`]: descriptor plus the [`Deleter`] that owns its memory
//! - [`TensorHandle`]: in-process, reference-counted tensor
//! - [`ffi`]: `#[repr(C)]` DLPack records and [`DlpackCapsule`]

mod descriptor;
mod device;
mod dtype;
pub mod ffi;
mod handle;
mod layout;

pub use descriptor::{Deleter, ManagedTensor, TensorDescriptor};
pub use device::{Device, DeviceType};
pub use dtype::{DataType, DataTypeCode, Element};
pub use ffi::DlpackCapsule;
pub use handle::TensorHandle;
pub use layout::{Dims, byte_size, is_contiguous, num_elements, row_major_strides};

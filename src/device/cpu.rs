//! Host backend.

use super::{DeviceApi, Stream};
use crate::error::{Error, Result};
use crate::memory::{HeapSegment, MemorySegment};
use crate::tensor::{Device, DeviceType};
use std::sync::Arc;

/// Host memory backend. Copies are synchronous `memmove`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDeviceApi;

impl CpuDeviceApi {
    /// Create the host backend.
    pub fn new() -> Self {
        Self
    }
}

impl DeviceApi for CpuDeviceApi {
    fn device_type(&self) -> DeviceType {
        DeviceType::Cpu
    }

    fn alloc(&self, device: Device, nbytes: usize, align: usize) -> Result<Arc<dyn MemorySegment>> {
        if !device.is_cpu() {
            return Err(Error::UnsupportedDevice(device));
        }
        Ok(Arc::new(HeapSegment::with_alignment(nbytes, align)?))
    }

    unsafe fn copy_bytes(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        src_device: Device,
        dst_device: Device,
        _stream: Option<Stream>,
    ) -> Result<()> {
        if !src_device.is_cpu() {
            return Err(Error::UnsupportedDevice(src_device));
        }
        if !dst_device.is_cpu() {
            return Err(Error::UnsupportedDevice(dst_device));
        }
        if nbytes == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(Error::Copy("null pointer in host copy".into()));
        }
        // SAFETY: caller guarantees both ranges are valid; `copy` tolerates
        // overlap.
        unsafe { std::ptr::copy(src, dst, nbytes) };
        Ok(())
    }

    fn synchronize(&self, _device: Device, _stream: Option<Stream>) -> Result<()> {
        Ok(())
    }
}

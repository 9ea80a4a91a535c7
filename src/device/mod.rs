//! Device backends: allocation and byte copies per device kind.
//!
//! The exchange layer never talks to a driver directly. It goes through a
//! [`DeviceApi`] looked up in an explicit [`DeviceRegistry`] that the caller
//! builds and hands to the [`ExchangeManager`](crate::exchange::ExchangeManager).
//! There is no process-wide registry.
//!
//! Two backends ship with the crate:
//!
//! - [`CpuDeviceApi`]: aligned host memory, plain `memmove`
//! - [`SimulatedGpu`]: host-backed "device" memory with capacity limits and
//!   deferred stream copies, for tests and machines without an accelerator

mod cpu;
mod simulated;

pub use cpu::CpuDeviceApi;
pub use simulated::SimulatedGpu;

use crate::error::{Error, Result};
use crate::memory::MemorySegment;
use crate::tensor::{Device, DeviceType};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// An asynchronous command queue on a device.
///
/// [`Stream::DEFAULT`] is synchronous: work issued on it has completed when
/// the call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stream(pub u64);

impl Stream {
    /// The synchronous default stream.
    pub const DEFAULT: Stream = Stream(0);

    /// True for the default stream.
    #[inline]
    pub fn is_default(&self) -> bool {
        self.0 == 0
    }
}

/// Device capability consumed by tensors and the exchange manager.
pub trait DeviceApi: Send + Sync {
    /// Device kind served by this backend.
    fn device_type(&self) -> DeviceType;

    /// Backend name for logs.
    fn name(&self) -> &str {
        self.device_type().name()
    }

    /// Allocate `nbytes` on `device` with at least `align` alignment.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the device is full,
    /// [`Error::UnsupportedDevice`] for an unknown ordinal.
    fn alloc(&self, device: Device, nbytes: usize, align: usize) -> Result<Arc<dyn MemorySegment>>;

    /// Copy `nbytes` from `src` on `src_device` to `dst` on `dst_device`.
    ///
    /// With `stream` set to a non-default stream the copy may complete after
    /// the call returns; call [`synchronize`](Self::synchronize) before
    /// reading the destination.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `nbytes` reads and `dst` for `nbytes` writes
    /// on their respective devices until the copy has completed.
    ///
    /// # Errors
    ///
    /// [`Error::Copy`] or [`Error::UnsupportedDevice`].
    unsafe fn copy_bytes(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        src_device: Device,
        dst_device: Device,
        stream: Option<Stream>,
    ) -> Result<()>;

    /// Wait for outstanding work on `stream`, or on every stream when `None`.
    fn synchronize(&self, device: Device, stream: Option<Stream>) -> Result<()>;

    /// Create a new stream.
    fn create_stream(&self, device: Device) -> Result<Stream> {
        Err(Error::UnsupportedDevice(device))
    }

    /// Destroy a stream created by [`create_stream`](Self::create_stream).
    fn free_stream(&self, device: Device, _stream: Stream) -> Result<()> {
        Err(Error::UnsupportedDevice(device))
    }
}

/// Explicit lookup table from device kind to backend.
///
/// # Example
///
/// ```rust
/// use shmtensor::device::{DeviceRegistry, SimulatedGpu};
/// use shmtensor::tensor::DeviceType;
///
/// let mut registry = DeviceRegistry::new();
/// registry.register(SimulatedGpu::new(2, 1 << 20));
/// assert!(registry.get(DeviceType::Gpu).is_ok());
/// ```
#[derive(Clone)]
pub struct DeviceRegistry {
    apis: HashMap<DeviceType, Arc<dyn DeviceApi>>,
}

impl DeviceRegistry {
    /// Registry with the host backend only.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(CpuDeviceApi::new());
        registry
    }

    /// Registry with no backends at all.
    pub fn empty() -> Self {
        Self {
            apis: HashMap::new(),
        }
    }

    /// Host backend plus a simulated GPU.
    pub fn with_simulated_gpu(device_count: i32, capacity_per_device: usize) -> Self {
        let mut registry = Self::new();
        registry.register(SimulatedGpu::new(device_count, capacity_per_device));
        registry
    }

    /// Add or replace the backend for its device kind.
    pub fn register(&mut self, api: impl DeviceApi + 'static) -> &mut Self {
        self.register_arc(Arc::new(api))
    }

    /// Add or replace a shared backend.
    pub fn register_arc(&mut self, api: Arc<dyn DeviceApi>) -> &mut Self {
        tracing::debug!(backend = api.name(), "registered device backend");
        self.apis.insert(api.device_type(), api);
        self
    }

    /// Backend for a device kind.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedDevice`] if nothing is registered for the kind.
    pub fn get(&self, device_type: DeviceType) -> Result<&Arc<dyn DeviceApi>> {
        self.apis
            .get(&device_type)
            .ok_or(Error::UnsupportedDevice(Device::new(device_type, 0)))
    }

    /// Backend for a concrete device.
    pub fn api(&self, device: Device) -> Result<&Arc<dyn DeviceApi>> {
        self.apis
            .get(&device.device_type)
            .ok_or(Error::UnsupportedDevice(device))
    }

    /// Is a backend registered for this kind?
    pub fn supports(&self, device_type: DeviceType) -> bool {
        self.apis.contains_key(&device_type)
    }

    /// Allocate on `device`.
    pub fn alloc(&self, device: Device, nbytes: usize, align: usize) -> Result<Arc<dyn MemorySegment>> {
        self.api(device)?.alloc(device, nbytes, align)
    }

    /// Copy bytes between devices.
    ///
    /// The backend of the non-host side drives the copy; host-to-host copies
    /// use the CPU backend.
    ///
    /// # Safety
    ///
    /// Same contract as [`DeviceApi::copy_bytes`].
    pub unsafe fn copy_bytes(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        src_device: Device,
        dst_device: Device,
        stream: Option<Stream>,
    ) -> Result<()> {
        let driver = if !dst_device.is_cpu() {
            dst_device
        } else {
            src_device
        };
        let api = self.api(driver)?;
        // SAFETY: forwarded caller contract.
        unsafe { api.copy_bytes(dst, src, nbytes, src_device, dst_device, stream) }
    }

    /// Wait for outstanding work on `device`.
    pub fn synchronize(&self, device: Device, stream: Option<Stream>) -> Result<()> {
        self.api(device)?.synchronize(device, stream)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.apis.keys().copied().collect();
        kinds.sort();
        f.debug_struct("DeviceRegistry").field("backends", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = DeviceRegistry::new();
        assert!(registry.supports(DeviceType::Cpu));
        assert!(matches!(
            registry.get(DeviceType::Gpu),
            Err(Error::UnsupportedDevice(_))
        ));
        assert!(DeviceRegistry::empty().get(DeviceType::Cpu).is_err());
    }

    #[test]
    fn test_registry_host_to_device_and_back() {
        let registry = DeviceRegistry::with_simulated_gpu(1, 1024);
        let gpu = Device::gpu(0);
        let seg = registry.alloc(gpu, 16, 64).unwrap();
        let src: Vec<u8> = (0..16).collect();
        let mut out = vec![0u8; 16];
        unsafe {
            registry
                .copy_bytes(seg.as_mut_ptr().unwrap(), src.as_ptr(), 16, Device::CPU, gpu, None)
                .unwrap();
            registry
                .copy_bytes(out.as_mut_ptr(), seg.as_ptr(), 16, gpu, Device::CPU, None)
                .unwrap();
        }
        assert_eq!(out, src);
    }

    #[test]
    fn test_default_stream() {
        assert!(Stream::DEFAULT.is_default());
        assert!(!Stream(3).is_default());
    }
}

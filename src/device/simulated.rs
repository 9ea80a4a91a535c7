//! Host-backed simulated accelerator.
//!
//! "Device" memory is ordinary aligned host memory tagged
//! [`MemoryType::GpuDevice`], so the copy paths that a real driver would take
//! are exercised without hardware. Each device has a byte capacity, and
//! device-to-device copies issued on a non-default stream are queued until
//! [`DeviceApi::synchronize`] runs, which mirrors asynchronous stream
//! semantics closely enough to catch missing synchronisation in tests.

use super::{DeviceApi, Stream};
use crate::error::{Error, Result};
use crate::memory::{HeapSegment, MemorySegment, MemoryType};
use crate::tensor::{Device, DeviceType};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A queued copy. Addresses are stored as integers so the queue is `Send`.
#[derive(Debug, Clone, Copy)]
struct PendingCopy {
    dst: usize,
    src: usize,
    nbytes: usize,
}

#[derive(Debug, Default)]
struct StreamTable {
    next_id: u64,
    queues: HashMap<(i32, u64), Vec<PendingCopy>>,
}

/// Simulated GPU backend.
///
/// # Example
///
/// ```rust
/// use shmtensor::device::{DeviceApi, SimulatedGpu};
/// use shmtensor::tensor::Device;
///
/// let gpu = SimulatedGpu::new(1, 1024);
/// let seg = gpu.alloc(Device::gpu(0), 512, 64).unwrap();
/// assert_eq!(gpu.used(0), 512);
/// drop(seg);
/// assert_eq!(gpu.used(0), 0);
/// ```
#[derive(Debug)]
pub struct SimulatedGpu {
    capacity: usize,
    used: Arc<[AtomicUsize]>,
    streams: Mutex<StreamTable>,
}

impl SimulatedGpu {
    /// Create `device_count` devices with `capacity_per_device` bytes each.
    pub fn new(device_count: i32, capacity_per_device: usize) -> Self {
        let used = (0..device_count.max(0)).map(|_| AtomicUsize::new(0)).collect();
        Self {
            capacity: capacity_per_device,
            used,
            streams: Mutex::new(StreamTable {
                next_id: 1,
                queues: HashMap::new(),
            }),
        }
    }

    /// Number of simulated devices.
    pub fn device_count(&self) -> usize {
        self.used.len()
    }

    /// Bytes currently allocated on device `index`.
    pub fn used(&self, index: usize) -> usize {
        self.used.get(index).map_or(0, |u| u.load(Ordering::Acquire))
    }

    /// Copies queued on non-default streams and not yet synchronised.
    pub fn pending_copies(&self) -> usize {
        self.lock_streams().queues.values().map(Vec::len).sum()
    }

    fn check(&self, device: Device) -> Result<usize> {
        if device.device_type != DeviceType::Gpu {
            return Err(Error::UnsupportedDevice(device));
        }
        usize::try_from(device.index)
            .ok()
            .filter(|&i| i < self.used.len())
            .ok_or(Error::UnsupportedDevice(device))
    }

    fn lock_streams(&self) -> MutexGuard<'_, StreamTable> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(queue: Vec<PendingCopy>) {
        for copy in queue {
            // SAFETY: the enqueuing caller promised both ranges stay valid
            // until the stream is synchronised.
            unsafe {
                std::ptr::copy(copy.src as *const u8, copy.dst as *mut u8, copy.nbytes);
            }
        }
    }
}

/// Device allocation that returns its bytes to the device budget on drop.
struct SimulatedAllocation {
    segment: HeapSegment,
    used: Arc<[AtomicUsize]>,
    index: usize,
}

impl MemorySegment for SimulatedAllocation {
    fn as_ptr(&self) -> *const u8 {
        self.segment.as_ptr()
    }

    fn as_mut_ptr(&self) -> Option<*mut u8> {
        self.segment.as_mut_ptr()
    }

    fn len(&self) -> usize {
        self.segment.len()
    }

    fn memory_type(&self) -> MemoryType {
        MemoryType::GpuDevice
    }
}

impl Drop for SimulatedAllocation {
    fn drop(&mut self) {
        self.used[self.index].fetch_sub(self.segment.len(), Ordering::AcqRel);
    }
}

impl DeviceApi for SimulatedGpu {
    fn device_type(&self) -> DeviceType {
        DeviceType::Gpu
    }

    fn name(&self) -> &str {
        "simulated-gpu"
    }

    fn alloc(&self, device: Device, nbytes: usize, align: usize) -> Result<Arc<dyn MemorySegment>> {
        let index = self.check(device)?;
        let capacity = self.capacity;
        self.used[index]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(nbytes).filter(|&total| total <= capacity)
            })
            .map_err(|used| Error::OutOfMemory {
                requested: nbytes,
                available: capacity.saturating_sub(used),
            })?;

        match HeapSegment::tagged(nbytes, align, MemoryType::GpuDevice) {
            Ok(segment) => Ok(Arc::new(SimulatedAllocation {
                segment,
                used: self.used.clone(),
                index,
            })),
            Err(e) => {
                self.used[index].fetch_sub(nbytes, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    unsafe fn copy_bytes(
        &self,
        dst: *mut u8,
        src: *const u8,
        nbytes: usize,
        src_device: Device,
        dst_device: Device,
        stream: Option<Stream>,
    ) -> Result<()> {
        for device in [src_device, dst_device] {
            if !device.is_cpu() {
                self.check(device)?;
            }
        }
        if nbytes == 0 {
            return Ok(());
        }
        if dst.is_null() || src.is_null() {
            return Err(Error::Copy("null pointer in device copy".into()));
        }

        let deferred = !src_device.is_cpu() && !dst_device.is_cpu();
        match stream {
            Some(stream) if deferred && !stream.is_default() => {
                let mut table = self.lock_streams();
                let queue = table
                    .queues
                    .get_mut(&(dst_device.index, stream.0))
                    .ok_or_else(|| Error::Copy(format!("unknown stream {} on {dst_device}", stream.0)))?;
                queue.push(PendingCopy {
                    dst: dst as usize,
                    src: src as usize,
                    nbytes,
                });
                tracing::trace!(stream = stream.0, nbytes, "queued device copy");
            }
            _ => {
                // SAFETY: caller guarantees both ranges are valid.
                unsafe { std::ptr::copy(src, dst, nbytes) };
            }
        }
        Ok(())
    }

    fn synchronize(&self, device: Device, stream: Option<Stream>) -> Result<()> {
        if device.is_cpu() {
            return Ok(());
        }
        self.check(device)?;
        let mut table = self.lock_streams();
        for ((index, id), queue) in table.queues.iter_mut() {
            if *index == device.index && stream.is_none_or(|s| s.0 == *id) {
                Self::flush(std::mem::take(queue));
            }
        }
        Ok(())
    }

    fn create_stream(&self, device: Device) -> Result<Stream> {
        self.check(device)?;
        let mut table = self.lock_streams();
        let id = table.next_id;
        table.next_id += 1;
        table.queues.insert((device.index, id), Vec::new());
        Ok(Stream(id))
    }

    fn free_stream(&self, device: Device, stream: Stream) -> Result<()> {
        self.check(device)?;
        let mut table = self.lock_streams();
        match table.queues.remove(&(device.index, stream.0)) {
            Some(queue) => {
                Self::flush(queue);
                Ok(())
            }
            None => Err(Error::Copy(format!("unknown stream {} on {device}", stream.0))),
        }
    }
}

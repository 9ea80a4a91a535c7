//! Device identification.

use std::fmt;

/// Kind of device a tensor lives on.
///
/// The numeric codes are the DLPack device-type codes, which is what the
/// metadata header and the FFI records carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceType {
    /// Host memory.
    Cpu,
    /// CUDA-style accelerator memory.
    Gpu,
    /// Any other DLPack device code.
    Other(i32),
}

impl DeviceType {
    /// DLPack code of this device type.
    pub fn code(&self) -> i32 {
        match self {
            DeviceType::Cpu => 1,
            DeviceType::Gpu => 2,
            DeviceType::Other(code) => *code,
        }
    }

    /// Device type for a DLPack code.
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => DeviceType::Cpu,
            2 => DeviceType::Gpu,
            other => DeviceType::Other(other),
        }
    }

    /// Human-readable backend name.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Other(4) => "opencl",
            DeviceType::Other(7) => "vulkan",
            DeviceType::Other(8) => "metal",
            DeviceType::Other(10) => "rocm",
            DeviceType::Other(12) => "ext_dev",
            DeviceType::Other(_) => "unknown",
        }
    }
}

/// A concrete device: kind plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Device {
    /// Device kind.
    pub device_type: DeviceType,
    /// Ordinal among devices of the same kind.
    pub index: i32,
}

impl Device {
    /// The host.
    pub const CPU: Device = Device {
        device_type: DeviceType::Cpu,
        index: 0,
    };

    /// Create a device.
    pub const fn new(device_type: DeviceType, index: i32) -> Self {
        Self { device_type, index }
    }

    /// GPU with the given ordinal.
    pub const fn gpu(index: i32) -> Self {
        Self::new(DeviceType::Gpu, index)
    }

    /// True for host memory.
    #[inline]
    pub fn is_cpu(&self) -> bool {
        self.device_type == DeviceType::Cpu
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::CPU
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.device_type.name(), self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_codes_round_trip() {
        for code in [1, 2, 4, 12, 99] {
            assert_eq!(DeviceType::from_code(code).code(), code);
        }
        assert_eq!(DeviceType::from_code(1), DeviceType::Cpu);
        assert_eq!(DeviceType::from_code(2), DeviceType::Gpu);
    }

    #[test]
    fn test_device_display() {
        assert_eq!(Device::CPU.to_string(), "cpu:0");
        assert_eq!(Device::gpu(3).to_string(), "gpu:3");
        assert!(Device::default().is_cpu());
        assert!(!Device::gpu(0).is_cpu());
    }
}

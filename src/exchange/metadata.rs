//! Tensor metadata header stored alongside each object.
//!
//! Layout, host-native byte order, no padding and no version tag:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────┬──────┬───────┬──────────┬────────────────┐
//! │ device: i32  │ index: i32   │ code │ bits │ lanes │ rank:i32 │ rank × i64     │
//! │              │              │  u8  │  u8  │  u16  │          │ shape          │
//! └──────────────┴──────────────┴──────┴──────┴───────┴──────────┴────────────────┘
//! ```

use crate::error::{Error, Result};
use crate::tensor::{DataType, DataTypeCode, Device, DeviceType, Dims};
use bytes::{Buf, BufMut, BytesMut};

/// Bytes preceding the shape array.
pub const HEADER_PREFIX_LEN: usize = 4 + 4 + 1 + 1 + 2 + 4;

/// Decoded metadata header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHeader {
    /// Device the payload was produced on.
    pub device: Device,
    /// Element type.
    pub dtype: DataType,
    /// Shape; the rank is its length.
    pub shape: Dims,
}

impl TensorHeader {
    /// Header for a tensor.
    pub fn new(device: Device, dtype: DataType, shape: &[i64]) -> Self {
        Self {
            device,
            dtype,
            shape: Dims::from_slice(shape),
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        HEADER_PREFIX_LEN + 8 * self.shape.len()
    }

    /// Serialize.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_i32_ne(self.device.device_type.code());
        buf.put_i32_ne(self.device.index);
        buf.put_u8(self.dtype.code as u8);
        buf.put_u8(self.dtype.bits);
        buf.put_u16_ne(self.dtype.lanes);
        buf.put_i32_ne(self.shape.len() as i32);
        for &dim in &self.shape {
            buf.put_i64_ne(dim);
        }
        buf
    }

    /// Deserialize. Trailing bytes are ignored.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidMetadata`] if the buffer is truncated, the rank is
    /// negative or the dtype code is unknown.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_PREFIX_LEN {
            return Err(Error::InvalidMetadata(format!(
                "header needs at least {HEADER_PREFIX_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let device_type = DeviceType::from_code(bytes.get_i32_ne());
        let index = bytes.get_i32_ne();
        let code = DataTypeCode::from_u8(bytes.get_u8())?;
        let bits = bytes.get_u8();
        let lanes = bytes.get_u16_ne();
        let rank = bytes.get_i32_ne();
        let rank = usize::try_from(rank)
            .map_err(|_| Error::InvalidMetadata(format!("negative rank {rank}")))?;
        if bytes.remaining() < rank.saturating_mul(8) {
            return Err(Error::InvalidMetadata(format!(
                "rank {rank} needs {} shape bytes, got {}",
                rank * 8,
                bytes.remaining()
            )));
        }
        let shape = (0..rank).map(|_| bytes.get_i64_ne()).collect();
        Ok(Self {
            device: Device::new(device_type, index),
            dtype: DataType { code, bits, lanes },
            shape,
        })
    }
}

//! Element data types.

use crate::error::{Error, Result};
use std::fmt;

/// Type code of a tensor element (DLPack numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataTypeCode {
    /// Signed integer.
    Int = 0,
    /// Unsigned integer.
    UInt = 1,
    /// IEEE floating point.
    Float = 2,
    /// Opaque handle.
    Handle = 3,
    /// Brain floating point.
    Bfloat = 4,
    /// Complex floating point.
    Complex = 5,
    /// Packed bit field / boolean.
    Bool = 6,
}

impl DataTypeCode {
    /// Decode a type code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMetadata`] for codes outside the known set.
    pub fn from_u8(code: u8) -> Result<Self> {
        Ok(match code {
            0 => DataTypeCode::Int,
            1 => DataTypeCode::UInt,
            2 => DataTypeCode::Float,
            3 => DataTypeCode::Handle,
            4 => DataTypeCode::Bfloat,
            5 => DataTypeCode::Complex,
            6 => DataTypeCode::Bool,
            other => {
                return Err(Error::InvalidMetadata(format!("unknown dtype code {other}")));
            }
        })
    }
}

/// Element type: code, bit width and vector lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataType {
    /// Type code.
    pub code: DataTypeCode,
    /// Bits per lane (8, 16, 32 or 64 in practice).
    pub bits: u8,
    /// Number of lanes; 1 for scalars.
    pub lanes: u16,
}

impl DataType {
    /// Create a scalar data type.
    pub const fn scalar(code: DataTypeCode, bits: u8) -> Self {
        Self {
            code,
            bits,
            lanes: 1,
        }
    }

    /// 32-bit float.
    pub const F32: DataType = DataType::scalar(DataTypeCode::Float, 32);
    /// 64-bit float.
    pub const F64: DataType = DataType::scalar(DataTypeCode::Float, 64);
    /// 16-bit float.
    pub const F16: DataType = DataType::scalar(DataTypeCode::Float, 16);
    /// 8-bit signed integer.
    pub const I8: DataType = DataType::scalar(DataTypeCode::Int, 8);
    /// 16-bit signed integer.
    pub const I16: DataType = DataType::scalar(DataTypeCode::Int, 16);
    /// 32-bit signed integer.
    pub const I32: DataType = DataType::scalar(DataTypeCode::Int, 32);
    /// 64-bit signed integer.
    pub const I64: DataType = DataType::scalar(DataTypeCode::Int, 64);
    /// 8-bit unsigned integer.
    pub const U8: DataType = DataType::scalar(DataTypeCode::UInt, 8);
    /// 16-bit unsigned integer.
    pub const U16: DataType = DataType::scalar(DataTypeCode::UInt, 16);
    /// 32-bit unsigned integer.
    pub const U32: DataType = DataType::scalar(DataTypeCode::UInt, 32);
    /// 64-bit unsigned integer.
    pub const U64: DataType = DataType::scalar(DataTypeCode::UInt, 64);

    /// Set the lane count.
    pub const fn with_lanes(mut self, lanes: u16) -> Self {
        self.lanes = lanes;
        self
    }

    /// Bytes occupied by one element (all lanes).
    ///
    /// Sub-byte widths round down exactly as `bits / 8` does, so a 1-bit
    /// type reports zero.
    #[inline]
    pub fn element_bytes(&self) -> usize {
        (self.bits as usize / 8) * self.lanes as usize
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.code {
            DataTypeCode::Int => "int",
            DataTypeCode::UInt => "uint",
            DataTypeCode::Float => "float",
            DataTypeCode::Handle => "handle",
            DataTypeCode::Bfloat => "bfloat",
            DataTypeCode::Complex => "complex",
            DataTypeCode::Bool => "bool",
        };
        write!(f, "{prefix}{}", self.bits)?;
        if self.lanes != 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}

/// Rust scalar types that map onto a [`DataType`].
pub trait Element: bytemuck::Pod {
    /// The matching tensor data type.
    const DTYPE: DataType;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(impl Element for $ty {
            const DTYPE: DataType = $dtype;
        })*
    };
}

impl_element! {
    f32 => DataType::F32,
    f64 => DataType::F64,
    i8 => DataType::I8,
    i16 => DataType::I16,
    i32 => DataType::I32,
    i64 => DataType::I64,
    u8 => DataType::U8,
    u16 => DataType::U16,
    u32 => DataType::U32,
    u64 => DataType::U64,
}

//! Row-major layout helpers.
//!
//! Every tensor that passes through the store is exchanged in canonical
//! C order. These helpers recompute strides from a shape, test whether an
//! existing stride pattern is already row-major, and compute checked
//! element and byte counts.

use super::DataType;
use crate::error::{Error, Result};
use smallvec::SmallVec;

/// Inline storage for shape and stride vectors. Most tensors have rank ≤ 4.
pub type Dims = SmallVec<[i64; 4]>;

/// Compute row-major (C order) strides for `shape`.
///
/// `strides[rank-1] = 1` and `strides[i] = strides[i+1] * shape[i+1]`.
/// A rank-0 shape produces no strides.
///
/// # Example
///
/// ```rust
/// use shmtensor::tensor::row_major_strides;
///
/// assert_eq!(row_major_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
/// assert!(row_major_strides(&[]).is_empty());
/// ```
pub fn row_major_strides(shape: &[i64]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(0, shape.len());
    let mut running = 1i64;
    for i in (0..shape.len()).rev() {
        strides[i] = running;
        running = running.wrapping_mul(shape[i]);
    }
    strides
}

/// Is the layout described by `shape`/`strides` row-major contiguous?
///
/// Absent strides always count as contiguous. Dimensions of size 1 are
/// skipped because their stride is never used to address memory.
pub fn is_contiguous(shape: &[i64], strides: Option<&[i64]>) -> bool {
    let Some(strides) = strides else {
        return true;
    };
    if strides.len() != shape.len() {
        return false;
    }
    let mut expected = 1i64;
    for (&dim, &stride) in shape.iter().zip(strides).rev() {
        if dim == 1 {
            continue;
        }
        if stride != expected {
            return false;
        }
        expected = expected.wrapping_mul(dim);
    }
    true
}

/// Product of `shape`, with overflow and negative-dimension checks.
///
/// # Errors
///
/// Returns [`Error::Allocation`] if a dimension is negative or the product
/// overflows `usize`.
pub fn num_elements(shape: &[i64]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        let dim = usize::try_from(dim)
            .map_err(|_| Error::Allocation(format!("negative dimension {dim} in shape {shape:?}")))?;
        acc.checked_mul(dim)
            .ok_or_else(|| Error::Allocation(format!("element count of {shape:?} overflows")))
    })
}

/// Payload size in bytes: `bits/8 * lanes * prod(shape)`.
///
/// # Errors
///
/// Returns [`Error::Allocation`] if the computation overflows.
pub fn byte_size(shape: &[i64], dtype: DataType) -> Result<usize> {
    num_elements(shape)?
        .checked_mul(dtype.element_bytes())
        .ok_or_else(|| Error::Allocation(format!("byte size of {shape:?} x {dtype} overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
        assert_eq!(row_major_strides(&[5]).as_slice(), &[1]);
        assert!(row_major_strides(&[]).is_empty());
        assert_eq!(row_major_strides(&[7, 1, 2]).as_slice(), &[2, 2, 1]);
    }

    #[test]
    fn test_contiguity() {
        assert!(is_contiguous(&[2, 3], None));
        assert!(is_contiguous(&[2, 3], Some(&[3, 1])));
        // Transposed.
        assert!(!is_contiguous(&[2, 3], Some(&[1, 2])));
        // Unit dimensions carry arbitrary strides.
        assert!(is_contiguous(&[2, 1, 3], Some(&[3, 999, 1])));
        assert!(is_contiguous(&[1], Some(&[42])));
        // Rank mismatch.
        assert!(!is_contiguous(&[2, 3], Some(&[1])));
        assert!(is_contiguous(&[], Some(&[])));
    }

    #[test]
    fn test_sizes() {
        assert_eq!(num_elements(&[]).unwrap(), 1);
        assert_eq!(num_elements(&[2, 0, 3]).unwrap(), 0);
        assert_eq!(byte_size(&[2, 3], DataType::F32).unwrap(), 24);
        assert_eq!(byte_size(&[4], DataType::F32.with_lanes(2)).unwrap(), 32);
    }

    #[test]
    fn test_size_overflow() {
        assert!(num_elements(&[-1]).is_err());
        assert!(byte_size(&[i64::MAX, i64::MAX], DataType::F64).is_err());
    }
}

//! Error types for shmtensor.

use crate::store::ObjectId;
use crate::tensor::Device;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using shmtensor's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shmtensor operations.
///
/// Every variant maps to exactly one [`ErrorKind`]; the `Display` output is
/// the human-readable cause.
#[derive(Error, Debug)]
pub enum Error {
    /// The store could not be reached before the connect deadline.
    #[error("cannot connect to store at {endpoint} within {timeout:?}: {cause}")]
    Connection {
        /// Endpoint that was dialled.
        endpoint: String,
        /// Deadline that elapsed.
        timeout: Duration,
        /// Why the connection failed.
        cause: String,
    },

    /// An object already occupies the identity.
    #[error("object {0} already exists")]
    ObjectExists(ObjectId),

    /// No object is stored under the identity.
    #[error("object {0} not found")]
    NotFound(ObjectId),

    /// The object did not become available (sealed) before the deadline.
    #[error("timed out after {timeout:?} waiting for object {id}")]
    Timeout {
        /// Object that was awaited.
        id: ObjectId,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The store or a device backend ran out of memory.
    #[error("out of memory: requested {requested} bytes, available {available} bytes")]
    OutOfMemory {
        /// Bytes requested.
        requested: usize,
        /// Bytes still available.
        available: usize,
    },

    /// A strided (non row-major) tensor was handed to the store path.
    #[error("tensor is not contiguous (shape {shape:?}, strides {strides:?})")]
    NonContiguousInput {
        /// Shape of the rejected tensor.
        shape: Vec<i64>,
        /// Strides of the rejected tensor.
        strides: Vec<i64>,
    },

    /// Source and destination byte sizes differ.
    #[error("shape mismatch: expected {expected} bytes, got {actual} bytes")]
    ShapeMismatch {
        /// Byte size of the destination.
        expected: usize,
        /// Byte size of the source.
        actual: usize,
    },

    /// A view would reach past the end of its source allocation.
    #[error("view of {requested} bytes at offset {offset} exceeds allocation of {available} bytes")]
    OutOfBounds {
        /// Byte offset of the view.
        offset: usize,
        /// Byte extent of the view.
        requested: usize,
        /// Byte size of the source allocation.
        available: usize,
    },

    /// A device copy failed.
    #[error("copy failed: {0}")]
    Copy(String),

    /// Size computation overflowed or a backend could not allocate.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Release was called on an object this client no longer maps.
    #[error("object {0} released more times than it was acquired")]
    DoubleRelease(ObjectId),

    /// No backend is registered for the device, or the store has no arena for it.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(Device),

    /// The metadata header could not be decoded.
    #[error("invalid tensor metadata: {0}")]
    InvalidMetadata(String),

    /// A foreign capsule was already consumed.
    #[error("capsule has already been consumed")]
    CapsuleConsumed,

    /// The store session was closed.
    #[error("store session is disconnected")]
    Disconnected,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

/// Discriminant of an [`Error`], stable for matching and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Connection`].
    Connection,
    /// See [`Error::ObjectExists`].
    ObjectExists,
    /// See [`Error::NotFound`].
    NotFound,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::OutOfMemory`].
    OutOfMemory,
    /// See [`Error::NonContiguousInput`].
    NonContiguousInput,
    /// See [`Error::ShapeMismatch`].
    ShapeMismatch,
    /// See [`Error::OutOfBounds`].
    OutOfBounds,
    /// See [`Error::Copy`].
    Copy,
    /// See [`Error::Allocation`].
    Allocation,
    /// See [`Error::DoubleRelease`].
    DoubleRelease,
    /// See [`Error::UnsupportedDevice`].
    UnsupportedDevice,
    /// See [`Error::InvalidMetadata`].
    InvalidMetadata,
    /// See [`Error::CapsuleConsumed`].
    CapsuleConsumed,
    /// See [`Error::Disconnected`].
    Disconnected,
    /// I/O or system call failure.
    Io,
}

impl ErrorKind {
    /// Short lowercase name, used as a metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::ObjectExists => "object_exists",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::NonContiguousInput => "non_contiguous_input",
            ErrorKind::ShapeMismatch => "shape_mismatch",
            ErrorKind::OutOfBounds => "out_of_bounds",
            ErrorKind::Copy => "copy",
            ErrorKind::Allocation => "allocation",
            ErrorKind::DoubleRelease => "double_release",
            ErrorKind::UnsupportedDevice => "unsupported_device",
            ErrorKind::InvalidMetadata => "invalid_metadata",
            ErrorKind::CapsuleConsumed => "capsule_consumed",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Io => "io",
        }
    }
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection { .. } => ErrorKind::Connection,
            Error::ObjectExists(_) => ErrorKind::ObjectExists,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Error::NonContiguousInput { .. } => ErrorKind::NonContiguousInput,
            Error::ShapeMismatch { .. } => ErrorKind::ShapeMismatch,
            Error::OutOfBounds { .. } => ErrorKind::OutOfBounds,
            Error::Copy(_) => ErrorKind::Copy,
            Error::Allocation(_) => ErrorKind::Allocation,
            Error::DoubleRelease(_) => ErrorKind::DoubleRelease,
            Error::UnsupportedDevice(_) => ErrorKind::UnsupportedDevice,
            Error::InvalidMetadata(_) => ErrorKind::InvalidMetadata,
            Error::CapsuleConsumed => ErrorKind::CapsuleConsumed,
            Error::Disconnected => ErrorKind::Disconnected,
            Error::Io(_) | Error::System(_) => ErrorKind::Io,
        }
    }

    /// True if this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let id = ObjectId::from_name("k");
        assert_eq!(Error::NotFound(id).kind(), ErrorKind::NotFound);
        assert_eq!(Error::DoubleRelease(id).kind(), ErrorKind::DoubleRelease);
        assert_eq!(
            Error::Timeout {
                id,
                timeout: Duration::from_millis(5)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert!(Error::NotFound(id).is_not_found());
        assert!(!Error::ObjectExists(id).is_not_found());
    }

    #[test]
    fn test_error_display_carries_cause() {
        let err = Error::OutOfBounds {
            offset: 8,
            requested: 64,
            available: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("32"));
        assert_eq!(ErrorKind::OutOfBounds.as_str(), "out_of_bounds");
    }
}

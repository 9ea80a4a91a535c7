//! # shmtensor
//!
//! Zero-copy tensor exchange between processes through a shared-memory
//! object store.
//!
//! A producer puts a contiguous tensor into the store under an
//! [`ObjectId`](store::ObjectId); any consumer connected to the same store
//! gets it back as a tensor that aliases the store's memory directly. Shape,
//! element type and device travel in a small binary header next to the
//! payload, and every store-backed tensor knows how to give its object
//! reference back when it is dropped.
//!
//! ## Features
//!
//! - **DLPack-shaped descriptors**: [`TensorDescriptor`](tensor::TensorDescriptor)
//!   plus a one-shot [`Deleter`](tensor::Deleter), and `#[repr(C)]` records
//!   for handing tensors across FFI
//! - **Reference-counted handles**: [`TensorHandle`](tensor::TensorHandle)
//!   with views and cross-device copies
//! - **Pluggable devices**: an explicit [`DeviceRegistry`](device::DeviceRegistry)
//!   of [`DeviceApi`](device::DeviceApi) backends
//! - **Store contract**: the [`ObjectStore`](store::ObjectStore) trait, with
//!   an in-process memfd-backed [`LocalStore`](store::LocalStore)
//! - **Linux-optimized**: memfd segments that another process can map
//!
//! ## Quick Start
//!
//! ```rust
//! use shmtensor::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let registry = Arc::new(DeviceRegistry::new());
//! let store = LocalStore::new(LocalStoreConfig::new("/tmp/quickstart"), registry.clone());
//!
//! // Producer
//! let producer = ExchangeManager::connect(&store, registry.clone(), ExchangeConfig::new("/tmp/quickstart"))?;
//! let frame = TensorHandle::from_slice(&[0u8, 1, 2, 3, 4, 5], &[2, 3], Device::CPU, &registry)?;
//! let (id, stored) = producer.share(&frame)?;
//! drop(stored);
//!
//! // Consumer
//! let consumer = ExchangeManager::connect(&store, registry.clone(), ExchangeConfig::new("/tmp/quickstart"))?;
//! let tensor = consumer.get(id, Duration::from_millis(100))?;
//! assert_eq!(tensor.shape(), &[2, 3]);
//! assert_eq!(tensor.host_bytes(), Some(&[0u8, 1, 2, 3, 4, 5][..]));
//! # Ok::<(), shmtensor::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod device;
pub mod error;
pub mod exchange;
pub mod memory;
pub mod observability;
pub mod store;
pub mod tensor;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ExchangeConfig;
    pub use crate::device::{DeviceApi, DeviceRegistry, Stream};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::exchange::{DeletionPolicy, ExchangeManager, PendingTensor};
    pub use crate::memory::{MemorySegment, MemoryType};
    pub use crate::store::{LocalStore, LocalStoreConfig, ObjectId, ObjectStore};
    pub use crate::tensor::{DataType, Device, DeviceType, ManagedTensor, TensorDescriptor, TensorHandle};
}

pub use error::{Error, ErrorKind, Result};

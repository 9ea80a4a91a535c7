//! Tensor exchange through the object store.
//!
//! [`ExchangeManager`] is the façade producers and consumers use:
//!
//! - `put` copies a contiguous tensor into a new store object, seals it and
//!   returns a tensor aliasing the object.
//! - `get` waits for a sealed object and maps it without copying.
//! - `create` / `reserve` allocate store-owned tensors to write into.
//! - `release` / `delete` drive the store's reference counting directly.
//!
//! Every store-backed tensor carries a [`StoreBridgeContext`] inside its
//! [`Deleter`](crate::tensor::Deleter), which gives the object reference
//! back according to its [`DeletionPolicy`]. The tensor's shape and type
//! travel in a small [`TensorHeader`] stored as the object's metadata.

mod context;
mod copy;
mod manager;
mod metadata;

pub use context::{DeletionPolicy, StoreBridgeContext};
pub use copy::ParallelCopier;
pub use manager::{ExchangeManager, PendingTensor};
pub use metadata::{HEADER_PREFIX_LEN, TensorHeader};

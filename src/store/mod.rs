//! Object store capability contract.
//!
//! The exchange layer consumes a shared-memory object store through the
//! [`ObjectStore`] trait: create a buffer under an [`ObjectId`], seal it,
//! fetch it from any client, release local mappings and delete it. The store
//! owns allocation, sealing, reference counting and eviction; this crate
//! only drives it.
//!
//! [`LocalStore`] is a complete in-process implementation of the contract,
//! backed by memfd segments for the CPU arena and by device backends for
//! device arenas.

mod id;
mod local;

pub use id::{OBJECT_ID_SIZE, ObjectId};
pub use local::{LocalClient, LocalStore, LocalStoreConfig};

use crate::error::{Error, Result};
use crate::tensor::{Device, DeviceType};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Store-side allocation pool.
///
/// Arena 0 is host memory; arena `1 + i` is GPU `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Arena(pub u32);

impl Arena {
    /// The host arena.
    pub const CPU: Arena = Arena(0);

    /// Arena serving `device`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedDevice`] for device kinds the store has no arena
    /// for.
    pub fn for_device(device: Device) -> Result<Self> {
        match device.device_type {
            DeviceType::Cpu => Ok(Arena::CPU),
            DeviceType::Gpu => u32::try_from(device.index)
                .ok()
                .and_then(|i| i.checked_add(1))
                .map(Arena)
                .ok_or(Error::UnsupportedDevice(device)),
            DeviceType::Other(_) => Err(Error::UnsupportedDevice(device)),
        }
    }

    /// Device backing this arena.
    pub fn device(&self) -> Device {
        match self.0 {
            0 => Device::CPU,
            n => Device::gpu((n - 1) as i32),
        }
    }
}

/// Non-owning view of a store buffer.
///
/// The store owns the memory. The view stays valid while the client that
/// produced it holds a reference on the object (between create/get and the
/// matching release).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectBuffer {
    ptr: *mut u8,
    len: usize,
    device: Device,
}

// SAFETY: a plain address range; access rules are the store's contract.
unsafe impl Send for ObjectBuffer {}
unsafe impl Sync for ObjectBuffer {}

impl ObjectBuffer {
    /// Describe a buffer.
    pub fn new(ptr: *mut u8, len: usize, device: Device) -> Self {
        Self { ptr, len, device }
    }

    /// Base address (a device address for device arenas).
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length buffers.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device holding the bytes.
    #[inline]
    pub fn device(&self) -> Device {
        self.device
    }
}

/// A sealed object returned by [`ObjectStore::get`].
#[derive(Debug, Clone, Copy)]
pub struct StoredObject {
    /// Payload bytes.
    pub data: ObjectBuffer,
    /// Metadata bytes, in the same arena as the payload.
    pub metadata: ObjectBuffer,
}

/// One row of [`ObjectStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Identity.
    pub id: ObjectId,
    /// Outstanding references across all clients.
    pub ref_count: usize,
    /// Payload size in bytes.
    pub data_size: usize,
    /// Metadata size in bytes.
    pub metadata_size: usize,
    /// Arena the object lives in.
    pub arena: Arena,
    /// Visible to readers.
    pub sealed: bool,
}

/// Client handle to a shared-memory object store.
///
/// Every method may be called concurrently from any thread. Each successful
/// [`create`](Self::create) or [`get`](Self::get) of an object gives this
/// client one reference on it, which [`release`](Self::release) gives back.
pub trait ObjectStore: Send + Sync {
    /// Allocate an unsealed object of `data_size` bytes tagged with
    /// `metadata`.
    ///
    /// # Errors
    ///
    /// [`Error::ObjectExists`] if the id is occupied,
    /// [`Error::OutOfMemory`] if the arena is full.
    fn create(&self, id: ObjectId, data_size: usize, metadata: &[u8], arena: Arena) -> Result<ObjectBuffer>;

    /// Make a created object immutable and visible to readers.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the object does not exist.
    fn seal(&self, id: ObjectId) -> Result<()>;

    /// Wait up to `timeout` for every id to be sealed.
    ///
    /// Returns one entry per id, `None` for objects that were not available
    /// (absent or unsealed) when the wait ended. Each `Some` entry holds a
    /// new reference.
    fn get(&self, ids: &[ObjectId], timeout: Duration) -> Result<Vec<Option<StoredObject>>>;

    /// Drop one of this client's references.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the object does not exist,
    /// [`Error::DoubleRelease`] if this client holds no reference.
    fn release(&self, id: ObjectId) -> Result<()>;

    /// Remove the object. Deletion of an object that is still referenced is
    /// deferred until the last reference is released.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the object does not exist.
    fn delete(&self, id: ObjectId) -> Result<()>;

    /// Does a live (sealed or unsealed, not deleted) object use this id?
    fn contains(&self, id: ObjectId) -> Result<bool>;

    /// Diagnostic listing of live objects.
    fn list(&self) -> Result<Vec<ObjectInfo>>;

    /// Close the session, dropping every reference this client holds.
    fn disconnect(&self) -> Result<()>;
}

/// Something that can open store sessions.
pub trait StoreConnector {
    /// Connect to the store listening at `endpoint`, retrying until
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] once the deadline passes.
    fn connect(&self, endpoint: &str, timeout: Duration) -> Result<Arc<dyn ObjectStore>>;
}

/// An open store session. Disconnects when dropped.
///
/// Shared through an `Arc` by the manager and every bridge context it
/// creates, so the session outlives every tensor still mapped through it.
pub struct StoreSession {
    client: Arc<dyn ObjectStore>,
    endpoint: String,
}

impl StoreSession {
    /// Open a session through `connector`.
    pub fn connect(connector: &dyn StoreConnector, endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = connector.connect(endpoint, timeout)?;
        tracing::debug!(endpoint, "store session opened");
        Ok(Self::from_client(client, endpoint))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Arc<dyn ObjectStore>, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// The client.
    #[inline]
    pub fn client(&self) -> &dyn ObjectStore {
        self.client.as_ref()
    }

    /// Endpoint this session is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for StoreSession {
    fn drop(&mut self) {
        match self.client.disconnect() {
            Ok(()) => tracing::debug!(endpoint = %self.endpoint, "store session closed"),
            Err(Error::Disconnected) => {}
            Err(e) => tracing::warn!(endpoint = %self.endpoint, error = %e, "store disconnect failed"),
        }
    }
}

impl fmt::Debug for StoreSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreSession").field("endpoint", &self.endpoint).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_for_device() {
        assert_eq!(Arena::for_device(Device::CPU).unwrap(), Arena::CPU);
        assert_eq!(Arena::for_device(Device::gpu(0)).unwrap(), Arena(1));
        assert_eq!(Arena::for_device(Device::gpu(3)).unwrap(), Arena(4));
        assert_eq!(Arena(4).device(), Device::gpu(3));
        assert!(Arena::for_device(Device::gpu(-1)).is_err());
        assert!(matches!(
            Arena::for_device(Device::new(DeviceType::Other(7), 0)),
            Err(Error::UnsupportedDevice(_))
        ));
    }
}

//! In-process reference store.
//!
//! [`LocalStore`] implements the full [`ObjectStore`] contract for a single
//! host:
//!
//! - the CPU arena places each object (payload followed by metadata) in its
//!   own memfd segment, so [`LocalStore::ipc_handle`] can give another
//!   process the same pages
//! - device arenas allocate through the [`DeviceRegistry`]
//! - references are counted per client; releasing without a reference is a
//!   [`Error::DoubleRelease`]
//! - readers block on a condition variable until the object is sealed
//! - deleting a referenced object only marks it; the last release frees it
//! - every arena has a byte capacity

use super::{Arena, ObjectBuffer, ObjectId, ObjectInfo, ObjectStore, StoreConnector, StoredObject};
use crate::device::DeviceRegistry;
use crate::error::{Error, Result};
use crate::memory::{DEFAULT_ALIGNMENT, HeapSegment, IpcHandle, MemorySegment, SharedMemorySegment};
use crate::tensor::Device;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Pause between connection attempts while the store is unavailable.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on a single condition-variable wait when the caller's
/// deadline does not fit in an `Instant`.
const MAX_WAIT_SLICE: Duration = Duration::from_secs(3600);

/// Configuration for a [`LocalStore`].
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Name clients must connect to.
    pub endpoint: String,
    /// Byte capacity of the CPU arena.
    pub cpu_capacity: usize,
    /// Byte capacity of each device arena.
    pub device_capacity: usize,
    /// Whether connections are accepted.
    pub accepting: bool,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "/tmp/shmtensor".to_string(),
            cpu_capacity: 1 << 30,
            device_capacity: 1 << 30,
            accepting: true,
        }
    }
}

impl LocalStoreConfig {
    /// Default configuration listening at `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the CPU arena capacity.
    pub fn with_cpu_capacity(mut self, bytes: usize) -> Self {
        self.cpu_capacity = bytes;
        self
    }

    /// Set the per-device arena capacity.
    pub fn with_device_capacity(mut self, bytes: usize) -> Self {
        self.device_capacity = bytes;
        self
    }

    /// Start accepting (or refusing) connections.
    pub fn with_accepting(mut self, accepting: bool) -> Self {
        self.accepting = accepting;
        self
    }
}

struct Entry {
    /// Payload at offset 0, metadata right after it.
    segment: Arc<dyn MemorySegment>,
    data_size: usize,
    metadata_size: usize,
    arena: Arena,
    sealed: bool,
    /// Delete requested while references were outstanding.
    deleted: bool,
    creator: u64,
    refs: HashMap<u64, usize>,
}

impl Entry {
    fn ref_count(&self) -> usize {
        self.refs.values().sum()
    }

    fn live(&self) -> bool {
        !self.deleted
    }

    fn readable(&self) -> bool {
        self.sealed && !self.deleted
    }

    fn base(&self) -> *mut u8 {
        self.segment.as_ptr().cast_mut()
    }

    fn data(&self) -> ObjectBuffer {
        ObjectBuffer::new(self.base(), self.data_size, self.arena.device())
    }

    fn metadata(&self) -> ObjectBuffer {
        ObjectBuffer::new(
            self.base().wrapping_add(self.data_size),
            self.metadata_size,
            self.arena.device(),
        )
    }

    fn add_ref(&mut self, client: u64) {
        *self.refs.entry(client).or_default() += 1;
    }
}

#[derive(Default)]
struct State {
    objects: HashMap<ObjectId, Entry>,
    used: HashMap<Arena, usize>,
}

impl State {
    fn evict(&mut self, id: ObjectId) {
        if let Some(entry) = self.objects.remove(&id) {
            let total = entry.data_size + entry.metadata_size;
            if let Some(used) = self.used.get_mut(&entry.arena) {
                *used = used.saturating_sub(total);
            }
            tracing::trace!(%id, bytes = total, "evicted object");
        }
    }
}

struct Shared {
    config: LocalStoreConfig,
    registry: Arc<DeviceRegistry>,
    accepting: AtomicBool,
    next_client: AtomicU64,
    state: Mutex<State>,
    sealed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn capacity(&self, arena: Arena) -> usize {
        if arena == Arena::CPU {
            self.config.cpu_capacity
        } else {
            self.config.device_capacity
        }
    }

    fn allocate(&self, id: ObjectId, arena: Arena, total: usize) -> Result<Arc<dyn MemorySegment>> {
        let device = arena.device();
        if !device.is_cpu() {
            return self.registry.alloc(device, total, DEFAULT_ALIGNMENT);
        }
        if total == 0 {
            return Ok(Arc::new(HeapSegment::new(0)?));
        }
        Ok(Arc::new(SharedMemorySegment::new(&format!("shmtensor-{id}"), total)?))
    }

    fn create(&self, client: u64, id: ObjectId, data_size: usize, metadata: &[u8], arena: Arena) -> Result<ObjectBuffer> {
        let total = data_size
            .checked_add(metadata.len())
            .ok_or_else(|| Error::Allocation(format!("object {id} size overflows")))?;

        let mut state = self.lock();
        if state.objects.contains_key(&id) {
            return Err(Error::ObjectExists(id));
        }
        let used = state.used.get(&arena).copied().unwrap_or(0);
        let capacity = self.capacity(arena);
        if used.checked_add(total).is_none_or(|t| t > capacity) {
            return Err(Error::OutOfMemory {
                requested: total,
                available: capacity.saturating_sub(used),
            });
        }

        let segment = self.allocate(id, arena, total)?;
        let device = arena.device();
        if !metadata.is_empty() {
            // SAFETY: the segment holds `total` bytes and the metadata region
            // starts at `data_size`.
            unsafe {
                self.registry.copy_bytes(
                    segment.as_ptr().cast_mut().add(data_size),
                    metadata.as_ptr(),
                    metadata.len(),
                    Device::CPU,
                    device,
                    None,
                )?;
            }
        }

        let mut entry = Entry {
            segment,
            data_size,
            metadata_size: metadata.len(),
            arena,
            sealed: false,
            deleted: false,
            creator: client,
            refs: HashMap::new(),
        };
        entry.add_ref(client);
        let buffer = entry.data();
        *state.used.entry(arena).or_default() += total;
        state.objects.insert(id, entry);
        tracing::debug!(%id, data_size, arena = arena.0, "created object");
        Ok(buffer)
    }

    fn seal(&self, id: ObjectId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .objects
            .get_mut(&id)
            .filter(|e| e.live())
            .ok_or(Error::NotFound(id))?;
        entry.sealed = true;
        drop(state);
        self.sealed.notify_all();
        tracing::debug!(%id, "sealed object");
        Ok(())
    }

    fn get(&self, client: u64, ids: &[ObjectId], timeout: Duration) -> Vec<Option<StoredObject>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            let ready = ids
                .iter()
                .all(|id| state.objects.get(id).is_some_and(Entry::readable));
            if ready {
                break;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => MAX_WAIT_SLICE,
            };
            if remaining.is_zero() {
                break;
            }
            let (guard, _) = self
                .sealed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }

        ids.iter()
            .map(|id| {
                let entry = state.objects.get_mut(id).filter(|e| e.readable())?;
                entry.add_ref(client);
                Some(StoredObject {
                    data: entry.data(),
                    metadata: entry.metadata(),
                })
            })
            .collect()
    }

    fn release(&self, client: u64, id: ObjectId) -> Result<()> {
        let mut state = self.lock();
        let entry = state.objects.get_mut(&id).ok_or(Error::NotFound(id))?;
        match entry.refs.get_mut(&client) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                entry.refs.remove(&client);
            }
            None => return Err(Error::DoubleRelease(id)),
        }
        if entry.deleted && entry.refs.is_empty() {
            state.evict(id);
        }
        Ok(())
    }

    fn delete(&self, id: ObjectId) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .objects
            .get_mut(&id)
            .filter(|e| e.live())
            .ok_or(Error::NotFound(id))?;
        if entry.refs.is_empty() {
            state.evict(id);
        } else {
            entry.deleted = true;
            tracing::debug!(%id, refs = entry.ref_count(), "deferred delete of referenced object");
        }
        Ok(())
    }

    fn disconnect(&self, client: u64) {
        let mut state = self.lock();
        let mut doomed = Vec::new();
        for (id, entry) in state.objects.iter_mut() {
            entry.refs.remove(&client);
            let orphaned = !entry.sealed && entry.creator == client;
            if entry.refs.is_empty() && (entry.deleted || orphaned) {
                doomed.push(*id);
            }
        }
        for id in doomed {
            state.evict(id);
        }
    }
}

/// In-process object store. Cheap to clone; clones share the same objects.
///
/// # Example
///
/// ```rust
/// use shmtensor::store::{Arena, LocalStore, LocalStoreConfig, ObjectId, ObjectStore};
/// use std::time::Duration;
///
/// let store = LocalStore::host_only(LocalStoreConfig::default());
/// let client = store.client();
/// let id = ObjectId::from_name("greeting");
/// let buf = client.create(id, 5, b"meta", Arena::CPU)?;
/// unsafe { std::ptr::copy_nonoverlapping(b"hello".as_ptr(), buf.as_ptr(), 5) };
/// client.seal(id)?;
///
/// let got = client.get(&[id], Duration::from_millis(10))?;
/// assert!(got[0].is_some());
/// # Ok::<(), shmtensor::Error>(())
/// ```
#[derive(Clone)]
pub struct LocalStore {
    shared: Arc<Shared>,
}

impl LocalStore {
    /// Create a store whose device arenas allocate through `registry`.
    pub fn new(config: LocalStoreConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                accepting: AtomicBool::new(config.accepting),
                config,
                registry,
                next_client: AtomicU64::new(1),
                state: Mutex::new(State::default()),
                sealed: Condvar::new(),
            }),
        }
    }

    /// Create a store with only the CPU arena usable.
    pub fn host_only(config: LocalStoreConfig) -> Self {
        Self::new(config, Arc::new(DeviceRegistry::new()))
    }

    /// Open a client directly, bypassing the endpoint check.
    pub fn client(&self) -> LocalClient {
        let id = self.shared.next_client.fetch_add(1, Ordering::Relaxed);
        LocalClient {
            shared: self.shared.clone(),
            id,
            connected: AtomicBool::new(true),
        }
    }

    /// Endpoint clients connect to.
    pub fn endpoint(&self) -> &str {
        &self.shared.config.endpoint
    }

    /// Start or stop accepting connections.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::Release);
    }

    /// Whether connections are accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Bytes in use in `arena`, including objects pending deletion.
    pub fn used_bytes(&self, arena: Arena) -> usize {
        self.shared.lock().used.get(&arena).copied().unwrap_or(0)
    }

    /// Number of resident objects, including those pending deletion.
    pub fn object_count(&self) -> usize {
        self.shared.lock().objects.len()
    }

    /// Handle for mapping the object's pages from another process.
    ///
    /// The fd stays valid while the object is resident. Returns `None` for
    /// device-arena and zero-sized objects.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the object does not exist.
    pub fn ipc_handle(&self, id: ObjectId) -> Result<Option<IpcHandle>> {
        let state = self.shared.lock();
        let entry = state
            .objects
            .get(&id)
            .filter(|e| e.live())
            .ok_or(Error::NotFound(id))?;
        Ok(entry.segment.ipc_handle())
    }
}

impl StoreConnector for LocalStore {
    fn connect(&self, endpoint: &str, timeout: Duration) -> Result<Arc<dyn ObjectStore>> {
        let start = Instant::now();
        loop {
            let cause = if endpoint != self.endpoint() {
                format!("no store listening at {endpoint}")
            } else if !self.is_accepting() {
                "store is not accepting connections".to_string()
            } else {
                let client = self.client();
                tracing::debug!(endpoint, client = client.id, "client connected");
                return Ok(Arc::new(client));
            };

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                tracing::warn!(endpoint, ?timeout, %cause, "store connection failed");
                return Err(Error::Connection {
                    endpoint: endpoint.to_string(),
                    timeout,
                    cause,
                });
            }
            std::thread::sleep(CONNECT_RETRY_INTERVAL.min(timeout - elapsed));
        }
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("endpoint", &self.endpoint())
            .field("objects", &self.object_count())
            .finish()
    }
}

/// A client session on a [`LocalStore`].
///
/// Dropping the client disconnects it: its references are released and
/// objects it created but never sealed are aborted.
pub struct LocalClient {
    shared: Arc<Shared>,
    id: u64,
    connected: AtomicBool,
}

impl LocalClient {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Disconnected)
        }
    }
}

impl ObjectStore for LocalClient {
    fn create(&self, id: ObjectId, data_size: usize, metadata: &[u8], arena: Arena) -> Result<ObjectBuffer> {
        self.ensure_connected()?;
        self.shared.create(self.id, id, data_size, metadata, arena)
    }

    fn seal(&self, id: ObjectId) -> Result<()> {
        self.ensure_connected()?;
        self.shared.seal(id)
    }

    fn get(&self, ids: &[ObjectId], timeout: Duration) -> Result<Vec<Option<StoredObject>>> {
        self.ensure_connected()?;
        Ok(self.shared.get(self.id, ids, timeout))
    }

    fn release(&self, id: ObjectId) -> Result<()> {
        self.ensure_connected()?;
        self.shared.release(self.id, id)
    }

    fn delete(&self, id: ObjectId) -> Result<()> {
        self.ensure_connected()?;
        self.shared.delete(id)
    }

    fn contains(&self, id: ObjectId) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.shared.lock().objects.get(&id).is_some_and(Entry::live))
    }

    fn list(&self) -> Result<Vec<ObjectInfo>> {
        self.ensure_connected()?;
        let state = self.shared.lock();
        let mut infos: Vec<_> = state
            .objects
            .iter()
            .filter(|(_, e)| e.live())
            .map(|(id, e)| ObjectInfo {
                id: *id,
                ref_count: e.ref_count(),
                data_size: e.data_size,
                metadata_size: e.metadata_size,
                arena: e.arena,
                sealed: e.sealed,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        Ok(infos)
    }

    fn disconnect(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Err(Error::Disconnected);
        }
        self.shared.disconnect(self.id);
        tracing::debug!(client = self.id, "client disconnected");
        Ok(())
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if self.connected.load(Ordering::Acquire) {
            let _ = self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalStore {
        LocalStore::host_only(LocalStoreConfig::new("test-store").with_cpu_capacity(4096))
    }

    fn put_bytes(client: &LocalClient, name: &str, bytes: &[u8]) -> ObjectId {
        let id = ObjectId::from_name(name);
        let buf = client.create(id, bytes.len(), b"m", Arena::CPU).unwrap();
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_ptr(), bytes.len()) };
        client.seal(id).unwrap();
        id
    }

    #[test]
    fn test_create_seal_get() {
        let store = store();
        let producer = store.client();
        let consumer = store.client();
        let id = put_bytes(&producer, "a", b"payload");

        let got = consumer.get(&[id], Duration::ZERO).unwrap();
        let obj = got[0].unwrap();
        assert_eq!(obj.data.len(), 7);
        unsafe {
            assert_eq!(std::slice::from_raw_parts(obj.data.as_ptr(), 7), b"payload");
            assert_eq!(*obj.metadata.as_ptr(), b'm');
        }
        assert_eq!(producer.list().unwrap()[0].ref_count, 2);
    }

    #[test]
    fn test_create_existing_id_fails() {
        let store = store();
        let client = store.client();
        let id = put_bytes(&client, "dup", b"x");
        assert!(matches!(
            client.create(id, 1, &[], Arena::CPU),
            Err(Error::ObjectExists(_))
        ));
    }

    #[test]
    fn test_get_unsealed_times_out() {
        let store = store();
        let client = store.client();
        let id = ObjectId::from_name("pending");
        client.create(id, 8, &[], Arena::CPU).unwrap();
        let start = Instant::now();
        let got = client.get(&[id], Duration::from_millis(30)).unwrap();
        assert!(got[0].is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(client.contains(id).unwrap());
    }

    #[test]
    fn test_get_wakes_on_seal() {
        let store = store();
        let producer = store.client();
        let id = ObjectId::from_name("later");
        producer.create(id, 4, &[], Arena::CPU).unwrap();

        let reader = store.clone();
        let handle = std::thread::spawn(move || {
            let consumer = reader.client();
            consumer.get(&[id], Duration::from_secs(5)).unwrap()[0].is_some()
        });
        std::thread::sleep(Duration::from_millis(20));
        producer.seal(id).unwrap();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_double_release() {
        let store = store();
        let client = store.client();
        let id = put_bytes(&client, "r", b"abc");
        client.release(id).unwrap();
        assert!(matches!(client.release(id), Err(Error::DoubleRelease(_))));
        assert!(matches!(
            client.release(ObjectId::from_name("missing")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_deferred_until_release() {
        let store = store();
        let client = store.client();
        let id = put_bytes(&client, "d", b"abcd");
        client.delete(id).unwrap();
        assert!(!client.contains(id).unwrap());
        assert_eq!(store.object_count(), 1);
        assert!(matches!(client.delete(id), Err(Error::NotFound(_))));
        assert!(matches!(client.create(id, 1, &[], Arena::CPU), Err(Error::ObjectExists(_))));

        client.release(id).unwrap();
        assert_eq!(store.object_count(), 0);
        assert_eq!(store.used_bytes(Arena::CPU), 0);
        client.create(id, 1, &[], Arena::CPU).unwrap();
    }

    #[test]
    fn test_capacity_limit() {
        let store = store();
        let client = store.client();
        let err = client
            .create(ObjectId::from_name("big"), 5000, &[], Arena::CPU)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { requested: 5000, available: 4096 }));
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn test_disconnect_aborts_unsealed_and_drops_refs() {
        let store = store();
        let keeper = store.client();
        let sealed = put_bytes(&keeper, "kept", b"k");
        {
            let client = store.client();
            client.create(ObjectId::from_name("orphan"), 8, &[], Arena::CPU).unwrap();
            client.get(&[sealed], Duration::ZERO).unwrap();
            assert_eq!(store.object_count(), 2);
        }
        assert_eq!(store.object_count(), 1);
        assert_eq!(keeper.list().unwrap()[0].ref_count, 1);

        keeper.disconnect().unwrap();
        assert!(matches!(keeper.contains(sealed), Err(Error::Disconnected)));
        assert!(matches!(keeper.disconnect(), Err(Error::Disconnected)));
    }

    #[test]
    fn test_connect_deadline() {
        let store = LocalStore::host_only(LocalStoreConfig::new("ep").with_accepting(false));
        let err = store.connect("ep", Duration::from_millis(20)).err().unwrap();
        assert!(matches!(err, Error::Connection { .. }));
        assert!(store.connect("other", Duration::ZERO).is_err());

        store.set_accepting(true);
        assert!(store.connect("ep", Duration::ZERO).is_ok());
    }

    #[test]
    fn test_ipc_handle_maps_same_pages() {
        let store = store();
        let client = store.client();
        let id = put_bytes(&client, "ipc", b"shared!");
        let handle = store.ipc_handle(id).unwrap().unwrap();
        let mapping = unsafe { SharedMemorySegment::from_ipc(handle).unwrap() };
        unsafe { assert_eq!(&mapping.as_slice()[..7], b"shared!") };
    }

    #[test]
    fn test_device_arena() {
        let registry = Arc::new(DeviceRegistry::with_simulated_gpu(1, 1 << 16));
        let store = LocalStore::new(LocalStoreConfig::default(), registry.clone());
        let client = store.client();
        let id = ObjectId::from_name("dev");
        let buf = client.create(id, 16, b"hdr", Arena(1)).unwrap();
        assert_eq!(buf.device(), Device::gpu(0));
        client.seal(id).unwrap();
        assert_eq!(store.ipc_handle(id).unwrap(), None);

        let obj = client.get(&[id], Duration::ZERO).unwrap()[0].unwrap();
        let mut meta = [0u8; 3];
        unsafe {
            registry
                .copy_bytes(meta.as_mut_ptr(), obj.metadata.as_ptr(), 3, Device::gpu(0), Device::CPU, None)
                .unwrap();
        }
        assert_eq!(&meta, b"hdr");
        assert!(client.create(ObjectId::from_name("x"), 1, &[], Arena(2)).is_err());
    }
}

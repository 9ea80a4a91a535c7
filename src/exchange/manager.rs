//! The exchange façade: put tensors into the store and get them back.

use super::context::{DeletionPolicy, StoreBridgeContext};
use super::copy::ParallelCopier;
use super::metadata::TensorHeader;
use crate::config::ExchangeConfig;
use crate::device::DeviceRegistry;
use crate::error::{Error, Result};
use crate::observability::{ExchangeMetrics, record_delete, record_release, trace_ignored_not_found};
use crate::store::{Arena, ObjectBuffer, ObjectId, ObjectStore, StoreConnector, StoreSession};
use crate::tensor::{DataType, Device, ManagedTensor, TensorDescriptor, TensorHandle, byte_size};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Producer and consumer entry point to the object store.
///
/// A manager owns one store session, shared by reference count with every
/// tensor it hands out, so the session stays open until the last of them is
/// released. All methods take `&self` and may be called from any thread;
/// the store does its own locking.
///
/// # Example
///
/// ```rust
/// use shmtensor::prelude::*;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let registry = Arc::new(DeviceRegistry::new());
/// let store = LocalStore::new(LocalStoreConfig::new("/tmp/doc-manager"), registry.clone());
/// let manager = ExchangeManager::connect(&store, registry.clone(), ExchangeConfig::new("/tmp/doc-manager"))?;
///
/// let input = TensorHandle::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], Device::CPU, &registry)?;
/// let id = ObjectId::from_name("weights");
/// let stored = manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true)?;
/// drop(stored);
///
/// let fetched = TensorHandle::from_managed(manager.get(id, Duration::from_millis(100))?);
/// assert_eq!(fetched.shape(), &[2, 2]);
/// assert_eq!(fetched.to_vec::<f32>(&registry)?, vec![1.0, 2.0, 3.0, 4.0]);
/// # Ok::<(), shmtensor::Error>(())
/// ```
pub struct ExchangeManager {
    session: Arc<StoreSession>,
    registry: Arc<DeviceRegistry>,
    copier: ParallelCopier,
    metrics: ExchangeMetrics,
    config: ExchangeConfig,
}

impl ExchangeManager {
    /// Connect to the store at `config.endpoint`.
    ///
    /// # Errors
    ///
    /// [`Error::Connection`] if the store is unreachable within
    /// `config.connect_timeout`.
    pub fn connect(
        connector: &dyn StoreConnector,
        registry: Arc<DeviceRegistry>,
        config: ExchangeConfig,
    ) -> Result<Self> {
        let session = StoreSession::connect(connector, &config.endpoint, config.connect_timeout)?;
        Self::with_session(Arc::new(session), registry, config)
    }

    /// Build a manager over an open session.
    ///
    /// # Errors
    ///
    /// [`Error::Allocation`] if the memcpy workers cannot be started.
    pub fn with_session(
        session: Arc<StoreSession>,
        registry: Arc<DeviceRegistry>,
        config: ExchangeConfig,
    ) -> Result<Self> {
        let copier = ParallelCopier::new(config.memcopy_threads, config.memcopy_threshold)?;
        let metrics = ExchangeMetrics::new(session.endpoint());
        tracing::info!(
            endpoint = session.endpoint(),
            memcopy_threads = copier.threads(),
            "exchange manager ready"
        );
        Ok(Self {
            session,
            registry,
            copier,
            metrics,
            config,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// The device registry copies go through.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// The shared store session.
    pub fn session(&self) -> &Arc<StoreSession> {
        &self.session
    }

    fn client(&self) -> &dyn ObjectStore {
        self.session.client()
    }

    fn track<T>(&self, operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_failure(operation, e.kind());
            tracing::debug!(operation, error = %e, "exchange operation failed");
        }
        result
    }

    /// Copy `src` into the store under `id` and return a tensor aliasing the
    /// sealed object.
    ///
    /// The source stays owned by the caller, who usually drops it right
    /// after. With `delete_before_create`, an existing object under `id` is
    /// deleted first (a missing one is ignored).
    ///
    /// # Errors
    ///
    /// - [`Error::NonContiguousInput`] for strided sources, before any store
    ///   call.
    /// - [`Error::UnsupportedDevice`] for devices without an arena.
    /// - [`Error::ObjectExists`] / [`Error::OutOfMemory`] from the store.
    /// - [`Error::Copy`] if the payload copy fails. The object is then left
    ///   unsealed and this client's reference is dropped.
    pub fn put(
        &self,
        src: &ManagedTensor,
        id: ObjectId,
        policy: DeletionPolicy,
        delete_before_create: bool,
    ) -> Result<ManagedTensor> {
        // SAFETY: a ManagedTensor keeps its memory valid until its deleter
        // fires, which cannot happen while it is borrowed.
        unsafe { self.put_descriptor(src.descriptor(), id, policy, delete_before_create) }
    }

    /// [`put`](Self::put) for a handle.
    ///
    /// # Errors
    ///
    /// As [`put`](Self::put).
    pub fn put_handle(
        &self,
        src: &TensorHandle,
        id: ObjectId,
        policy: DeletionPolicy,
        delete_before_create: bool,
    ) -> Result<ManagedTensor> {
        // SAFETY: the handle keeps its container, and so its memory, alive.
        unsafe { self.put_descriptor(src.descriptor(), id, policy, delete_before_create) }
    }

    /// [`put`](Self::put) for a bare descriptor.
    ///
    /// # Errors
    ///
    /// As [`put`](Self::put).
    ///
    /// # Safety
    ///
    /// `src` must describe memory readable for its byte size on
    /// `src.device` for the duration of the call.
    pub unsafe fn put_descriptor(
        &self,
        src: &TensorDescriptor,
        id: ObjectId,
        policy: DeletionPolicy,
        delete_before_create: bool,
    ) -> Result<ManagedTensor> {
        let _span = self.config.tracing.operation("put", id).entered();
        // SAFETY: caller contract.
        let result = unsafe { self.put_inner(src, id, policy, delete_before_create) };
        self.track("put", result)
    }

    unsafe fn put_inner(
        &self,
        src: &TensorDescriptor,
        id: ObjectId,
        policy: DeletionPolicy,
        delete_before_create: bool,
    ) -> Result<ManagedTensor> {
        src.ensure_contiguous()?;
        let nbytes = src.byte_size()?;
        let arena = Arena::for_device(src.device)?;
        let header = TensorHeader::new(src.device, src.dtype, &src.shape);

        if delete_before_create {
            self.delete_ignoring_missing(id)?;
        }

        let buffer = {
            let _call = self.config.tracing.store_call("create", id).entered();
            self.client().create(id, nbytes, &header.encode(), arena)?
        };

        // SAFETY: caller contract for `src`; the store buffer holds `nbytes`.
        if let Err(e) = unsafe { self.copy_in(&buffer, src, nbytes) } {
            self.abandon(id, "copy");
            return Err(e);
        }

        {
            let _call = self.config.tracing.store_call("seal", id).entered();
            if let Err(e) = self.client().seal(id) {
                self.abandon(id, "seal");
                return Err(e);
            }
        }

        self.metrics.record_put(nbytes);
        tracing::debug!(%id, bytes = nbytes, dtype = %src.dtype, device = %src.device, "put sealed");
        let ctx = StoreBridgeContext::new(self.session.clone(), id, buffer);
        // SAFETY: the buffer holds the payload and `ctx` owns the reference
        // taken by create.
        Ok(unsafe { ctx.into_managed(&header, policy) })
    }

    fn delete_ignoring_missing(&self, id: ObjectId) -> Result<()> {
        let _call = self.config.tracing.store_call("delete", id).entered();
        match self.client().delete(id) {
            Ok(()) => {
                tracing::debug!(%id, "deleted existing object before create");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                trace_ignored_not_found(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the reference taken by a create that will never be sealed.
    fn abandon(&self, id: ObjectId, stage: &'static str) {
        if let Err(e) = self.client().release(id) {
            tracing::warn!(%id, stage, error = %e, "failed to release unsealed object");
        }
    }

    unsafe fn copy_in(&self, buffer: &ObjectBuffer, src: &TensorDescriptor, nbytes: usize) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        let _timer = self.metrics.start_copy_timer();
        if src.device.is_cpu() && buffer.device().is_cpu() {
            // SAFETY: both ranges are host memory of `nbytes`; the store
            // buffer is freshly allocated so they cannot overlap.
            unsafe { self.copier.copy(buffer.as_ptr(), src.data_ptr(), nbytes) }
        } else {
            // SAFETY: as above, through the device backends.
            unsafe {
                self.registry
                    .copy_bytes(buffer.as_ptr(), src.data_ptr(), nbytes, src.device, buffer.device(), None)?;
            }
            self.registry.synchronize(buffer.device(), None)
        }
    }

    /// Wait up to `timeout` for `id` to be sealed and map it with a
    /// release-only deleter.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no object exists under `id` when the wait
    ///   ends.
    /// - [`Error::Timeout`] if the object exists but was not sealed in time.
    /// - [`Error::InvalidMetadata`] if the header cannot be decoded or
    ///   disagrees with the payload size.
    pub fn get(&self, id: ObjectId, timeout: Duration) -> Result<ManagedTensor> {
        self.get_with_policy(id, timeout, DeletionPolicy::ReleaseOnly)
    }

    /// [`get`](Self::get) with an explicit deleter policy.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn get_with_policy(&self, id: ObjectId, timeout: Duration, policy: DeletionPolicy) -> Result<ManagedTensor> {
        let _span = self.config.tracing.operation("get", id).entered();
        let result = self.get_inner(id, timeout, policy);
        self.track("get", result)
    }

    fn get_inner(&self, id: ObjectId, timeout: Duration, policy: DeletionPolicy) -> Result<ManagedTensor> {
        let object = {
            let _call = self.config.tracing.store_call("get", id).entered();
            self.client().get(&[id], timeout)?.into_iter().next().flatten()
        };
        let Some(object) = object else {
            return Err(if self.client().contains(id)? {
                Error::Timeout { id, timeout }
            } else {
                Error::NotFound(id)
            });
        };

        let ctx = StoreBridgeContext::new(self.session.clone(), id, object.data);
        let header = match self.read_header(&object.metadata, object.data.len()) {
            Ok(header) => header,
            Err(e) => {
                if let Err(release) = ctx.release() {
                    tracing::warn!(%id, error = %release, "failed to release object with bad metadata");
                }
                return Err(e);
            }
        };

        self.metrics.record_get(object.data.len());
        tracing::debug!(%id, bytes = object.data.len(), dtype = %header.dtype, device = %header.device, "got object");
        // SAFETY: the payload size was checked against the header and the
        // context owns the reference taken by get.
        Ok(unsafe { ctx.into_managed(&header, policy) })
    }

    fn read_header(&self, metadata: &ObjectBuffer, data_len: usize) -> Result<TensorHeader> {
        let mut host = vec![0u8; metadata.len()];
        if !metadata.is_empty() {
            // SAFETY: the caller holds a reference on the object, so the
            // metadata buffer stays mapped for this copy.
            unsafe {
                self.registry.copy_bytes(
                    host.as_mut_ptr(),
                    metadata.as_ptr(),
                    metadata.len(),
                    metadata.device(),
                    Device::CPU,
                    None,
                )?;
            }
        }
        let header = TensorHeader::decode(&host)?;
        let expected = byte_size(&header.shape, header.dtype)?;
        if expected != data_len {
            return Err(Error::InvalidMetadata(format!(
                "header describes {expected} bytes but the object holds {data_len}"
            )));
        }
        Ok(header)
    }

    /// Allocate an uninitialized store-owned tensor and seal it right away.
    ///
    /// The object is visible to readers as soon as this returns, before the
    /// caller writes the payload. Use [`reserve`](Self::reserve) when readers
    /// must only see finished data.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedDevice`], [`Error::ObjectExists`],
    /// [`Error::OutOfMemory`].
    pub fn create(&self, id: ObjectId, shape: &[i64], dtype: DataType, device: Device) -> Result<ManagedTensor> {
        let _span = self.config.tracing.operation("create", id).entered();
        let result = self.reserve_inner(id, shape, dtype, device).and_then(PendingTensor::seal);
        if result.is_ok() {
            self.metrics.record_create();
        }
        self.track("create", result)
    }

    /// Allocate an unsealed store-owned tensor.
    ///
    /// Readers cannot see it until [`PendingTensor::seal`]. Dropping the
    /// pending tensor aborts the object.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create).
    pub fn reserve(&self, id: ObjectId, shape: &[i64], dtype: DataType, device: Device) -> Result<PendingTensor> {
        let _span = self.config.tracing.operation("reserve", id).entered();
        let result = self.reserve_inner(id, shape, dtype, device);
        if result.is_ok() {
            self.metrics.record_create();
        }
        self.track("reserve", result)
    }

    fn reserve_inner(&self, id: ObjectId, shape: &[i64], dtype: DataType, device: Device) -> Result<PendingTensor> {
        let nbytes = byte_size(shape, dtype)?;
        let arena = Arena::for_device(device)?;
        let header = TensorHeader::new(device, dtype, shape);
        let buffer = {
            let _call = self.config.tracing.store_call("create", id).entered();
            self.client().create(id, nbytes, &header.encode(), arena)?
        };
        Ok(PendingTensor {
            ctx: Some(StoreBridgeContext::new(self.session.clone(), id, buffer)),
            header,
            policy: self.config.default_policy,
            registry: self.registry.clone(),
        })
    }

    /// Drop one of this process's references on `id`.
    ///
    /// # Errors
    ///
    /// Store failures propagate unchanged, including
    /// [`Error::DoubleRelease`] when no reference is held.
    pub fn release(&self, id: ObjectId) -> Result<()> {
        let _span = self.config.tracing.operation("release", id).entered();
        let result = self.client().release(id);
        if result.is_ok() {
            record_release(self.session.endpoint());
        }
        self.track("release", result)
    }

    /// Remove `id` from the store, deferred while it is still referenced.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if no live object uses the id.
    pub fn delete(&self, id: ObjectId) -> Result<()> {
        let _span = self.config.tracing.operation("delete", id).entered();
        let result = self.client().delete(id);
        if result.is_ok() {
            record_delete(self.session.endpoint());
        }
        self.track("delete", result)
    }

    /// Does a live object use `id`?
    ///
    /// # Errors
    ///
    /// Store failures, e.g. [`Error::Disconnected`].
    pub fn contains(&self, id: ObjectId) -> Result<bool> {
        self.client().contains(id)
    }

    /// Live objects and their reference counts.
    ///
    /// # Errors
    ///
    /// Store failures, e.g. [`Error::Disconnected`].
    pub fn list(&self) -> Result<Vec<(ObjectId, usize)>> {
        Ok(self.client().list()?.into_iter().map(|info| (info.id, info.ref_count)).collect())
    }

    /// Put `handle` under a fresh random id using the configured defaults.
    ///
    /// Ids come from [`ObjectId::random_unique`], so producers in different
    /// processes sharing one store do not replace each other's objects.
    ///
    /// # Errors
    ///
    /// As [`put`](Self::put).
    pub fn share(&self, handle: &TensorHandle) -> Result<(ObjectId, ManagedTensor)> {
        let id = ObjectId::random_unique();
        let stored = self.put_handle(handle, id, self.config.default_policy, self.config.delete_before_create)?;
        Ok((id, stored))
    }

    /// Fetch `id` as a handle, waiting up to `config.get_timeout`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get).
    pub fn rebuild(&self, id: ObjectId) -> Result<TensorHandle> {
        Ok(TensorHandle::from_managed(self.get(id, self.config.get_timeout)?))
    }
}

impl fmt::Debug for ExchangeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeManager")
            .field("endpoint", &self.session.endpoint())
            .field("copier", &self.copier)
            .field("config", &self.config)
            .finish()
    }
}

/// A created but unsealed store object.
///
/// Write the payload, then [`seal`](Self::seal). Dropping without sealing
/// releases the reference and deletes the object.
pub struct PendingTensor {
    ctx: Option<StoreBridgeContext>,
    header: TensorHeader,
    policy: DeletionPolicy,
    registry: Arc<DeviceRegistry>,
}

impl PendingTensor {
    /// Object id.
    pub fn id(&self) -> Option<ObjectId> {
        self.ctx.as_ref().map(StoreBridgeContext::id)
    }

    /// Shape.
    pub fn shape(&self) -> &[i64] {
        &self.header.shape
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.header.dtype
    }

    /// Device holding the buffer.
    pub fn device(&self) -> Device {
        self.header.device
    }

    /// Raw buffer address (a device address for device arenas).
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ctx.as_ref().map_or(std::ptr::null_mut(), |ctx| ctx.buffer().as_ptr())
    }

    /// Buffer size in bytes.
    pub fn len(&self) -> usize {
        self.ctx.as_ref().map_or(0, |ctx| ctx.buffer().len())
    }

    /// True for zero-byte tensors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deleter policy the sealed tensor will carry.
    pub fn with_policy(mut self, policy: DeletionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fill the buffer from host bytes.
    ///
    /// # Errors
    ///
    /// [`Error::ShapeMismatch`] if `bytes` is not exactly the buffer size,
    /// [`Error::Copy`] from the device backend.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(buffer) = self.ctx.as_ref().map(StoreBridgeContext::buffer) else {
            return Ok(());
        };
        if bytes.len() != buffer.len() {
            return Err(Error::ShapeMismatch {
                expected: buffer.len(),
                actual: bytes.len(),
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }
        // SAFETY: the unsealed buffer is exclusively ours and holds `len` bytes.
        unsafe {
            self.registry
                .copy_bytes(buffer.as_ptr(), bytes.as_ptr(), bytes.len(), Device::CPU, buffer.device(), None)
        }
    }

    /// Seal the object and return the store-backed tensor.
    ///
    /// # Errors
    ///
    /// Store failures from seal; the object is aborted in that case.
    pub fn seal(mut self) -> Result<ManagedTensor> {
        let Some(ctx) = self.ctx.take() else {
            return Err(Error::InvalidMetadata("pending tensor already consumed".into()));
        };
        let id = ctx.id();
        if let Err(e) = ctx.seal() {
            abort(&ctx);
            return Err(e);
        }
        tracing::debug!(%id, "sealed reserved object");
        // SAFETY: the buffer was allocated for `header` and `ctx` owns the
        // create reference.
        Ok(unsafe { ctx.into_managed(&self.header, self.policy) })
    }
}

fn abort(ctx: &StoreBridgeContext) {
    let id = ctx.id();
    let result = ctx.release().and_then(|()| ctx.delete());
    match result {
        Ok(()) => tracing::debug!(%id, "aborted unsealed object"),
        Err(e) => tracing::warn!(%id, error = %e, "failed to abort unsealed object"),
    }
}

impl Drop for PendingTensor {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            abort(&ctx);
        }
    }
}

impl fmt::Debug for PendingTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTensor")
            .field("id", &self.id())
            .field("shape", &self.header.shape)
            .field("dtype", &self.header.dtype)
            .field("device", &self.header.device)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LocalStore, LocalStoreConfig};
    use crate::tensor::Deleter;

    fn setup(endpoint: &str) -> (LocalStore, Arc<DeviceRegistry>, ExchangeManager) {
        let registry = Arc::new(DeviceRegistry::with_simulated_gpu(2, 1 << 20));
        let store = LocalStore::new(LocalStoreConfig::new(endpoint), registry.clone());
        let config = ExchangeConfig::new(endpoint).with_memcopy_threads(2).with_memcopy_threshold(16);
        let manager = ExchangeManager::connect(&store, registry.clone(), config).unwrap();
        (store, registry, manager)
    }

    #[test]
    fn test_put_get_roundtrip_cpu() {
        let (_store, registry, manager) = setup("/tmp/mgr-roundtrip");
        let values: Vec<i32> = (0..24).collect();
        let input = TensorHandle::from_slice(&values, &[2, 3, 4], Device::CPU, &registry).unwrap();
        let id = ObjectId::from_name("cube");

        let stored = manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap();
        assert_eq!(stored.strides(), Some(&[12i64, 4, 1][..]));
        assert_eq!(stored.object_id(), Some(id));
        drop(stored);

        let fetched = manager.rebuild(id).unwrap();
        assert_eq!(fetched.shape(), &[2, 3, 4]);
        assert_eq!(fetched.dtype(), DataType::I32);
        assert_eq!(fetched.to_vec::<i32>(&registry).unwrap(), values);
    }

    #[test]
    fn test_put_without_delete_before_create_collides() {
        let (_store, registry, manager) = setup("/tmp/mgr-collide");
        let input = TensorHandle::from_slice(&[1u8, 2], &[2], Device::CPU, &registry).unwrap();
        let id = ObjectId::from_name("dup");
        let first = manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, false).unwrap();
        drop(first);
        assert!(matches!(
            manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, false),
            Err(Error::ObjectExists(_))
        ));
        let second = manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap();
        assert_eq!(second.host_bytes(), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_put_rejects_strided_input_without_store_calls() {
        let (store, _registry, manager) = setup("/tmp/mgr-strided");
        let mut data = [0f32; 6];
        let desc =
            TensorDescriptor::new(data.as_mut_ptr().cast(), Device::CPU, DataType::F32, &[2, 3]).with_strides(&[1, 2]);
        let input = unsafe { ManagedTensor::borrowed(desc) };
        let id = ObjectId::from_name("strided");
        assert!(matches!(
            manager.put(&input, id, DeletionPolicy::ReleaseOnly, true),
            Err(Error::NonContiguousInput { .. })
        ));
        assert!(!manager.contains(id).unwrap());
        assert_eq!(store.object_count(), 0);
    }

    #[test]
    fn test_get_missing_and_unsealed() {
        let (_store, _registry, manager) = setup("/tmp/mgr-missing");
        let id = ObjectId::from_name("nothing");
        assert!(matches!(
            manager.get(id, Duration::from_millis(5)),
            Err(Error::NotFound(_))
        ));

        let pending = manager.reserve(id, &[4], DataType::U8, Device::CPU).unwrap();
        assert!(matches!(
            manager.get(id, Duration::from_millis(5)),
            Err(Error::Timeout { .. })
        ));
        drop(pending);
        assert!(!manager.contains(id).unwrap());
    }

    #[test]
    fn test_reserve_write_seal() {
        let (_store, _registry, manager) = setup("/tmp/mgr-reserve");
        let id = ObjectId::from_name("reserved");
        let mut pending = manager.reserve(id, &[2, 2], DataType::U8, Device::CPU).unwrap();
        assert_eq!(pending.len(), 4);
        assert!(matches!(pending.write(&[1, 2, 3]), Err(Error::ShapeMismatch { .. })));
        pending.write(&[1, 2, 3, 4]).unwrap();
        let sealed = pending.seal().unwrap();
        assert_eq!(sealed.host_bytes(), Some(&[1u8, 2, 3, 4][..]));

        let again = manager.get(id, Duration::from_millis(5)).unwrap();
        assert_eq!(again.host_bytes(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn test_create_seals_immediately() {
        let (_store, _registry, manager) = setup("/tmp/mgr-create");
        let id = ObjectId::from_name("created");
        let created = manager.create(id, &[3], DataType::F32, Device::gpu(1)).unwrap();
        assert_eq!(created.device(), Device::gpu(1));
        let seen = manager.get(id, Duration::ZERO).unwrap();
        assert_eq!(seen.shape(), &[3]);
        assert_eq!(seen.device(), Device::gpu(1));
    }

    #[test]
    fn test_release_twice_is_double_release() {
        let (_store, registry, manager) = setup("/tmp/mgr-double");
        let input = TensorHandle::from_slice(&[7u16; 3], &[3], Device::CPU, &registry).unwrap();
        let id = ObjectId::from_name("twice");
        let stored = manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap();
        let (_desc, deleter) = stored.into_parts();
        manager.release(id).unwrap();
        assert!(matches!(manager.release(id), Err(Error::DoubleRelease(_))));
        assert!(matches!(deleter.fire(), Err(Error::DoubleRelease(_))));
    }

    #[test]
    fn test_release_and_delete_policy() {
        let (_store, registry, manager) = setup("/tmp/mgr-policy");
        let input = TensorHandle::from_slice(&[1.5f64, 2.5], &[2], Device::CPU, &registry).unwrap();
        let id = ObjectId::from_name("once");
        drop(manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap());
        let last = manager
            .get_with_policy(id, Duration::from_millis(5), DeletionPolicy::ReleaseAndDelete)
            .unwrap();
        assert!(matches!(last.deleter, Some(Deleter::ReleaseAndDelete(_))));
        last.dispose().unwrap();
        assert!(!manager.contains(id).unwrap());
    }

    #[test]
    fn test_share_and_list() {
        let (_store, registry, manager) = setup("/tmp/mgr-share");
        let input = TensorHandle::from_slice(&[3i64, 4, 5], &[3], Device::gpu(0), &registry).unwrap();
        let (id, stored) = manager.share(&input).unwrap();
        assert_eq!(stored.device(), Device::gpu(0));
        assert_eq!(manager.list().unwrap(), vec![(id, 1)]);

        let rebuilt = manager.rebuild(id).unwrap();
        assert_eq!(rebuilt.to_vec::<i64>(&registry).unwrap(), vec![3, 4, 5]);
        assert_eq!(manager.list().unwrap(), vec![(id, 2)]);
    }

    #[test]
    fn test_unsupported_device() {
        let (_store, registry, manager) = setup("/tmp/mgr-unsupported");
        let input = TensorHandle::from_slice(&[1u8], &[1], Device::CPU, &registry).unwrap();
        let mut desc = input.descriptor().clone();
        desc.device = Device::new(crate::tensor::DeviceType::Other(12), 0);
        let id = ObjectId::from_name("odd");
        let result = unsafe { manager.put_descriptor(&desc, id, DeletionPolicy::ReleaseOnly, true) };
        assert!(matches!(result, Err(Error::UnsupportedDevice(_))));
        assert!(!manager.contains(id).unwrap());
    }
}

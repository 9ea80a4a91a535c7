//! End-to-end tests for tensor exchange through a local store.
//!
//! Every test builds its own store so they can run in parallel.

use shmtensor::prelude::*;
use shmtensor::tensor::row_major_strides;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("shmtensor=debug")
            .with_test_writer()
            .try_init();
    });
}

struct Harness {
    store: LocalStore,
    registry: Arc<DeviceRegistry>,
    manager: ExchangeManager,
}

fn harness(endpoint: &str) -> Harness {
    init_tracing();
    let registry = Arc::new(DeviceRegistry::with_simulated_gpu(2, 64 << 20));
    let store = LocalStore::new(LocalStoreConfig::new(endpoint), registry.clone());
    let config = ExchangeConfig::new(endpoint)
        .with_memcopy_threads(4)
        .with_memcopy_threshold(1024);
    let manager = ExchangeManager::connect(&store, registry.clone(), config).expect("connect");
    Harness {
        store,
        registry,
        manager,
    }
}

impl Harness {
    fn second_manager(&self) -> ExchangeManager {
        let config = ExchangeConfig::new(self.store.endpoint());
        ExchangeManager::connect(&self.store, self.registry.clone(), config).expect("connect")
    }
}

// ============================================================================
// Round trip
// ============================================================================

fn roundtrip_on(device: Device, endpoint: &str) {
    let h = harness(endpoint);
    let values: Vec<f32> = (0..4096).map(|i| i as f32 * 0.5).collect();
    let input = TensorHandle::from_slice(&values, &[16, 16, 16], device, &h.registry).unwrap();
    let id = ObjectId::from_name(format!("roundtrip-{device}"));

    let stored = h
        .manager
        .put_handle(&input, id, DeletionPolicy::ReleaseOnly, true)
        .unwrap();
    assert_eq!(stored.device(), device);
    drop(stored);
    drop(input);

    let consumer = h.second_manager();
    let fetched = TensorHandle::from_managed(consumer.get(id, Duration::from_millis(100)).unwrap());
    assert_eq!(fetched.shape(), &[16, 16, 16]);
    assert_eq!(fetched.dtype(), DataType::F32);
    assert_eq!(fetched.device(), device);
    assert_eq!(fetched.strides(), Some(&[256i64, 16, 1][..]));
    assert_eq!(fetched.to_vec::<f32>(&h.registry).unwrap(), values);
}

#[test]
fn test_roundtrip_cpu() {
    roundtrip_on(Device::CPU, "/tmp/it-roundtrip-cpu");
}

#[test]
fn test_roundtrip_simulated_gpu() {
    roundtrip_on(Device::gpu(1), "/tmp/it-roundtrip-gpu");
}

#[test]
fn test_roundtrip_every_element_type() {
    let h = harness("/tmp/it-dtypes");

    let bytes = TensorHandle::from_slice(&[1u8, 2, 3], &[3], Device::CPU, &h.registry).unwrap();
    let ints = TensorHandle::from_slice(&[-1i64, 0, 1], &[3], Device::CPU, &h.registry).unwrap();
    let doubles = TensorHandle::from_slice(&[0.25f64; 6], &[2, 3], Device::CPU, &h.registry).unwrap();

    for (name, handle) in [("u8", &bytes), ("i64", &ints), ("f64", &doubles)] {
        let id = ObjectId::from_name(name);
        drop(h.manager.put_handle(handle, id, DeletionPolicy::ReleaseOnly, true).unwrap());
        let back = h.manager.rebuild(id).unwrap();
        assert_eq!(back.dtype(), handle.dtype());
        assert_eq!(back.shape(), handle.shape());
    }
    assert_eq!(h.manager.rebuild(ObjectId::from_name("i64")).unwrap().to_vec::<i64>(&h.registry).unwrap(), vec![-1, 0, 1]);
}

#[test]
fn test_roundtrip_scalar_and_empty() {
    let h = harness("/tmp/it-scalar");

    let scalar = TensorHandle::from_slice(&[42u32], &[], Device::CPU, &h.registry).unwrap();
    let id = ObjectId::from_name("scalar");
    drop(h.manager.put_handle(&scalar, id, DeletionPolicy::ReleaseOnly, true).unwrap());
    let back = h.manager.rebuild(id).unwrap();
    assert!(back.shape().is_empty());
    assert_eq!(back.strides(), Some(&[][..]));
    assert_eq!(back.to_vec::<u32>(&h.registry).unwrap(), vec![42]);

    let empty = TensorHandle::empty(&[0, 4], DataType::F32, Device::CPU, &h.registry).unwrap();
    let id = ObjectId::from_name("empty");
    drop(h.manager.put_handle(&empty, id, DeletionPolicy::ReleaseOnly, true).unwrap());
    let back = h.manager.rebuild(id).unwrap();
    assert_eq!(back.shape(), &[0, 4]);
    assert_eq!(back.byte_size().unwrap(), 0);
}

// ============================================================================
// Preconditions
// ============================================================================

#[test]
fn test_non_contiguous_put_leaves_store_untouched() {
    let h = harness("/tmp/it-strided");
    let mut data = vec![0f32; 12];
    let desc = TensorDescriptor::new(data.as_mut_ptr().cast(), Device::CPU, DataType::F32, &[3, 4])
        .with_strides(&[1, 3]);
    let input = unsafe { ManagedTensor::borrowed(desc) };
    let id = ObjectId::from_name("transposed");

    let err = h
        .manager
        .put(&input, id, DeletionPolicy::ReleaseOnly, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NonContiguousInput);
    assert!(!h.manager.contains(id).unwrap());
    assert_eq!(h.store.object_count(), 0);
}

#[test]
fn test_stride_recomputation() {
    assert_eq!(row_major_strides(&[2, 3, 4]).as_slice(), &[12, 4, 1]);
    assert_eq!(row_major_strides(&[5]).as_slice(), &[1]);
    assert!(row_major_strides(&[]).is_empty());
}

// ============================================================================
// Concurrency and visibility
// ============================================================================

#[test]
fn test_concurrent_puts_share_one_manager() {
    let h = harness("/tmp/it-concurrent");
    let manager = &h.manager;
    let registry = &h.registry;

    thread::scope(|s| {
        for (name, fill) in [("left", 1u8), ("right", 2u8)] {
            s.spawn(move || {
                let input = TensorHandle::from_slice(&vec![fill; 1 << 16], &[1 << 16], Device::CPU, registry).unwrap();
                let stored = manager
                    .put_handle(&input, ObjectId::from_name(name), DeletionPolicy::ReleaseOnly, true)
                    .unwrap();
                drop(stored);
            });
        }
    });

    for (name, fill) in [("left", 1u8), ("right", 2u8)] {
        let tensor = manager.get(ObjectId::from_name(name), Duration::from_millis(100)).unwrap();
        let bytes = tensor.host_bytes().unwrap();
        assert_eq!(bytes.len(), 1 << 16);
        assert!(bytes.iter().all(|&b| b == fill));
    }
}

#[test]
fn test_get_on_unsealed_object_times_out() {
    let h = harness("/tmp/it-unsealed");
    let id = ObjectId::from_name("half-written");
    let mut pending = h.manager.reserve(id, &[8], DataType::U8, Device::CPU).unwrap();

    let consumer = h.second_manager();
    let err = consumer.get(id, Duration::from_millis(20)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    pending.write(&[7; 8]).unwrap();
    let _sealed = pending.seal().unwrap();
    let tensor = consumer.get(id, Duration::from_millis(20)).unwrap();
    assert_eq!(tensor.host_bytes(), Some(&[7u8; 8][..]));
}

#[test]
fn test_get_waits_for_seal_from_another_thread() {
    let h = harness("/tmp/it-wait");
    let id = ObjectId::from_name("late");
    let consumer = h.second_manager();

    thread::scope(|s| {
        let waiter = s.spawn(|| consumer.get(id, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        let input = TensorHandle::from_slice(&[9i16; 4], &[2, 2], Device::CPU, &h.registry).unwrap();
        drop(h.manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap());

        let tensor = waiter.join().unwrap().unwrap();
        assert_eq!(tensor.shape(), &[2, 2]);
    });
}

#[test]
fn test_get_missing_object_is_not_found() {
    let h = harness("/tmp/it-missing");
    let err = h.manager.get(ObjectId::from_name("nobody"), Duration::from_millis(5)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_failed_copy_leaves_object_unsealed_and_unreferenced() {
    let h = harness("/tmp/it-failed-copy");
    let id = ObjectId::from_name("bad-source");
    let desc = TensorDescriptor::new(std::ptr::null_mut(), Device::gpu(0), DataType::F32, &[16]);

    let err = unsafe { h.manager.put_descriptor(&desc, id, DeletionPolicy::ReleaseOnly, true) }.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Copy);

    let err = h.manager.get(id, Duration::from_millis(10)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let objects = h.store.client().list().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].id, id);
    assert!(!objects[0].sealed);
    assert_eq!(objects[0].ref_count, 0);
}

// ============================================================================
// Release semantics
// ============================================================================

#[test]
fn test_double_release_surfaces_error() {
    let h = harness("/tmp/it-double-release");
    let input = TensorHandle::from_slice(&[1u8; 4], &[4], Device::CPU, &h.registry).unwrap();
    let id = ObjectId::from_name("released");
    let (_desc, deleter) = h
        .manager
        .put_handle(&input, id, DeletionPolicy::ReleaseOnly, true)
        .unwrap()
        .into_parts();
    drop(deleter.fire());

    let err = h.manager.release(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DoubleRelease);
    assert!(h.manager.contains(id).unwrap());
}

#[test]
fn test_release_only_keeps_object_for_other_readers() {
    let h = harness("/tmp/it-release-only");
    let consumer = h.second_manager();
    let input = TensorHandle::from_slice(&[5u8; 16], &[4, 4], Device::CPU, &h.registry).unwrap();
    let id = ObjectId::from_name("shared");
    let stored = h.manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap();

    let reader = consumer.get(id, Duration::from_millis(10)).unwrap();
    drop(stored);
    assert_eq!(reader.host_bytes(), Some(&[5u8; 16][..]));
    drop(reader);
    assert!(h.manager.contains(id).unwrap());
}

#[test]
fn test_release_and_delete_waits_for_other_readers() {
    let h = harness("/tmp/it-release-delete");
    let consumer = h.second_manager();
    let input = TensorHandle::from_slice(&[3u8; 8], &[8], Device::CPU, &h.registry).unwrap();
    let id = ObjectId::from_name("last-one");
    drop(h.manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap());

    let early = consumer.get(id, Duration::from_millis(10)).unwrap();
    let last = h
        .manager
        .get_with_policy(id, Duration::from_millis(10), DeletionPolicy::ReleaseAndDelete)
        .unwrap();
    last.dispose().unwrap();

    // Deleted but still mapped by the early reader.
    assert!(!h.manager.contains(id).unwrap());
    assert_eq!(early.host_bytes(), Some(&[3u8; 8][..]));
    drop(early);
    assert_eq!(h.store.object_count(), 0);
}

#[test]
fn test_tensor_outlives_manager() {
    let h = harness("/tmp/it-outlive");
    let input = TensorHandle::from_slice(&[1u64, 2, 3], &[3], Device::CPU, &h.registry).unwrap();
    let id = ObjectId::from_name("survivor");
    let stored = h.manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap();
    let Harness {
        store,
        registry: _,
        manager,
    } = h;
    drop(manager);

    assert_eq!(stored.host_bytes().map(<[u8]>::len), Some(24));
    stored.dispose().unwrap();
    assert_eq!(store.object_count(), 1);
}

// ============================================================================
// Devices and capacity
// ============================================================================

#[test]
fn test_create_on_gpu_then_fill_through_registry() {
    let h = harness("/tmp/it-create-gpu");
    let id = ObjectId::from_name("gpu-buffer");
    let created = h.manager.create(id, &[4], DataType::I32, Device::gpu(0)).unwrap();
    let target = TensorHandle::from_managed(created);

    let source = TensorHandle::from_slice(&[10i32, 20, 30, 40], &[4], Device::CPU, &h.registry).unwrap();
    target.copy_from(&source, &h.registry, None).unwrap();

    let seen = h.manager.rebuild(id).unwrap();
    assert_eq!(seen.device(), Device::gpu(0));
    assert_eq!(seen.to_vec::<i32>(&h.registry).unwrap(), vec![10, 20, 30, 40]);
}

#[test]
fn test_store_out_of_memory() {
    init_tracing();
    let registry = Arc::new(DeviceRegistry::new());
    let store = LocalStore::new(
        LocalStoreConfig::new("/tmp/it-oom").with_cpu_capacity(1024),
        registry.clone(),
    );
    let manager = ExchangeManager::connect(&store, registry.clone(), ExchangeConfig::new("/tmp/it-oom")).unwrap();
    let input = TensorHandle::empty(&[1024], DataType::F32, Device::CPU, &registry).unwrap();
    let err = manager
        .put_handle(&input, ObjectId::from_name("too-big"), DeletionPolicy::ReleaseOnly, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfMemory);
}

#[test]
fn test_connect_to_unknown_endpoint_fails() {
    init_tracing();
    let registry = Arc::new(DeviceRegistry::new());
    let store = LocalStore::new(LocalStoreConfig::new("/tmp/it-real"), registry.clone());
    let config = ExchangeConfig::new("/tmp/it-elsewhere").with_connect_timeout(Duration::from_millis(20));
    let err = ExchangeManager::connect(&store, registry, config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

// ============================================================================
// Shared ids
// ============================================================================

#[test]
fn test_share_ids_are_not_counter_seeded() {
    let h = harness("/tmp/it-share-ids");
    let counter_ids: Vec<ObjectId> = (0..64)
        .map(|seed| {
            let mut bytes = [0u8; shmtensor::store::OBJECT_ID_SIZE];
            StdRng::seed_from_u64(seed).fill_bytes(&mut bytes);
            ObjectId::from_bytes(bytes)
        })
        .collect();

    let input = TensorHandle::from_slice(&[1u8, 2, 3], &[3], Device::CPU, &h.registry).unwrap();
    let (first, a) = h.manager.share(&input).unwrap();
    let (second, b) = h.manager.share(&input).unwrap();
    assert_ne!(first, second);
    assert!(!counter_ids.contains(&first));
    assert!(!counter_ids.contains(&second));
    drop((a, b));

    let rebuilt = h.manager.rebuild(first).unwrap();
    assert_eq!(rebuilt.to_vec::<u8>(&h.registry).unwrap(), vec![1, 2, 3]);
}

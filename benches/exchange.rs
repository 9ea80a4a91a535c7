//! Put/get throughput benchmarks against the in-process store.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use shmtensor::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn setup(endpoint: &str) -> (Arc<DeviceRegistry>, LocalStore, ExchangeManager) {
    let registry = Arc::new(DeviceRegistry::with_simulated_gpu(1, 512 << 20));
    let store = LocalStore::new(
        LocalStoreConfig::new(endpoint)
            .with_cpu_capacity(512 << 20)
            .with_device_capacity(512 << 20),
        registry.clone(),
    );
    let manager = ExchangeManager::connect(&store, registry.clone(), ExchangeConfig::new(endpoint)).unwrap();
    (registry, store, manager)
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    let (registry, _store, manager) = setup("/tmp/bench-put");

    for (name, device) in [("cpu", Device::CPU), ("gpu", Device::gpu(0))] {
        for size in [4 * 1024, 1024 * 1024, 16 * 1024 * 1024] {
            let input = TensorHandle::empty(&[size as i64], DataType::U8, device, &registry).unwrap();
            let id = ObjectId::from_name(format!("put-{name}-{size}"));

            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::new(name, size), &input, |b, input| {
                b.iter(|| {
                    let stored = manager
                        .put_handle(input, id, DeletionPolicy::ReleaseAndDelete, true)
                        .unwrap();
                    drop(stored);
                });
            });
        }
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let (registry, _store, manager) = setup("/tmp/bench-get");

    for size in [4 * 1024, 1024 * 1024, 16 * 1024 * 1024] {
        let input = TensorHandle::empty(&[size as i64], DataType::U8, Device::CPU, &registry).unwrap();
        let id = ObjectId::from_name(format!("get-{size}"));
        drop(manager.put_handle(&input, id, DeletionPolicy::ReleaseOnly, true).unwrap());

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &id, |b, id| {
            b.iter(|| {
                let tensor = manager.get(*id, Duration::from_millis(10)).unwrap();
                std::hint::black_box(tensor.shape());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);

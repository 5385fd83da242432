//! Registration cache benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use mrcache::memory::{AccessFlags, CacheConfig, Interface, RegistrationCache, SoftwareBackend};
use std::sync::Arc;

const PAGE: u64 = 0x1000;

fn setup(config: CacheConfig) -> (RegistrationCache<SoftwareBackend>, Vec<Arc<Interface<SoftwareBackend>>>) {
    let cache = RegistrationCache::new("bench", config).unwrap();
    let nics = vec![Interface::new("nic0", SoftwareBackend::new())];
    (cache, nics)
}

fn bench_inuse_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("inuse_hit");

    for entries in [16u64, 256, 4096] {
        let (cache, nics) = setup(CacheConfig::unlimited());
        let held: Vec<_> = (0..entries)
            .map(|i| {
                cache
                    .register(&nics, i * 0x10 * PAGE, 4 * PAGE, AccessFlags::SEND)
                    .unwrap()
            })
            .collect();
        let middle = (entries / 2) * 0x10 * PAGE;

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("exact", entries), &middle, |b, &address| {
            b.iter(|| {
                let reg = cache.register(&nics, address, PAGE, AccessFlags::SEND).unwrap();
                cache.deregister(reg).unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("contained", entries), &middle, |b, &address| {
            b.iter(|| {
                let reg = cache
                    .register(&nics, address + 2 * PAGE, PAGE, AccessFlags::SEND)
                    .unwrap();
                cache.deregister(reg).unwrap();
            });
        });

        for reg in held {
            cache.deregister(reg).unwrap();
        }
    }

    group.finish();
}

fn bench_stale_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("stale_reuse");

    let (cache, nics) = setup(CacheConfig::default());
    let warm = cache.register(&nics, 0x100000, 16 * PAGE, AccessFlags::RECV).unwrap();
    cache.deregister(warm).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("revive_and_park", |b| {
        b.iter(|| {
            let reg = cache
                .register(&nics, 0x100000, 16 * PAGE, AccessFlags::RECV)
                .unwrap();
            std::hint::black_box(reg.handle());
            cache.deregister(reg).unwrap();
        });
    });

    group.finish();
}

fn bench_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("miss");

    let (cache, nics) = setup(CacheConfig::eager());

    group.throughput(Throughput::Elements(1));
    group.bench_function("register_deregister", |b| {
        b.iter(|| {
            let reg = cache.register(&nics, 0x100000, PAGE, AccessFlags::SEND).unwrap();
            cache.deregister(reg).unwrap();
            nics[0].lock_backend().unwrap().clear_calls();
        });
    });

    group.finish();
}

fn bench_long_entry_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("long_entry_lookup");

    let (cache, nics) = setup(CacheConfig::unlimited());
    let mut held: Vec<_> = (0..20_000u64)
        .map(|i| {
            cache
                .register(&nics, i * 2 * PAGE, PAGE, AccessFlags::SEND)
                .unwrap()
        })
        .collect();
    // One 1 TiB registration far above the small ones.
    held.push(
        cache
            .register(&nics, 1 << 44, 1 << 40, AccessFlags::SEND)
            .unwrap(),
    );
    let middle = 10_000 * 2 * PAGE;

    group.throughput(Throughput::Elements(1));
    group.bench_function("contained", |b| {
        b.iter(|| {
            let reg = cache
                .register(&nics, middle + 0x100, 0x100, AccessFlags::SEND)
                .unwrap();
            cache.deregister(reg).unwrap();
        });
    });

    for reg in held {
        cache.deregister(reg).unwrap();
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");

    for pieces in [4u64, 32] {
        group.throughput(Throughput::Elements(pieces + 1));
        group.bench_with_input(BenchmarkId::from_parameter(pieces), &pieces, |b, &pieces| {
            b.iter(|| {
                let (cache, nics) = setup(CacheConfig::default());
                let regs: Vec<_> = (0..pieces)
                    .map(|i| {
                        cache
                            .register(&nics, i * 4 * PAGE, PAGE, AccessFlags::SEND)
                            .unwrap()
                    })
                    .collect();
                let all = cache
                    .register(&nics, 0, pieces * 4 * PAGE, AccessFlags::SEND)
                    .unwrap();
                for reg in regs {
                    cache.deregister(reg).unwrap();
                }
                cache.deregister(all).unwrap();
                cache.destroy().unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_inuse_hit,
    bench_stale_reuse,
    bench_miss,
    bench_long_entry_lookup,
    bench_merge
);
criterion_main!(benches);

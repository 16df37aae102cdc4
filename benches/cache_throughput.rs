//! Throughput of the cache manager's four concrete caches, ported from
//! `original_source/NIOMan/Classes/cache/{cache,cachemgr}.c`.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use relayforge::cache::cert_bundle::{CertBundle, CertBundleInner};
use relayforge::cache::manager::CacheManager;

fn bundle(n: u8) -> CertBundle {
    CertBundle::new3(CertBundleInner { key: vec![n; 32], leaf: vec![n; 256], chain: vec![vec![n; 256]] })
}

fn fkcrt_get_hit(c: &mut Criterion) {
    let mgr = CacheManager::preinit();
    let key = [7u8; 32];
    mgr.fkcrt.set(key, bundle(7));

    c.bench_function("fkcrt_get_hit", |b| {
        b.iter(|| black_box(mgr.fkcrt.get(black_box(&key))));
    });
}

fn fkcrt_set_churn(c: &mut Criterion) {
    let mgr = CacheManager::preinit();
    let mut next = 0u8;

    c.bench_function("fkcrt_set_churn", |b| {
        b.iter(|| {
            let key = [next; 32];
            mgr.fkcrt.set(key, bundle(next));
            next = next.wrapping_add(1);
        });
    });
}

fn gc_sweep_at_scale(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_gc");

    for &entries in &[1_000usize, 10_000] {
        group.bench_with_input(BenchmarkId::new("fkcrt_gc", entries), &entries, |b, &entries| {
            b.iter_batched(
                || {
                    let mgr = CacheManager::preinit();
                    // Every other entry gets an extra outstanding clone so
                    // `references() > 1` keeps it alive; fkcrt's GC policy
                    // drops whichever entries only the cache's own slot
                    // still references.
                    let mut keepalive = Vec::new();
                    for i in 0..entries {
                        let key = (i as u32).to_be_bytes();
                        let mut k = [0u8; 32];
                        k[..4].copy_from_slice(&key);
                        let b = bundle(i as u8);
                        if i % 2 == 0 {
                            keepalive.push(b.clone());
                        }
                        mgr.fkcrt.set(k, b);
                    }
                    (mgr, keepalive)
                },
                |(mgr, _keepalive)| black_box(mgr.fkcrt.gc()),
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, fkcrt_get_hit, fkcrt_set_churn, gc_sweep_at_scale);
criterion_main!(benches);

//! Code Cache Performance Benchmarks
//!
//! Measures the two operations on the allocation fast path and the stack
//! walker's hot path:
//!
//! 1. **Bundle allocation**: bump + header plant + index insert
//! 2. **Reverse lookup**: interval test + binary search over bundle starts

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use codecache::region::RegionView;
use codecache::{BundleLayout, CacheConfig, CodeCache, CompiledMethod, Lifespan};

fn cache_with_bundles(count: usize) -> (CodeCache, Vec<usize>) {
    let cache = CodeCache::new(CacheConfig::default()).expect("reserve failed");
    let layout = BundleLayout::new(128, 0, 0);
    let mut code_starts = Vec::with_capacity(count);
    for id in 0..count {
        let method = Arc::new(CompiledMethod::new(id as u64, format!("bench{}", id)));
        let bundle = cache
            .allocate(&layout, &method, false, Lifespan::Short)
            .expect("allocation failed");
        code_starts.push(bundle.code_start());
    }
    (cache, code_starts)
}

fn bench_allocation(c: &mut Criterion) {
    c.bench_function("allocate_short_bundle", |b| {
        // A nothing-survives oracle keeps the steady state sustainable:
        // when the half-space fills, eviction empties it.
        let cache = CodeCache::new(CacheConfig::default())
            .expect("reserve failed")
            .with_reachability(Arc::new(|_: &CompiledMethod| false));
        let layout = BundleLayout::new(128, 0, 2);
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            let method = Arc::new(CompiledMethod::new(id, "bench"));
            black_box(
                cache
                    .allocate(&layout, &method, false, Lifespan::Short)
                    .expect("allocation failed"),
            )
        });
    });
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_method");
    for &count in &[16usize, 256, 4096] {
        let (cache, code_starts) = cache_with_bundles(count);
        let probe = code_starts[count / 2];
        group.bench_with_input(BenchmarkId::new("hit", count), &probe, |b, &addr| {
            b.iter(|| black_box(cache.find_method(black_box(addr))))
        });
        let miss = cache.opt_region().end() + 0x1000;
        group.bench_with_input(BenchmarkId::new("miss", count), &miss, |b, &addr| {
            b.iter(|| black_box(cache.find_method(black_box(addr))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_allocation, bench_lookup);
criterion_main!(benches);

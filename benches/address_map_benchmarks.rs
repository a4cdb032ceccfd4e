use addrmap::AddressMap;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::collections::BTreeMap;
use std::hint::black_box;

const N: usize = 10_000;

/// Objects live in a 256 MiB heap region, 16-byte aligned.
const HEAP_BASE: usize = 0x7f00_0000_0000;

// ─── Helper functions to generate address sequences ─────────────────────────

fn ordered_addresses(n: usize) -> Vec<usize> {
    (0..n).map(|i| HEAP_BASE + i * 64).collect()
}

fn random_addresses(n: usize) -> Vec<usize> {
    // Use a simple LCG for deterministic pseudo-random sequence
    let mut addresses = Vec::with_capacity(n);
    let mut x: u64 = 12345;
    for _ in 0..n {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1);
        addresses.push(HEAP_BASE + ((x >> 36) as usize & !15));
    }
    addresses
}

fn btree_find_inside(map: &BTreeMap<usize, usize>, max_search: usize, address: usize) -> Option<(usize, &usize)> {
    let low = address.saturating_sub(max_search);
    map.range(low..=address)
        .rev()
        .find(|&(&start, &size)| address == start || address - start < size)
        .map(|(&start, size)| (start, size))
}

// ─── Benchmarks ─────────────────────────────────────────────────────────────

fn bench_insert_ordered(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_ordered");
    let addresses = ordered_addresses(N);

    group.bench_function(BenchmarkId::new("AddressMap", N), |b| {
        b.iter(|| {
            let mut map = AddressMap::new();
            for &a in &addresses {
                map.insert(a, 64usize);
            }
            map
        });
    });

    group.bench_function(BenchmarkId::new("BTreeMap", N), |b| {
        b.iter(|| {
            let mut map = BTreeMap::new();
            for &a in &addresses {
                map.insert(a, 64usize);
            }
            map
        });
    });

    group.finish();
}

fn bench_insert_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_random");
    let addresses = random_addresses(N);

    group.bench_function(BenchmarkId::new("AddressMap", N), |b| {
        b.iter(|| {
            let mut map = AddressMap::new();
            for &a in &addresses {
                map.insert(a, 16usize);
            }
            map
        });
    });

    group.bench_function(BenchmarkId::new("BTreeMap", N), |b| {
        b.iter(|| {
            let mut map = BTreeMap::new();
            for &a in &addresses {
                map.insert(a, 16usize);
            }
            map
        });
    });

    group.finish();
}

fn bench_get_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_random");
    let addresses = random_addresses(N);

    let mut map = AddressMap::new();
    let mut btree = BTreeMap::new();
    for &a in &addresses {
        map.insert(a, 16usize);
        btree.insert(a, 16usize);
    }

    group.bench_function(BenchmarkId::new("AddressMap", N), |b| {
        b.iter(|| {
            for &a in &addresses {
                black_box(map.get(a));
            }
        });
    });

    group.bench_function(BenchmarkId::new("BTreeMap", N), |b| {
        b.iter(|| {
            for &a in &addresses {
                black_box(btree.get(&a));
            }
        });
    });

    group.finish();
}

fn bench_find_inside(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_inside");
    let addresses = ordered_addresses(N);

    let mut map = AddressMap::new();
    let mut btree = BTreeMap::new();
    for &a in &addresses {
        map.insert(a, 48usize);
        btree.insert(a, 48usize);
    }

    group.bench_function(BenchmarkId::new("AddressMap", N), |b| {
        b.iter(|| {
            for &a in &addresses {
                black_box(map.find_inside(|size| *size, 1 << 20, a + 40));
            }
        });
    });

    group.bench_function(BenchmarkId::new("BTreeMap", N), |b| {
        b.iter(|| {
            for &a in &addresses {
                black_box(btree_find_inside(&btree, 1 << 20, a + 40));
            }
        });
    });

    group.finish();
}

fn bench_remove_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove_random");
    let addresses = random_addresses(N);

    group.bench_function(BenchmarkId::new("AddressMap", N), |b| {
        b.iter_batched(
            || {
                let mut map = AddressMap::new();
                for &a in &addresses {
                    map.insert(a, 16usize);
                }
                map
            },
            |mut map| {
                for &a in &addresses {
                    map.remove(a);
                }
                map
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function(BenchmarkId::new("BTreeMap", N), |b| {
        b.iter_batched(
            || {
                let mut map = BTreeMap::new();
                for &a in &addresses {
                    map.insert(a, 16usize);
                }
                map
            },
            |mut map| {
                for &a in &addresses {
                    map.remove(&a);
                }
                map
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_ordered,
    bench_insert_random,
    bench_get_random,
    bench_find_inside,
    bench_remove_random,
);
criterion_main!(benches);

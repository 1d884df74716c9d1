//! Criterion micro-benchmarks for range index lookup.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use lode_bench::{populated_index, RANGE_BASE, RANGE_STRIDE};
use lode_core::{Address, OwnerId};

/// Benchmark: lookups that hit, spread over a 1000-entry index.
fn bench_lookup_hit(c: &mut Criterion) {
    let index = populated_index(1000);
    let mut i = 0usize;
    c.bench_function("range_lookup_hit_1000", |b| {
        b.iter(|| {
            i = (i + 7) % 1000;
            black_box(index.lookup(Address(RANGE_BASE + i * RANGE_STRIDE + 16)))
        });
    });
}

/// Benchmark: lookups that miss every entry.
fn bench_lookup_miss(c: &mut Criterion) {
    let index = populated_index(1000);
    c.bench_function("range_lookup_miss_1000", |b| {
        b.iter(|| black_box(index.lookup(Address(RANGE_BASE - 16))));
    });
}

/// Benchmark: add then remove one owner's range under the writer.
fn bench_add_remove(c: &mut Criterion) {
    let index = populated_index(256);
    let owner = OwnerId::new(u64::MAX).unwrap();
    c.bench_function("range_add_remove", |b| {
        b.iter(|| {
            let mut writer = index.writer();
            writer.add(Address(0x10), Address(0x20), owner).unwrap();
            black_box(writer.remove(owner));
        });
    });
}

criterion_group!(benches, bench_lookup_hit, bench_lookup_miss, bench_add_remove);
criterion_main!(benches);

// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 shmkv contributors
//
// Throughput of the zone allocator under the public engine API: plain
// inserts that fit in place, inserts that force splitting, and inserts that
// force eviction once the segment fills up.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shmkv::{Engine, EngineConfig, MemBackend};
use std::time::Duration;

fn fresh_engine(segment_size: usize) -> Engine<MemBackend> {
    let config = EngineConfig {
        segment_size,
        lock_timeout: Duration::from_millis(500),
        stats_flush_threshold: 1024,
    };
    Engine::attach("bench", MemBackend, config).unwrap()
}

fn bench_set_small(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_small_value");
    for &size in &[64usize, 512, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let engine = fresh_engine(64 * 1024 * 1024);
            let value = vec![b'x'; size];
            let mut i = 0u64;
            b.iter(|| {
                let key = format!("k{i}");
                i += 1;
                engine.set(key.as_bytes(), black_box(&value), 0).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let engine = fresh_engine(64 * 1024 * 1024);
    for i in 0..10_000u64 {
        engine
            .set(format!("k{i}").as_bytes(), b"benchmark-value", 0)
            .unwrap();
    }
    c.bench_function("get_existing_key", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("k{}", i % 10_000);
            i += 1;
            black_box(engine.get(key.as_bytes()).unwrap());
        });
    });
}

fn bench_eviction_pressure(c: &mut Criterion) {
    c.bench_function("set_under_eviction_pressure", |b| {
        let engine = fresh_engine(16 * 1024 * 1024);
        let value = vec![b'x'; 900_000];
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("k{i}");
            i += 1;
            engine.set(key.as_bytes(), black_box(&value), 0).unwrap();
        });
    });
}

criterion_group!(benches, bench_set_small, bench_get_hit, bench_eviction_pressure);
criterion_main!(benches);

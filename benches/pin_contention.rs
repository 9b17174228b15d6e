use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn pin_contention_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pin contention benchmark - hits");
    group.sample_size(10);
    group.bench_function("8 readers, same page", |b| {
        b.iter(|| hit_benchmark_call::<true>(black_box(8)));
    });
    group.bench_function("8 readers, spread pages", |b| {
        b.iter(|| hit_benchmark_call::<false>(black_box(8)));
    });
    group.finish();

    let mut group = c.benchmark_group("pin contention benchmark - eviction");
    group.sample_size(10);
    group.bench_function("4 writers", |b| {
        b.iter(|| eviction_benchmark_call(black_box(4)));
    });
    group.bench_function("16 writers", |b| {
        b.iter(|| eviction_benchmark_call(black_box(16)));
    });
    group.finish();
}

extern crate slotcache;
use slotcache::{Config, MemorySwapper, PageCache, PageId, PageIntent};

use std::sync::Arc;
use std::thread;

const PAGE_SIZE: usize = 8192;
const ROUNDS: u64 = 16000;

fn hit_benchmark_call<const SAME_PAGE: bool>(num_threads: usize) {
    let cache = PageCache::with_config(&Config::with_slots(256, PAGE_SIZE)).unwrap();
    let file_id = cache
        .open_file(Arc::new(MemorySwapper::new(PAGE_SIZE)))
        .unwrap();

    thread::scope(|s| {
        for thread_id in 0..num_threads as u64 {
            let cache = &cache;
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let page = if SAME_PAGE { 0 } else { (thread_id * 31 + round) % 128 };
                    let handle = cache
                        .acquire(file_id, PageId::new(page), PageIntent::Read)
                        .unwrap();
                    black_box(handle[0]);
                }
            });
        }
    });
}

fn eviction_benchmark_call(num_threads: usize) {
    let cache = PageCache::with_config(&Config::with_slots(64, PAGE_SIZE)).unwrap();
    let file_id = cache
        .open_file(Arc::new(MemorySwapper::new(PAGE_SIZE)))
        .unwrap();

    thread::scope(|s| {
        for thread_id in 0..num_threads as u64 {
            let cache = &cache;
            s.spawn(move || {
                for round in 0..ROUNDS / 4 {
                    let page = (thread_id * 97 + round * 7) % 1024;
                    let mut handle = cache
                        .acquire(file_id, PageId::new(page), PageIntent::Write)
                        .unwrap();
                    handle[0] = handle[0].wrapping_add(1);
                }
            });
        }
    });
}

criterion_group!(benches, pin_contention_benchmark);
criterion_main!(benches);

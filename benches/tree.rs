//! Single-threaded throughput benchmarks for the public API.
//!
//! ```bash
//! cargo bench --bench tree
//! ```

use std::hint::black_box;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};

use bztree::BzTree;

const PRELOAD: u64 = 100_000;

fn preloaded_tree() -> BzTree {
    let tree: BzTree = BzTree::new();
    for i in 0..PRELOAD {
        let key = format!("{i:08}");
        tree.insert(key.as_bytes(), i).unwrap();
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("insert/sequential_10k", |b| {
        b.iter_batched(
            || BzTree::<4096>::new(),
            |tree| {
                for i in 0..10_000u64 {
                    let key = format!("{i:08}");
                    tree.insert(key.as_bytes(), i).unwrap();
                }
                tree
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_read(c: &mut Criterion) {
    let tree = preloaded_tree();

    c.bench_function("read/hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("{:08}", i % PRELOAD);
            i = i.wrapping_add(7919);
            black_box(tree.read(key.as_bytes()))
        });
    });

    c.bench_function("read/miss", |b| {
        b.iter(|| black_box(tree.read(b"zz-not-there")));
    });
}

fn bench_update(c: &mut Criterion) {
    let tree = preloaded_tree();

    c.bench_function("update/hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("{:08}", i % PRELOAD);
            i = i.wrapping_add(104_729);
            tree.update(key.as_bytes(), i).unwrap();
        });
    });
}

criterion_group!(benches, bench_insert, bench_read, bench_update);
criterion_main!(benches);

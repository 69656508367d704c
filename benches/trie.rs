use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use octrie::Trie;

fn keys(count: usize) -> Vec<[u8; 16]> {
    let mut rng = StdRng::seed_from_u64(0xbe9c4);
    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        let mut key = [0u8; 16];
        rng.fill_bytes(&mut key);
        keys.push(key);
    }
    keys
}

fn insert_bench(c: &mut Criterion) {
    let keys = keys(10_000);
    c.bench_function("insert 10k random keys", |b| {
        b.iter(|| {
            let mut trie = Trie::new(usize::MAX);
            for (i, key) in keys.iter().enumerate() {
                trie.insert(black_box(key), i).unwrap();
            }
            trie
        })
    });
}

fn find_bench(c: &mut Criterion) {
    let keys = keys(10_000);
    let mut trie = Trie::new(usize::MAX);
    for (i, key) in keys.iter().enumerate() {
        trie.insert(key, i).unwrap();
    }
    c.bench_function("find 10k random keys", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for key in &keys {
                if trie.find(black_box(key)).is_some() {
                    hits += 1;
                }
            }
            hits
        })
    });
}

fn iterate_bench(c: &mut Criterion) {
    let keys = keys(10_000);
    let mut trie = Trie::new(usize::MAX);
    for (i, key) in keys.iter().enumerate() {
        trie.insert(key, i).unwrap();
    }
    c.bench_function("cursor over 10k keys", |b| {
        b.iter(|| {
            let mut cursor = trie.cursor();
            let mut sum = 0usize;
            while cursor.next() {
                sum = sum.wrapping_add(cursor.value());
            }
            sum
        })
    });
}

criterion_group!(benches, insert_bench, find_bench, iterate_bench);
criterion_main!(benches);

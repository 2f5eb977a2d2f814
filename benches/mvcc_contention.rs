//! MVCC store benchmarks: single-threaded put/read/commit throughput and
//! commit latency under concurrent writers contending on a shared key.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use vamana::MvccStore;

fn bench_disjoint_put_commit(c: &mut Criterion) {
    let store = MvccStore::new();
    let mut counter: u64 = 0;

    let mut group = c.benchmark_group("mvcc_single_thread");
    group.throughput(Throughput::Elements(1));
    group.bench_function("put_commit_disjoint_keys", |b| {
        b.iter(|| {
            counter += 1;
            let mut tx = store.start_write_transaction();
            store
                .put(&mut tx, format!("k{counter}").as_str(), vec![0u8; 64])
                .unwrap();
            store.commit(tx).unwrap();
        })
    });
    group.finish();
}

fn bench_read_after_commit(c: &mut Criterion) {
    let store = MvccStore::new();
    let mut tx = store.start_write_transaction();
    store.put(&mut tx, "hot", vec![1u8; 64]).unwrap();
    store.commit(tx).unwrap();

    let mut group = c.benchmark_group("mvcc_single_thread");
    group.throughput(Throughput::Elements(1));
    group.bench_function("read_committed_key", |b| {
        b.iter(|| {
            let reader = store.start_read_transaction();
            store.read(&reader, "hot").unwrap()
        })
    });
    group.finish();
}

fn bench_contended_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("mvcc_contention");
    group.throughput(Throughput::Elements(8));
    group.bench_function("8_writers_one_key", |b| {
        b.iter(|| {
            let store = Arc::new(MvccStore::new());
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = Arc::clone(&store);
                    thread::spawn(move || {
                        let mut tx = store.start_write_transaction();
                        store.put(&mut tx, "contended", vec![i as u8]).unwrap();
                        let _ = store.commit(tx);
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_disjoint_put_commit,
    bench_read_after_commit,
    bench_contended_commit
);
criterion_main!(benches);

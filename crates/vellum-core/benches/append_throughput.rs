//! Append-path throughput: single-caller fsync'd appends and group-commit
//! friendly concurrent bursts.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use vellum_core::{ExpectedRevision, Store, StoreConfig};

fn bench_append(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    let mut group = c.benchmark_group("append");
    group.sample_size(20);

    group.throughput(Throughput::Elements(1));
    group.bench_function("single_caller_fsync", |b| {
        let dir = tempfile::tempdir().unwrap();
        let store = rt.block_on(async { Store::open(dir.path()).unwrap() });
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            rt.block_on(async {
                store
                    .append(
                        "bench",
                        &format!("c-{i}"),
                        ExpectedRevision::Any,
                        vec![vec![0xAB; 256]],
                        "t",
                    )
                    .await
                    .unwrap()
            })
        });
    });

    group.throughput(Throughput::Elements(16));
    group.bench_function("sixteen_concurrent_callers", |b| {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig::default();
        let store =
            std::sync::Arc::new(rt.block_on(async { Store::open_with_config(dir.path(), cfg).unwrap() }));
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            rt.block_on(async {
                let mut tasks = Vec::with_capacity(16);
                for lane in 0..16u64 {
                    let store = std::sync::Arc::clone(&store);
                    tasks.push(tokio::spawn(async move {
                        store
                            .append(
                                &format!("lane-{lane}"),
                                &format!("c-{round}"),
                                ExpectedRevision::Any,
                                vec![vec![0xCD; 256]],
                                "t",
                            )
                            .await
                            .unwrap()
                    }));
                }
                for task in tasks {
                    task.await.unwrap();
                }
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);

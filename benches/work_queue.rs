//! Benchmarks for the controller work queue and option resolution

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::collections::BTreeMap;
use volume_failover_operator::controller::{default_controller_rate_limiter, RateLimiterConfig, WorkQueue};
use volume_failover_operator::csi::resolve_volume_options;

fn new_queue() -> WorkQueue<String> {
    WorkQueue::new(
        "bench",
        Box::new(default_controller_rate_limiter(&RateLimiterConfig::default())),
    )
}

fn bench_add_get_done(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let queue = new_queue();
    let keys: Vec<String> = (0..1000).map(|i| format!("default/pod-{:04}", i)).collect();

    group.bench_function("add_get_done", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            queue.add(keys[counter % keys.len()].clone());
            runtime.block_on(async {
                if let Some(key) = queue.get().await {
                    queue.done(black_box(&key));
                }
            });
        });
    });

    group.finish();
}

fn bench_duplicate_adds(c: &mut Criterion) {
    let mut group = c.benchmark_group("work_queue");
    group.throughput(Throughput::Elements(100));

    group.bench_function("dedup_100_adds", |b| {
        let queue = new_queue();
        b.iter(|| {
            for _ in 0..100 {
                queue.add(black_box("default/web-0".to_string()));
            }
        });
        assert_eq!(queue.len(), 1);
    });

    group.finish();
}

fn bench_resolve_options(c: &mut Criterion) {
    let options: BTreeMap<String, String> = [
        ("numberOfReplicas", "2"),
        ("staleReplicaTimeout", "30"),
        ("share", "true"),
        ("diskSelector", "ssd,fast"),
        ("migratable", "true"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    c.bench_function("resolve_volume_options", |b| {
        b.iter(|| resolve_volume_options(black_box("vol-1"), black_box(&options)))
    });
}

criterion_group!(benches, bench_add_get_done, bench_duplicate_adds, bench_resolve_options);
criterion_main!(benches);

// Criterion benchmarks for statebean-metrics
//
// Run benchmarks with:
//   cargo bench -p statebean-metrics

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use statebean_metrics::{ContainerMetricsCollector, MetricsCollector, MetricsConfig};
use std::time::Instant;

fn bench_record_call(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_call");
    let collector = ContainerMetricsCollector::new("cart");

    group.bench_function("single_method", |b| {
        b.iter(|| collector.record_call(black_box("add_item"), Instant::now(), true));
    });

    let methods = ["add_item", "remove_item", "checkout", "total", "clear"];
    group.bench_function("five_methods", |b| {
        b.iter(|| {
            for method in &methods {
                collector.record_call(black_box(method), Instant::now(), true);
            }
        });
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for method_count in [10usize, 100] {
        let collector = ContainerMetricsCollector::with_config(
            "cart",
            MetricsConfig {
                max_methods: method_count,
                method_ttl_secs: 3600,
            },
        );
        for i in 0..method_count * 10 {
            let method = format!("method_{}", i % method_count);
            collector.record_call(&method, Instant::now(), i % 3 != 0);
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(method_count),
            &collector,
            |b, collector| b.iter(|| collector.snapshot()),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_record_call, bench_snapshot);
criterion_main!(benches);

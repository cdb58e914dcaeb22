// Criterion benchmarks for statebean-cluster
//
// Run benchmarks with:
//   cargo bench -p statebean-cluster
//
// For detailed output with plots:
//   cargo bench -p statebean-cluster -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use statebean_cluster::{FamilyRegistry, LoadBalancePolicyKind, Replicant, ReplicantView};

fn replicants(count: usize) -> Vec<Replicant> {
    (0..count)
        .map(|i| Replicant::new(format!("node{}", i), format!("127.0.0.1:{}", 7800 + i)))
        .collect()
}

fn bench_choose(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose");

    for kind in [
        LoadBalancePolicyKind::RoundRobin,
        LoadBalancePolicyKind::FirstAvailable,
        LoadBalancePolicyKind::RandomRobin,
    ] {
        for count in [2usize, 10, 50] {
            let policy = kind.build();
            let view = ReplicantView::new(1, replicants(count));
            group.bench_with_input(
                BenchmarkId::new(policy.name(), count),
                &view,
                |b, view| b.iter(|| policy.choose(black_box(view), &[])),
            );
        }
    }

    group.finish();
}

fn bench_choose_with_exclusions(c: &mut Criterion) {
    let mut group = c.benchmark_group("choose_with_exclusions");
    let view = ReplicantView::new(1, replicants(10));
    let failed: Vec<Replicant> = view.replicants()[..5].to_vec();
    let policy = LoadBalancePolicyKind::RoundRobin.build();

    group.bench_function("round_robin_10_half_failed", |b| {
        b.iter(|| policy.choose(black_box(&view), black_box(&failed)))
    });

    group.finish();
}

fn bench_view_install(c: &mut Criterion) {
    let mut group = c.benchmark_group("replicants_changed");

    group.bench_function("install_10", |b| {
        let registry = FamilyRegistry::new();
        let list = replicants(10);
        let mut view_id = 0u64;
        b.iter(|| {
            view_id += 1;
            registry.replicants_changed("fam", list.clone(), view_id)
        });
    });

    group.bench_function("stale_discard", |b| {
        let registry = FamilyRegistry::new();
        registry.replicants_changed("fam", replicants(10), u64::MAX);
        let list = replicants(10);
        b.iter(|| registry.replicants_changed("fam", list.clone(), 1));
    });

    group.finish();
}

criterion_group!(benches, bench_choose, bench_choose_with_exclusions, bench_view_install);
criterion_main!(benches);

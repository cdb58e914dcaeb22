// Criterion benchmarks for statebean-container
//
// Run benchmarks with:
//   cargo bench -p statebean-container

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statebean_common::{MethodSignature, Result};
use statebean_container::{
    Bean, BeanDescriptor, CacheConfig, ConcurrencyPolicy, Container, ContainerConfig, Lifecycle,
    SerdeBeanFactory, StatefulCache,
};
use std::sync::Arc;

#[derive(Default, Serialize, Deserialize)]
struct Counter {
    count: i64,
}

impl Bean for Counter {
    fn invoke(&mut self, _method: &MethodSignature, args: Value) -> Result<Value> {
        self.count += args.as_i64().unwrap_or(1);
        Ok(json!(self.count))
    }

    fn state(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn cache(max_size: usize) -> Arc<StatefulCache> {
    let factory = Arc::new(SerdeBeanFactory::new(|_| Ok(Counter::default())));
    StatefulCache::builder("counter", CacheConfig::new().with_max_size(max_size), factory)
        .concurrency(ConcurrencyPolicy::FailFast)
        .build()
        .unwrap()
}

fn bench_checkout(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("checkout");

    for sessions in [10usize, 1_000] {
        let cache = cache(sessions * 2);
        let ids: Vec<_> = (0..sessions)
            .map(|_| cache.create(Value::Null).unwrap().id())
            .collect();

        group.bench_with_input(BenchmarkId::new("resident", sessions), &ids, |b, ids| {
            let mut next = 0;
            b.iter(|| {
                let id = ids[next % ids.len()];
                next += 1;
                runtime.block_on(async { drop(black_box(cache.get(id, true).await.unwrap())) });
            });
        });
    }

    // Every checkout activates one session and passivates another
    let cache = cache(1);
    let ids: Vec<_> = (0..2).map(|_| cache.create(Value::Null).unwrap().id()).collect();
    group.bench_function("activation_churn", |b| {
        let mut next = 0;
        b.iter(|| {
            let id = ids[next % 2];
            next += 1;
            runtime.block_on(async { drop(cache.get(id, true).await.unwrap()) });
        });
    });

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let container = runtime.block_on(async {
        let factory = Arc::new(SerdeBeanFactory::new(|_| Ok(Counter::default())));
        Container::start(
            ContainerConfig::new("counter"),
            BeanDescriptor::new("counter").with_method("add", &["i64"]),
            factory,
            Lifecycle::new(),
        )
        .await
        .unwrap()
    });
    let session = container.create_session(Value::Null).unwrap().session_id;
    let add = MethodSignature::new("add", &["i64"]);

    c.bench_function("dispatch_business", |b| {
        b.iter(|| {
            runtime.block_on(async {
                container
                    .invoke_local(black_box(&add), Some(session), json!(1))
                    .await
            })
        });
    });
}

criterion_group!(benches, bench_checkout, bench_dispatch);
criterion_main!(benches);

//! Benchmarks for the type registry.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use stagegate::registry::TypeRegistry;
use stagegate::store::InMemoryBackend;
use stagegate::testing::{plan_payload, scenario_schemas, Scenario, PLAN_SCHEMA};

fn registry_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let scenario = Scenario::new().unwrap();
    let registry = TypeRegistry::new(Arc::new(InMemoryBackend::new()), scenario_schemas().unwrap());
    let payload = plan_payload(&["design", "build", "ship"]);

    let mut version = 0;
    c.bench_function("put_new_version", |b| {
        b.iter(|| {
            let next = rt.block_on(registry.put(
                "wf/bench",
                &scenario.plan,
                PLAN_SCHEMA,
                serde_json::json!({ "steps": ["a"], "revision": version }),
                "plan",
                version,
            ));
            version = next.unwrap();
        })
    });

    c.bench_function("put_idempotent_replay", |b| {
        rt.block_on(registry.put("wf/replay", &scenario.plan, PLAN_SCHEMA, payload.clone(), "plan", 0))
            .unwrap();
        b.iter(|| {
            black_box(
                rt.block_on(registry.put("wf/replay", &scenario.plan, PLAN_SCHEMA, payload.clone(), "plan", 1))
                    .unwrap(),
            )
        })
    });

    c.bench_function("get_latest", |b| {
        b.iter(|| black_box(rt.block_on(registry.get("wf/replay", &scenario.plan)).unwrap()))
    });
}

criterion_group!(benches, registry_benchmark);
criterion_main!(benches);

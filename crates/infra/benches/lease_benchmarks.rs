use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use taskforge_core::{Task, TaskId};
use taskforge_infra::{
    InMemoryTaskStore, ProcessorRegistry, Runner, RunnerConfig, TaskInput, TaskProcessor,
    TaskStore,
};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

async fn seeded_store(tasks: usize) -> Arc<InMemoryTaskStore> {
    let store = InMemoryTaskStore::arc();
    let created = Utc::now() - chrono::Duration::minutes(1);
    for i in 0..tasks {
        let task = Task::new(
            TaskId::new(format!("task-{i}")).unwrap(),
            "bench",
            json!({"i": i}),
            created,
        );
        store.insert_unique(task).await.unwrap();
    }
    store
}

/// Lease every task of a freshly seeded store.
fn bench_lease_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_drain");

    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || rt.block_on(seeded_store(size)),
                |store| {
                    rt.block_on(async {
                        let lease = Duration::from_secs(60);
                        while let Some(task) = store.lease_next(lease).await.unwrap() {
                            black_box(task);
                        }
                    })
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Full scan iterations: lease, invoke a trivial processor, commit.
fn bench_scan(c: &mut Criterion) {
    let rt = runtime();
    let registry = Arc::new(ProcessorRegistry::new().with(
        "bench",
        TaskProcessor::direct(|input: TaskInput| async move { Ok(input.data) }),
    ));

    c.bench_function("scan_1000_one_shot_tasks", |b| {
        b.iter_batched(
            || rt.block_on(seeded_store(1_000)),
            |store| {
                let runner = Runner::new(store, RunnerConfig::default(), registry.clone());
                let report = rt.block_on(runner.scan()).unwrap();
                black_box(report)
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_lease_drain, bench_scan);
criterion_main!(benches);

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use telemetry_proxy::buffer::{DiskTaskQueue, JournalConfig};
use telemetry_proxy::domain::{DataSubmissionTask, EntityType, HandlerKey};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn create_task(items: usize) -> DataSubmissionTask {
    let key = HandlerKey::new(EntityType::Points, "2878");
    let items = (0..items)
        .map(|i| format!("cpu.load.{} {} 1700000000 source=bench-host", i % 64, i))
        .collect();
    DataSubmissionTask::new(&key, items).expect("Failed to build benchmark task")
}

fn journal_config(dir: &TempDir, compression: bool) -> JournalConfig {
    JournalConfig {
        directory: dir.path().to_path_buf(),
        partition_size: 16 * 1024 * 1024,
        compression,
    }
}

fn bench_append_remove(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let mut group = c.benchmark_group("journal_append_remove");

    for &items in &[10usize, 100, 1_000] {
        for compression in [false, true] {
            let dir = TempDir::new().expect("Failed to create temp dir");
            let config = journal_config(&dir, compression);
            let queue = rt
                .block_on(DiskTaskQueue::open(dir.path().join("queue"), &config))
                .expect("Failed to open journal");
            let task = create_task(items);

            group.throughput(Throughput::Elements(items as u64));
            let label = if compression { "gzip" } else { "plain" };
            group.bench_with_input(BenchmarkId::new(label, items), &task, |b, task| {
                b.iter(|| {
                    rt.block_on(async {
                        let handle = queue
                            .append(task.clone())
                            .await
                            .expect("Failed to append task");
                        queue.remove(handle).await.expect("Failed to remove task");
                    });
                });
            });
        }
    }

    group.finish();
}

fn bench_recovery(c: &mut Criterion) {
    let rt = Runtime::new().expect("Failed to create Tokio runtime for benchmark");
    let mut group = c.benchmark_group("journal_recovery");
    group.sample_size(20);

    for &tasks in &[100usize, 1_000] {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = journal_config(&dir, true);
        let queue_dir = dir.path().join("queue");
        rt.block_on(async {
            let queue = DiskTaskQueue::open(&queue_dir, &config)
                .await
                .expect("Failed to open journal");
            for _ in 0..tasks {
                queue
                    .append(create_task(100))
                    .await
                    .expect("Failed to append task");
            }
        });

        group.bench_with_input(BenchmarkId::new("open", tasks), &tasks, |b, &tasks| {
            b.iter(|| {
                let queue = rt
                    .block_on(DiskTaskQueue::open(&queue_dir, &config))
                    .expect("Failed to reopen journal");
                assert_eq!(rt.block_on(queue.size()), tasks);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append_remove, bench_recovery);
criterion_main!(benches);

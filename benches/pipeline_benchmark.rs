//! Pipeline benchmarks
//!
//! Measures the bounded queue, batch formation, and the end-to-end
//! pipeline on synthetic engines. Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use highway_pipeline::batch_buffer::BatchBuffer;
use highway_pipeline::frame::Frame;
use highway_pipeline::queue::BoundedQueue;
use highway_pipeline::{EngineSet, ImageBuffer, Pipeline, PipelineConfig, ResultStatus};

fn bench_bounded_queue(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("bounded_queue");
    group.throughput(Throughput::Elements(10_000));

    for capacity in [16usize, 256, 4096].iter() {
        group.bench_with_input(
            format!("capacity_{}", capacity),
            capacity,
            |b, &capacity| {
                b.iter(|| {
                    rt.block_on(async {
                        let queue = Arc::new(BoundedQueue::new(capacity));

                        let producer = {
                            let queue = queue.clone();
                            tokio::spawn(async move {
                                for i in 0..10_000u64 {
                                    queue.send(i).await.unwrap();
                                }
                                queue.shutdown();
                            })
                        };

                        let consumer = {
                            let queue = queue.clone();
                            tokio::spawn(async move {
                                let mut count = 0u64;
                                while queue.recv().await.is_some() {
                                    count += 1;
                                }
                                count
                            })
                        };

                        producer.await.unwrap();
                        black_box(consumer.await.unwrap())
                    })
                })
            },
        );
    }

    group.finish();
}

fn bench_batch_formation(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("batch_formation");
    group.throughput(Throughput::Elements(1024));

    group.bench_function("form_32_batches", |b| {
        b.iter(|| {
            rt.block_on(async {
                let buffer = Arc::new(BatchBuffer::new(Duration::from_secs(60), 64));
                buffer.start();
                for id in 0..1024u64 {
                    buffer
                        .add(Frame::new(id, ImageBuffer::new(8, 8, 3)))
                        .await
                        .unwrap();
                }
                let mut batches = 0usize;
                for _ in 0..32 {
                    let batch = buffer.take().await.unwrap();
                    batches += batch.len();
                }
                buffer.stop().await;
                black_box(batches)
            })
        })
    });

    group.finish();
}

fn bench_end_to_end(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("end_to_end");
    group.sample_size(10);
    group.throughput(Throughput::Elements(64));

    group.bench_function("64_frames_320x240", |b| {
        b.iter(|| {
            rt.block_on(async {
                let config = PipelineConfig {
                    batch_flush_ms: 10,
                    ..Default::default()
                };
                let pipeline = Pipeline::new(config, EngineSet::synthetic()).unwrap();
                pipeline.start();

                let mut ids = Vec::new();
                for _ in 0..64 {
                    ids.push(
                        pipeline
                            .submit_move(ImageBuffer::new(320, 240, 3))
                            .await
                            .unwrap(),
                    );
                }
                for id in ids {
                    let result = pipeline.get_with_timeout(id, Duration::from_secs(30)).await;
                    assert_eq!(result.status, ResultStatus::Success);
                }
                pipeline.stop().await;
            })
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_bounded_queue,
    bench_batch_formation,
    bench_end_to_end
);
criterion_main!(benches);

//! Ingestion Throughput Benchmark (Criterion)
//!
//! Measures the cost of `record_request` on the gateway's hot path, with
//! the batch size large enough that no flush runs inside the loop.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_metering_engine::{AnalyticsWorker, Config, RequestMetric};
use llm_metering_engine::model::PricingEntry;
use llm_metering_engine::repository::InMemoryAnalyticsRepository;
use llm_metering_engine::telemetry::Telemetry;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    let mut config = Config::default();
    config.ingestion.batch_size = 1_000_000;
    config.ingestion.flush_interval = Duration::from_secs(3600);
    config.billing.pricing = vec![PricingEntry {
        provider: "openai".to_string(),
        model: None,
        input_per_million: Decimal::from(3),
        output_per_million: Decimal::from(15),
    }];
    config
}

fn metric(i: u64) -> RequestMetric {
    RequestMetric::builder(format!("req-{}", i), format!("org-{}", i % 16))
        .model("openai", "gpt-4o")
        .tokens(800 + i % 400, 200)
        .latency_ms(350)
        .build()
}

fn benchmark_record_request(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("record_request");

    for batch in [100u64, 1_000].iter() {
        group.throughput(Throughput::Elements(*batch));
        group.bench_with_input(BenchmarkId::new("records", batch), batch, |b, &batch| {
            let worker = AnalyticsWorker::new(
                Arc::new(InMemoryAnalyticsRepository::new()),
                None,
                &config(),
                Arc::new(Telemetry::disabled()),
            );
            runtime.block_on(async { worker.start().unwrap() });

            let mut next = 0u64;
            b.iter(|| {
                for _ in 0..batch {
                    worker.record_request(metric(next)).unwrap();
                    next += 1;
                }
            });

            runtime.block_on(async { worker.stop().await.unwrap() });
        });
    }

    group.finish();
}

fn benchmark_flush(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("flush_all");
    group.throughput(Throughput::Elements(1_000));

    group.bench_function("1000_records", |b| {
        b.to_async(&runtime).iter_batched(
            || {
                let worker = AnalyticsWorker::new(
                    Arc::new(InMemoryAnalyticsRepository::new()),
                    None,
                    &config(),
                    Arc::new(Telemetry::disabled()),
                );
                runtime.block_on(async { worker.start().unwrap() });
                for i in 0..1_000 {
                    worker.record_request(metric(i)).unwrap();
                }
                worker
            },
            |worker| async move {
                std::hint::black_box(worker.flush_all().await);
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, benchmark_record_request, benchmark_flush);
criterion_main!(benches);

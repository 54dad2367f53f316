//! Quota Check Benchmark (Criterion)
//!
//! Measures `check_usage_quotas` served from a warm cache and after the
//! cache entry has been invalidated.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_metering_engine::config::QuotaConfig;
use llm_metering_engine::quota::{InMemoryQuotaStore, QuotaPlan, QuotaTracker};
use llm_metering_engine::telemetry::Telemetry;
use rust_decimal::Decimal;
use std::sync::Arc;

fn tracker(runtime: &tokio::runtime::Runtime, organizations: usize) -> QuotaTracker {
    let tracker = QuotaTracker::new(
        Arc::new(InMemoryQuotaStore::new()),
        &QuotaConfig::default(),
        Arc::new(Telemetry::disabled()),
    );
    runtime.block_on(async {
        for i in 0..organizations {
            let plan = QuotaPlan::new(format!("org-{}", i))
                .with_max_requests(10_000)
                .with_max_tokens(5_000_000)
                .with_max_cost(Decimal::from(250));
            tracker.set_quota(plan).await.unwrap();
            tracker
                .check_usage_quotas(&format!("org-{}", i))
                .await
                .unwrap();
        }
    });
    tracker
}

fn benchmark_cached_check(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("quota_check_cached");

    for organizations in [10usize, 1_000].iter() {
        let tracker = tracker(&runtime, *organizations);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(
            BenchmarkId::new("organizations", organizations),
            &tracker,
            |b, tracker| {
                b.to_async(&runtime).iter(|| async {
                    std::hint::black_box(tracker.check_usage_quotas("org-5").await.unwrap());
                });
            },
        );
    }

    group.finish();
}

fn benchmark_store_check(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let tracker = tracker(&runtime, 100);
    let mut group = c.benchmark_group("quota_check_store");
    group.throughput(Throughput::Elements(1));

    group.bench_function("invalidated", |b| {
        b.to_async(&runtime).iter(|| async {
            tracker.invalidate("org-5");
            std::hint::black_box(tracker.check_usage_quotas("org-5").await.unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_cached_check, benchmark_store_check);
criterion_main!(benches);

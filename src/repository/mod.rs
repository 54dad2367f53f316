//! Analytics repository seam.
//!
//! The ingestion worker writes batches through [`AnalyticsRepository`] and
//! the read API queries aggregates through it. Any conforming backend
//! (SQL, columnar store, remote service) can be injected; the crate ships an
//! in-memory implementation used by the daemon and the tests.

mod memory;

pub use memory::InMemoryAnalyticsRepository;

use crate::model::{CostMetric, RequestMetric, TimeRange, UsageMetric};
use crate::Result;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bulk storage and aggregation of analytics facts.
///
/// Inserts are idempotent per call: re-submitting a batch must not double
/// count. Nothing is assumed about atomicity across batches.
#[async_trait]
pub trait AnalyticsRepository: Send + Sync {
    /// Store a batch of request metrics.
    async fn batch_insert_request_metrics(&self, metrics: &[RequestMetric]) -> Result<()>;

    /// Store a batch of usage events.
    async fn batch_insert_usage_metrics(&self, metrics: &[UsageMetric]) -> Result<()>;

    /// Store a batch of cost facts.
    async fn batch_insert_cost_metrics(&self, metrics: &[CostMetric]) -> Result<()>;

    /// Request and usage totals for an organization.
    async fn get_usage_stats(&self, organization_id: &str, range: TimeRange) -> Result<UsageStats>;

    /// Cost totals and breakdowns for an organization.
    async fn get_cost_stats(&self, organization_id: &str, range: TimeRange) -> Result<CostStats>;

    /// Bucketed request, token and cost totals.
    ///
    /// Only facts inside `range` count, so the buckets sum to the same
    /// totals as [`get_usage_stats`](Self::get_usage_stats) and
    /// [`get_cost_stats`](Self::get_cost_stats) over that range.
    async fn get_time_series(
        &self,
        organization_id: &str,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<TimeSeriesPoint>>;

    /// Totals per project.
    async fn get_project_usage(
        &self,
        organization_id: &str,
        range: TimeRange,
    ) -> Result<Vec<ProjectUsage>>;

    /// Materialize hourly rollups for the hour starting at `hour_start`.
    ///
    /// Re-running for the same hour recomputes it. A fact inserted later
    /// into an aggregated hour discards that hour's rollup. Returns the
    /// number of rollup rows written.
    async fn aggregate_hour(&self, hour_start: DateTime<Utc>) -> Result<usize>;
}

/// Bucket width of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One bucket per hour
    #[default]
    Hour,
    /// One bucket per UTC day
    Day,
}

impl Granularity {
    /// Bucket width.
    pub fn duration(&self) -> chrono::Duration {
        match self {
            Granularity::Hour => chrono::Duration::hours(1),
            Granularity::Day => chrono::Duration::days(1),
        }
    }
}

/// Request and usage totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// All requests
    pub total_requests: u64,
    /// Successful requests
    pub successful_requests: u64,
    /// Failed requests
    pub failed_requests: u64,
    /// Requests served from cache
    pub cache_hits: u64,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Total tokens
    pub total_tokens: u64,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
    /// Spans recorded
    pub spans: u64,
    /// Payload bytes recorded
    pub bytes: u64,
    /// Scores recorded
    pub scores: u64,
}

/// Cost totals and breakdowns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostStats {
    /// Billed amount
    pub total_cost: Decimal,
    /// List-price amount
    pub estimated_cost: Decimal,
    /// Breakdown by provider, highest cost first
    pub by_provider: Vec<CostBreakdown>,
    /// Breakdown by `provider/model`, highest cost first
    pub by_model: Vec<CostBreakdown>,
}

/// One row of a cost breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    /// Provider name or `provider/model`
    pub key: String,
    /// Requests in the group
    pub requests: u64,
    /// Billed amount of the group
    pub cost: Decimal,
}

/// One bucket of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    /// Bucket start
    pub timestamp: DateTime<Utc>,
    /// Requests in the bucket
    pub requests: u64,
    /// Failed requests in the bucket
    pub errors: u64,
    /// Tokens in the bucket
    pub tokens: u64,
    /// Billed amount in the bucket
    pub cost: Decimal,
    /// Mean latency in milliseconds
    pub avg_latency_ms: f64,
}

/// Totals of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectUsage {
    /// Project, `None` for requests without one
    pub project_id: Option<String>,
    /// Requests
    pub requests: u64,
    /// Tokens
    pub tokens: u64,
    /// Billed amount
    pub cost: Decimal,
}

/// Materialized per-organization totals of one hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRollup {
    /// Organization
    pub organization_id: String,
    /// Hour start
    pub hour_start: DateTime<Utc>,
    /// Requests
    pub requests: u64,
    /// Failed requests
    pub errors: u64,
    /// Tokens
    pub tokens: u64,
    /// Sum of latencies in milliseconds
    pub latency_sum_ms: u64,
    /// Billed amount
    pub cost: Decimal,
}

//! Read side of the analytics store.
//!
//! [`UsageAnalytics`] turns repository aggregates into the dashboard views
//! (overview, time series, per-project usage) and serializes time series
//! for export.

use crate::model::TimeRange;
use crate::repository::{AnalyticsRepository, Granularity, ProjectUsage, TimeSeriesPoint};
use crate::{Error, Result};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Headline numbers for an organization over a range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageOverview {
    /// Organization
    pub organization_id: String,
    /// Covered range
    pub range: TimeRange,
    /// Requests recorded
    pub total_requests: u64,
    /// Requests that succeeded upstream
    pub successful_requests: u64,
    /// Requests that failed upstream
    pub failed_requests: u64,
    /// Failed over total, 0 when there were no requests
    pub error_rate: f64,
    /// Requests answered from the gateway cache
    pub cache_hits: u64,
    /// Cache hits over total, 0 when there were no requests
    pub cache_hit_rate: f64,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Total tokens
    pub total_tokens: u64,
    /// Mean latency
    pub avg_latency_ms: f64,
    /// Actual cost
    pub total_cost: Decimal,
    /// Cost at list price, cache hits included
    pub estimated_cost: Decimal,
    /// Cost saved by cache hits and provider-reported prices
    pub savings: Decimal,
    /// Usage events: spans
    pub spans: u64,
    /// Usage events: payload bytes
    pub bytes: u64,
    /// Usage events: evaluation scores
    pub scores: u64,
}

/// Serialization format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Comma-separated values with a header row
    Csv,
    /// Pretty-printed JSON array
    Json,
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(Error::validation_field(
                format!("unknown export format '{}'", other),
                "format",
            )),
        }
    }
}

#[derive(Serialize)]
struct CsvRow {
    timestamp: String,
    requests: u64,
    errors: u64,
    tokens: u64,
    cost: String,
    avg_latency_ms: f64,
}

impl From<&TimeSeriesPoint> for CsvRow {
    fn from(point: &TimeSeriesPoint) -> Self {
        Self {
            timestamp: point.timestamp.to_rfc3339(),
            requests: point.requests,
            errors: point.errors,
            tokens: point.tokens,
            cost: point.cost.normalize().to_string(),
            avg_latency_ms: point.avg_latency_ms,
        }
    }
}

/// Dashboard queries over an [`AnalyticsRepository`].
pub struct UsageAnalytics {
    repository: Arc<dyn AnalyticsRepository>,
}

impl UsageAnalytics {
    /// Create the query layer.
    pub fn new(repository: Arc<dyn AnalyticsRepository>) -> Self {
        Self { repository }
    }

    /// Headline numbers for an organization.
    pub async fn get_usage_overview(&self, organization_id: &str, range: TimeRange) -> Result<UsageOverview> {
        let (usage, cost) = tokio::try_join!(
            self.repository.get_usage_stats(organization_id, range),
            self.repository.get_cost_stats(organization_id, range),
        )?;

        let rate = |part: u64| {
            if usage.total_requests == 0 {
                0.0
            } else {
                part as f64 / usage.total_requests as f64
            }
        };

        debug!(
            organization_id,
            requests = usage.total_requests,
            cost = %cost.total_cost,
            "Usage overview computed"
        );

        Ok(UsageOverview {
            organization_id: organization_id.to_string(),
            range,
            total_requests: usage.total_requests,
            successful_requests: usage.successful_requests,
            failed_requests: usage.failed_requests,
            error_rate: rate(usage.failed_requests),
            cache_hits: usage.cache_hits,
            cache_hit_rate: rate(usage.cache_hits),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            avg_latency_ms: usage.avg_latency_ms,
            total_cost: cost.total_cost,
            estimated_cost: cost.estimated_cost,
            savings: (cost.estimated_cost - cost.total_cost).max(Decimal::ZERO),
            spans: usage.spans,
            bytes: usage.bytes,
            scores: usage.scores,
        })
    }

    /// Bucketed totals, one point per bucket in the range.
    pub async fn get_usage_time_series(
        &self,
        organization_id: &str,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<TimeSeriesPoint>> {
        self.repository
            .get_time_series(organization_id, range, granularity)
            .await
    }

    /// Totals per project, highest cost first.
    pub async fn get_usage_by_project(&self, organization_id: &str, range: TimeRange) -> Result<Vec<ProjectUsage>> {
        self.repository.get_project_usage(organization_id, range).await
    }

    /// Query a time series and serialize it.
    pub async fn export_time_series(
        &self,
        organization_id: &str,
        range: TimeRange,
        granularity: Granularity,
        format: ExportFormat,
    ) -> Result<String> {
        let series = self
            .get_usage_time_series(organization_id, range, granularity)
            .await?;
        export(&series, format)
    }
}

/// Serialize a time series.
pub fn export(series: &[TimeSeriesPoint], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Csv => export_csv(series),
        ExportFormat::Json => export_json(series),
    }
}

/// Time series as CSV with a header row.
pub fn export_csv(series: &[TimeSeriesPoint]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for point in series {
        writer.serialize(CsvRow::from(point))?;
    }
    // An empty series still gets its header.
    if series.is_empty() {
        writer.write_record(["timestamp", "requests", "errors", "tokens", "cost", "avg_latency_ms"])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| Error::internal(format!("CSV export failed: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::internal(format!("CSV export is not UTF-8: {}", e)))
}

/// Time series as a JSON array.
pub fn export_json(series: &[TimeSeriesPoint]) -> Result<String> {
    Ok(serde_json::to_string_pretty(series)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BillingTier, PricingEntry, PricingTable, RequestMetric};
    use crate::repository::InMemoryAnalyticsRepository;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, h, m, 0).unwrap()
    }

    fn pricing() -> PricingTable {
        PricingTable::from_entries(&[PricingEntry {
            provider: "openai".to_string(),
            model: None,
            input_per_million: dec!(10),
            output_per_million: dec!(20),
        }])
    }

    async fn seeded() -> UsageAnalytics {
        let repo = Arc::new(InMemoryAnalyticsRepository::new());
        let requests = vec![
            RequestMetric::builder("r1", "org")
                .project("alpha")
                .model("openai", "gpt-4o")
                .tokens(100, 50)
                .latency_ms(100)
                .timestamp(at(9, 10))
                .build(),
            RequestMetric::builder("r2", "org")
                .project("alpha")
                .model("openai", "gpt-4o")
                .tokens(100, 50)
                .latency_ms(300)
                .cache_hit(true)
                .timestamp(at(9, 20))
                .build(),
            RequestMetric::builder("r3", "org")
                .project("beta")
                .model("openai", "gpt-4o")
                .tokens(100, 50)
                .failed(502, "bad gateway")
                .latency_ms(200)
                .timestamp(at(11, 0))
                .build(),
            RequestMetric::builder("r4", "other")
                .model("openai", "gpt-4o")
                .tokens(100, 50)
                .timestamp(at(9, 0))
                .build(),
        ];
        let table = pricing();
        let costs: Vec<_> = requests
            .iter()
            .map(|r| table.cost_for(r, "USD", 6, BillingTier::Free).0)
            .collect();
        repo.batch_insert_request_metrics(&requests).await.unwrap();
        repo.batch_insert_cost_metrics(&costs).await.unwrap();
        UsageAnalytics::new(repo)
    }

    fn morning() -> TimeRange {
        TimeRange::new(at(9, 0), at(12, 0)).unwrap()
    }

    #[tokio::test]
    async fn test_overview() {
        let analytics = seeded().await;
        let overview = analytics.get_usage_overview("org", morning()).await.unwrap();

        assert_eq!(overview.total_requests, 3);
        assert_eq!(overview.failed_requests, 1);
        assert!((overview.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((overview.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(overview.total_tokens, 450);
        assert_eq!(overview.avg_latency_ms, 200.0);
        // 0.002 per request, the cache hit is free
        assert_eq!(overview.total_cost, dec!(0.004));
        assert_eq!(overview.estimated_cost, dec!(0.006));
        assert_eq!(overview.savings, dec!(0.002));
    }

    #[tokio::test]
    async fn test_overview_without_traffic() {
        let analytics = seeded().await;
        let overview = analytics.get_usage_overview("nobody", morning()).await.unwrap();
        assert_eq!(overview.total_requests, 0);
        assert_eq!(overview.error_rate, 0.0);
        assert_eq!(overview.cache_hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_time_series_and_projects() {
        let analytics = seeded().await;

        let hourly = analytics
            .get_usage_time_series("org", morning(), Granularity::Hour)
            .await
            .unwrap();
        assert_eq!(hourly.len(), 3);
        assert_eq!(hourly[0].requests, 2);
        assert_eq!(hourly[2].errors, 1);

        let projects = analytics.get_usage_by_project("org", morning()).await.unwrap();
        assert_eq!(projects.len(), 2);
        let alpha = projects
            .iter()
            .find(|p| p.project_id.as_deref() == Some("alpha"))
            .unwrap();
        assert_eq!(alpha.requests, 2);
    }

    #[tokio::test]
    async fn test_csv_export_matches_series() {
        let analytics = seeded().await;
        let csv = analytics
            .export_time_series("org", morning(), Granularity::Hour, ExportFormat::Csv)
            .await
            .unwrap();

        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "timestamp,requests,errors,tokens,cost,avg_latency_ms");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("2026-10-17T09:00:00+00:00,2,0,300,0.002,"));
        assert!(lines[3].contains(",1,1,150,0.002,"));
    }

    #[tokio::test]
    async fn test_json_export_round_trips_values() {
        let analytics = seeded().await;
        let json = analytics
            .export_time_series("org", morning(), Granularity::Day, ExportFormat::Json)
            .await
            .unwrap();

        let parsed: Vec<TimeSeriesPoint> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].requests, 3);
        assert_eq!(parsed[0].cost, dec!(0.004));
    }

    #[test]
    fn test_empty_csv_has_header() {
        let csv = export_csv(&[]).unwrap();
        assert_eq!(csv.trim(), "timestamp,requests,errors,tokens,cost,avg_latency_ms");
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert!("xml".parse::<ExportFormat>().is_err());
    }
}

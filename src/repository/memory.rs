//! In-memory analytics repository.

use super::{
    AnalyticsRepository, CostBreakdown, CostStats, Granularity, HourlyRollup, ProjectUsage,
    TimeSeriesPoint, UsageStats,
};
use crate::model::{CostMetric, RequestMetric, TimeRange, UsageMetric};
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
struct Tables {
    requests: Vec<RequestMetric>,
    request_ids: HashSet<String>,
    usage: Vec<UsageMetric>,
    usage_sources: HashSet<String>,
    costs: Vec<CostMetric>,
    cost_ids: HashSet<String>,
}

/// Repository holding every fact in process memory.
#[derive(Default)]
pub struct InMemoryAnalyticsRepository {
    tables: RwLock<Tables>,
    rollups: DashMap<(String, DateTime<Utc>), HourlyRollup>,
    fail_inserts: AtomicBool,
    insert_delay: Mutex<Option<Duration>>,
    insert_calls: AtomicU64,
}

impl InMemoryAnalyticsRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent insert fail with a storage error.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Hold every subsequent insert for `delay` before it runs.
    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        *self.insert_delay.lock() = delay;
    }

    /// Number of batch insert calls received, failed ones included.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Number of stored request metrics.
    pub fn request_count(&self) -> usize {
        self.tables.read().requests.len()
    }

    /// Number of stored usage events.
    pub fn usage_count(&self) -> usize {
        self.tables.read().usage.len()
    }

    /// Number of stored cost facts.
    pub fn cost_count(&self) -> usize {
        self.tables.read().costs.len()
    }

    /// Materialized rollup of an organization's hour, if any.
    pub fn rollup(&self, organization_id: &str, hour_start: DateTime<Utc>) -> Option<HourlyRollup> {
        self.rollups
            .get(&(organization_id.to_string(), hour_start))
            .map(|r| r.clone())
    }

    async fn check_insert(&self) -> Result<()> {
        let delay = *self.insert_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(Error::storage("analytics repository unavailable"));
        }
        Ok(())
    }

    /// Totals for `hour` clipped to `range`.
    ///
    /// A materialized rollup is only used when the whole hour lies inside
    /// the range; partial hours are summed from the raw rows.
    fn hour_point(
        &self,
        organization_id: &str,
        hour: DateTime<Utc>,
        range: &TimeRange,
        tables: &Tables,
    ) -> HourlyRollup {
        let end = hour + chrono::Duration::hours(1);
        if hour >= range.start && end <= range.end {
            if let Some(rollup) = self.rollup(organization_id, hour) {
                return rollup;
            }
        }
        let window = TimeRange {
            start: hour.max(range.start),
            end: end.min(range.end),
        };
        compute_rollup(organization_id, hour, &window, tables)
    }

    /// Forget the rollup of the hour a new fact lands in.
    ///
    /// Called with the table write lock held so a concurrent
    /// `aggregate_hour` cannot store a rollup missing the fact.
    fn invalidate_rollup(&self, organization_id: &str, at: DateTime<Utc>) {
        let hour = truncate(at, Granularity::Hour);
        self.rollups.remove(&(organization_id.to_string(), hour));
    }
}

fn truncate(at: DateTime<Utc>, granularity: Granularity) -> DateTime<Utc> {
    at.duration_trunc(granularity.duration()).unwrap_or(at)
}

fn compute_rollup(
    organization_id: &str,
    hour: DateTime<Utc>,
    window: &TimeRange,
    tables: &Tables,
) -> HourlyRollup {
    let mut rollup = HourlyRollup {
        organization_id: organization_id.to_string(),
        hour_start: hour,
        requests: 0,
        errors: 0,
        tokens: 0,
        latency_sum_ms: 0,
        cost: Decimal::ZERO,
    };

    for metric in tables
        .requests
        .iter()
        .filter(|m| m.organization_id == organization_id && window.contains(m.timestamp))
    {
        rollup.requests += 1;
        if !metric.success {
            rollup.errors += 1;
        }
        rollup.tokens += metric.total_tokens;
        rollup.latency_sum_ms += metric.latency_ms;
    }

    rollup.cost = tables
        .costs
        .iter()
        .filter(|c| c.organization_id == organization_id && window.contains(c.timestamp))
        .map(|c| c.total_cost)
        .sum();

    rollup
}

fn sorted_breakdown(groups: HashMap<String, (u64, Decimal)>) -> Vec<CostBreakdown> {
    let mut rows: Vec<CostBreakdown> = groups
        .into_iter()
        .map(|(key, (requests, cost))| CostBreakdown { key, requests, cost })
        .collect();
    rows.sort_by(|a, b| b.cost.cmp(&a.cost).then_with(|| a.key.cmp(&b.key)));
    rows
}

#[async_trait]
impl AnalyticsRepository for InMemoryAnalyticsRepository {
    async fn batch_insert_request_metrics(&self, metrics: &[RequestMetric]) -> Result<()> {
        self.check_insert().await?;
        let mut tables = self.tables.write();
        for metric in metrics {
            if tables.request_ids.insert(metric.request_id.clone()) {
                self.invalidate_rollup(&metric.organization_id, metric.timestamp);
                tables.requests.push(metric.clone());
            }
        }
        Ok(())
    }

    async fn batch_insert_usage_metrics(&self, metrics: &[UsageMetric]) -> Result<()> {
        self.check_insert().await?;
        let mut tables = self.tables.write();
        for metric in metrics {
            if let Some(source) = &metric.source_request_id {
                if !tables.usage_sources.insert(source.clone()) {
                    continue;
                }
            }
            tables.usage.push(metric.clone());
        }
        Ok(())
    }

    async fn batch_insert_cost_metrics(&self, metrics: &[CostMetric]) -> Result<()> {
        self.check_insert().await?;
        let mut tables = self.tables.write();
        for metric in metrics {
            if tables.cost_ids.insert(metric.request_id.clone()) {
                self.invalidate_rollup(&metric.organization_id, metric.timestamp);
                tables.costs.push(metric.clone());
            }
        }
        Ok(())
    }

    async fn get_usage_stats(&self, organization_id: &str, range: TimeRange) -> Result<UsageStats> {
        let tables = self.tables.read();
        let mut stats = UsageStats::default();
        let mut latency_sum: u64 = 0;

        for metric in tables
            .requests
            .iter()
            .filter(|m| m.organization_id == organization_id && range.contains(m.timestamp))
        {
            stats.total_requests += 1;
            if metric.success {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }
            if metric.cache_hit {
                stats.cache_hits += 1;
            }
            stats.input_tokens += metric.input_tokens;
            stats.output_tokens += metric.output_tokens;
            stats.total_tokens += metric.total_tokens;
            latency_sum += metric.latency_ms;
        }

        for usage in tables
            .usage
            .iter()
            .filter(|u| u.organization_id == organization_id && range.contains(u.timestamp))
        {
            stats.spans += usage.spans;
            stats.bytes += usage.bytes;
            stats.scores += usage.scores;
        }

        if stats.total_requests > 0 {
            stats.avg_latency_ms = latency_sum as f64 / stats.total_requests as f64;
        }
        Ok(stats)
    }

    async fn get_cost_stats(&self, organization_id: &str, range: TimeRange) -> Result<CostStats> {
        let tables = self.tables.read();
        let mut stats = CostStats::default();
        let mut by_provider: HashMap<String, (u64, Decimal)> = HashMap::new();
        let mut by_model: HashMap<String, (u64, Decimal)> = HashMap::new();

        for cost in tables
            .costs
            .iter()
            .filter(|c| c.organization_id == organization_id && range.contains(c.timestamp))
        {
            stats.total_cost += cost.total_cost;
            stats.estimated_cost += cost.estimated_cost;

            let provider = by_provider.entry(cost.provider.clone()).or_default();
            provider.0 += 1;
            provider.1 += cost.total_cost;

            let model = by_model
                .entry(format!("{}/{}", cost.provider, cost.model))
                .or_default();
            model.0 += 1;
            model.1 += cost.total_cost;
        }

        stats.by_provider = sorted_breakdown(by_provider);
        stats.by_model = sorted_breakdown(by_model);
        Ok(stats)
    }

    async fn get_time_series(
        &self,
        organization_id: &str,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<TimeSeriesPoint>> {
        let tables = self.tables.read();
        let mut buckets: BTreeMap<DateTime<Utc>, HourlyRollup> = BTreeMap::new();

        let mut hour = truncate(range.start, Granularity::Hour);
        while hour < range.end {
            let point = self.hour_point(organization_id, hour, &range, &tables);
            let bucket = truncate(hour, granularity);
            let entry = buckets.entry(bucket).or_insert_with(|| HourlyRollup {
                organization_id: organization_id.to_string(),
                hour_start: bucket,
                requests: 0,
                errors: 0,
                tokens: 0,
                latency_sum_ms: 0,
                cost: Decimal::ZERO,
            });
            entry.requests += point.requests;
            entry.errors += point.errors;
            entry.tokens += point.tokens;
            entry.latency_sum_ms += point.latency_sum_ms;
            entry.cost += point.cost;
            hour += chrono::Duration::hours(1);
        }

        Ok(buckets
            .into_values()
            .map(|b| TimeSeriesPoint {
                timestamp: b.hour_start,
                requests: b.requests,
                errors: b.errors,
                tokens: b.tokens,
                cost: b.cost,
                avg_latency_ms: if b.requests > 0 {
                    b.latency_sum_ms as f64 / b.requests as f64
                } else {
                    0.0
                },
            })
            .collect())
    }

    async fn get_project_usage(
        &self,
        organization_id: &str,
        range: TimeRange,
    ) -> Result<Vec<ProjectUsage>> {
        let tables = self.tables.read();
        let mut projects: HashMap<Option<String>, ProjectUsage> = HashMap::new();

        for metric in tables
            .requests
            .iter()
            .filter(|m| m.organization_id == organization_id && range.contains(m.timestamp))
        {
            let entry = projects
                .entry(metric.project_id.clone())
                .or_insert_with(|| ProjectUsage {
                    project_id: metric.project_id.clone(),
                    requests: 0,
                    tokens: 0,
                    cost: Decimal::ZERO,
                });
            entry.requests += 1;
            entry.tokens += metric.total_tokens;
        }

        for cost in tables
            .costs
            .iter()
            .filter(|c| c.organization_id == organization_id && range.contains(c.timestamp))
        {
            let entry = projects
                .entry(cost.project_id.clone())
                .or_insert_with(|| ProjectUsage {
                    project_id: cost.project_id.clone(),
                    requests: 0,
                    tokens: 0,
                    cost: Decimal::ZERO,
                });
            entry.cost += cost.total_cost;
        }

        let mut rows: Vec<ProjectUsage> = projects.into_values().collect();
        rows.sort_by(|a, b| b.cost.cmp(&a.cost).then_with(|| a.project_id.cmp(&b.project_id)));
        Ok(rows)
    }

    async fn aggregate_hour(&self, hour_start: DateTime<Utc>) -> Result<usize> {
        let hour = truncate(hour_start, Granularity::Hour);
        let window = TimeRange {
            start: hour,
            end: hour + chrono::Duration::hours(1),
        };
        let tables = self.tables.read();

        let organizations: HashSet<&str> = tables
            .requests
            .iter()
            .filter(|m| window.contains(m.timestamp))
            .map(|m| m.organization_id.as_str())
            .chain(
                tables
                    .costs
                    .iter()
                    .filter(|c| window.contains(c.timestamp))
                    .map(|c| c.organization_id.as_str()),
            )
            .collect();

        for organization_id in &organizations {
            let rollup = compute_rollup(organization_id, hour, &window, &tables);
            self.rollups
                .insert((organization_id.to_string(), hour), rollup);
        }

        Ok(organizations.len())
    }
}

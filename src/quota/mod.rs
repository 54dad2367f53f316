//! Quota tracking.
//!
//! The tracker answers "may this organization make another request" from a
//! local cache and keeps the shared counters in a [`QuotaStore`] up to date.
//! A background sync task periodically reloads cached organizations so that
//! increments made by other instances become visible.
//!
//! Checks fail open: when the cache is stale and the store cannot be read,
//! the request is allowed and the status is flagged with `fail_open`.

mod store;
mod types;

pub use store::{InMemoryQuotaStore, QuotaStore};
pub use types::{DimensionStatus, QuotaDimension, QuotaPlan, QuotaStatus, UsageQuota};

use crate::cache::{CacheLookup, CacheStats, QuotaCache};
use crate::config::QuotaConfig;
use crate::model::BillingPeriod;
use crate::telemetry::Telemetry;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cached quota checks backed by a shared store.
pub struct QuotaTracker {
    store: Arc<dyn QuotaStore>,
    cache: QuotaCache,
    telemetry: Arc<Telemetry>,
    sync_interval: Duration,
    sync_task: Mutex<Option<SyncTask>>,
}

struct SyncTask {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl QuotaTracker {
    /// Create a tracker.
    pub fn new(store: Arc<dyn QuotaStore>, config: &QuotaConfig, telemetry: Arc<Telemetry>) -> Self {
        Self {
            store,
            cache: QuotaCache::new(config.cache_max_entries, config.cache_ttl),
            telemetry,
            sync_interval: config.sync_interval,
            sync_task: Mutex::new(None),
        }
    }

    /// Check every quota dimension of an organization.
    ///
    /// Only an empty organization ID is an error; an unreachable store
    /// yields a fail-open status instead.
    pub async fn check_usage_quotas(&self, organization_id: &str) -> Result<QuotaStatus> {
        self.check_usage_quotas_at(organization_id, Utc::now()).await
    }

    /// Check quotas as of `now`.
    pub async fn check_usage_quotas_at(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus> {
        require_org(organization_id)?;

        let status = match self.cache.lookup(organization_id) {
            CacheLookup::Fresh(None) => QuotaStatus {
                from_cache: true,
                ..QuotaStatus::unlimited(organization_id)
            },
            CacheLookup::Fresh(Some(quota)) if quota.period.contains(now) => QuotaStatus {
                from_cache: true,
                ..QuotaStatus::evaluate(&quota)
            },
            _ => match self.refresh(organization_id, now).await {
                Ok(Some(quota)) => QuotaStatus::evaluate(&quota),
                Ok(None) => QuotaStatus::unlimited(organization_id),
                Err(e) => {
                    warn!(
                        organization_id = %organization_id,
                        error = %e,
                        "Quota store unavailable, allowing request"
                    );
                    self.telemetry.record_quota_fail_open();
                    return Ok(QuotaStatus::fail_open(organization_id));
                }
            },
        };

        if !status.allowed() {
            debug!(
                organization_id = %organization_id,
                requests_ok = status.requests_ok,
                tokens_ok = status.tokens_ok,
                cost_ok = status.cost_ok,
                "Quota exceeded"
            );
            self.telemetry.record_quota_denial();
        }

        Ok(status)
    }

    /// Add `delta` to one dimension of the current period.
    pub async fn update_usage(
        &self,
        organization_id: &str,
        dimension: QuotaDimension,
        delta: Decimal,
    ) -> Result<()> {
        self.update_usage_at(organization_id, dimension, delta, Utc::now())
            .await
    }

    /// Add `delta` to one dimension of the period containing `at`.
    pub async fn update_usage_at(
        &self,
        organization_id: &str,
        dimension: QuotaDimension,
        delta: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        require_org(organization_id)?;
        if delta < Decimal::ZERO {
            return Err(Error::validation_field("usage delta cannot be negative", "delta"));
        }
        if delta.is_zero() {
            return Ok(());
        }

        let anchor = if self.cache.contains(organization_id) {
            self.cache
                .peek(organization_id)
                .and_then(|q| q.plan.billing_anchor)
        } else {
            self.refresh(organization_id, at)
                .await?
                .and_then(|q| q.plan.billing_anchor)
        };
        let period = BillingPeriod::containing(at, anchor);

        let value = self
            .store
            .increment(organization_id, &period, dimension, delta)
            .await?;

        match self.cache.peek(organization_id) {
            Some(quota) if quota.period == period => {
                self.cache.set_used(organization_id, dimension, value)
            }
            Some(_) => self.cache.invalidate(organization_id),
            None => {}
        }

        Ok(())
    }

    /// Record one request's consumption across all dimensions.
    pub async fn record_consumption(
        &self,
        organization_id: &str,
        requests: u64,
        tokens: u64,
        cost: Decimal,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_usage_at(organization_id, QuotaDimension::Requests, Decimal::from(requests), at)
            .await?;
        self.update_usage_at(organization_id, QuotaDimension::Tokens, Decimal::from(tokens), at)
            .await?;
        self.update_usage_at(organization_id, QuotaDimension::Cost, cost, at)
            .await
    }

    /// Create or replace an organization's plan.
    pub async fn set_quota(&self, plan: QuotaPlan) -> Result<()> {
        plan.validate()?;
        self.store.save_plan(&plan).await?;
        self.cache.invalidate(&plan.organization_id);
        info!(organization_id = %plan.organization_id, "Quota plan updated");
        Ok(())
    }

    /// Remove an organization's plan, making it unlimited.
    pub async fn remove_quota(&self, organization_id: &str) -> Result<bool> {
        let removed = self.store.delete_plan(organization_id).await?;
        self.cache.invalidate(organization_id);
        Ok(removed)
    }

    /// Drop the cached entry of an organization.
    pub fn invalidate(&self, organization_id: &str) {
        self.cache.invalidate(organization_id);
    }

    /// Reload every cached organization from the store.
    ///
    /// Organizations whose reload fails keep their stale entry. Returns the
    /// number of entries refreshed.
    pub async fn sync_once(&self) -> usize {
        let now = Utc::now();
        let mut refreshed = 0;

        for organization_id in self.cache.keys() {
            match self.refresh(&organization_id, now).await {
                Ok(_) => refreshed += 1,
                Err(e) => warn!(
                    organization_id = %organization_id,
                    error = %e,
                    "Quota sync failed"
                ),
            }
        }

        refreshed
    }

    /// Start the background sync task. A second call is a no-op.
    pub fn start_sync(self: &Arc<Self>) {
        let mut slot = self.sync_task.lock();
        if slot.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let tracker = Arc::clone(self);
        let period = self.sync_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let refreshed = tracker.sync_once().await;
                        debug!(refreshed, "Quota cache synced");
                    }
                }
            }
        });

        *slot = Some(SyncTask { shutdown, handle });
        info!(interval = ?period, "Quota sync started");
    }

    /// Stop the background sync task and wait for it to exit.
    pub async fn stop_sync(&self) {
        let task = self.sync_task.lock().take();
        if let Some(task) = task {
            task.shutdown.cancel();
            if let Err(e) = task.handle.await {
                warn!(error = %e, "Quota sync task ended abnormally");
            }
            info!("Quota sync stopped");
        }
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn refresh(&self, organization_id: &str, now: DateTime<Utc>) -> Result<Option<UsageQuota>> {
        let quota = self.store.load_quota(organization_id, now).await?;
        self.cache.put(organization_id, quota.clone());
        Ok(quota)
    }
}

fn require_org(organization_id: &str) -> Result<()> {
    if organization_id.trim().is_empty() {
        return Err(Error::validation_field(
            "organization ID is required",
            "organization_id",
        ));
    }
    Ok(())
}

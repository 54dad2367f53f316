//! Quota persistence.

use super::types::{QuotaDimension, QuotaPlan, UsageQuota};
use crate::model::BillingPeriod;
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared quota state.
///
/// Counters are keyed by organization, period and dimension. A new period
/// therefore starts from zero without an explicit reset, and several
/// tracker instances can increment the same counter concurrently.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Plan limits and the counters of the period containing `at`.
    ///
    /// Returns `None` when the organization has no plan.
    async fn load_quota(&self, organization_id: &str, at: DateTime<Utc>) -> Result<Option<UsageQuota>>;

    /// Create or replace a plan.
    async fn save_plan(&self, plan: &QuotaPlan) -> Result<()>;

    /// Remove a plan. Counters are kept.
    async fn delete_plan(&self, organization_id: &str) -> Result<bool>;

    /// Atomically add `delta` to a counter and return the new value.
    async fn increment(
        &self,
        organization_id: &str,
        period: &BillingPeriod,
        dimension: QuotaDimension,
        delta: Decimal,
    ) -> Result<Decimal>;
}

type CounterKey = (String, String, QuotaDimension);

/// In-memory quota store.
#[derive(Default)]
pub struct InMemoryQuotaStore {
    plans: DashMap<String, QuotaPlan>,
    counters: DashMap<CounterKey, Decimal>,
    unavailable: AtomicBool,
}

impl InMemoryQuotaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a storage error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current counter value.
    pub fn counter(&self, organization_id: &str, period: &BillingPeriod, dimension: QuotaDimension) -> Decimal {
        self.counters
            .get(&(organization_id.to_string(), period.key(), dimension))
            .map(|v| *v)
            .unwrap_or(Decimal::ZERO)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::storage("quota store unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn load_quota(&self, organization_id: &str, at: DateTime<Utc>) -> Result<Option<UsageQuota>> {
        self.check_available()?;

        let Some(plan) = self.plans.get(organization_id).map(|p| p.clone()) else {
            return Ok(None);
        };

        let period = BillingPeriod::containing(at, plan.billing_anchor);
        let mut quota = UsageQuota::fresh(plan, period);
        for dimension in QuotaDimension::ALL {
            quota.set_used(dimension, self.counter(organization_id, &period, dimension));
        }
        Ok(Some(quota))
    }

    async fn save_plan(&self, plan: &QuotaPlan) -> Result<()> {
        self.check_available()?;
        self.plans.insert(plan.organization_id.clone(), plan.clone());
        Ok(())
    }

    async fn delete_plan(&self, organization_id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.plans.remove(organization_id).is_some())
    }

    async fn increment(
        &self,
        organization_id: &str,
        period: &BillingPeriod,
        dimension: QuotaDimension,
        delta: Decimal,
    ) -> Result<Decimal> {
        self.check_available()?;

        let mut counter = self
            .counters
            .entry((organization_id.to_string(), period.key(), dimension))
            .or_insert(Decimal::ZERO);
        *counter += delta;
        Ok(*counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_load_without_plan() {
        let store = InMemoryQuotaStore::new();
        assert!(store.load_quota("org", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_counters_are_per_period() {
        let store = InMemoryQuotaStore::new();
        store
            .save_plan(&QuotaPlan::new("org").with_max_requests(10))
            .await
            .unwrap();

        let october = Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap();
        let period = BillingPeriod::calendar_month(october);
        store
            .increment("org", &period, QuotaDimension::Requests, dec!(3))
            .await
            .unwrap();

        let quota = store.load_quota("org", october).await.unwrap().unwrap();
        assert_eq!(quota.used_requests, 3);

        let november = Utc.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap();
        let quota = store.load_quota("org", november).await.unwrap().unwrap();
        assert_eq!(quota.used_requests, 0);
        assert_eq!(quota.period.start, november);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let store = Arc::new(InMemoryQuotaStore::new());
        let period = BillingPeriod::calendar_month(Utc::now());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    store
                        .increment("org", &period, QuotaDimension::Tokens, dec!(1))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.counter("org", &period, QuotaDimension::Tokens), dec!(1600));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = InMemoryQuotaStore::new();
        store.set_unavailable(true);
        assert!(store.load_quota("org", Utc::now()).await.is_err());
    }
}

//! Quota data types.

use crate::model::BillingPeriod;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A quota-limited dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaDimension {
    /// Request count
    Requests,
    /// Token count
    Tokens,
    /// Billed cost
    Cost,
}

impl QuotaDimension {
    /// All dimensions in reporting order.
    pub const ALL: [QuotaDimension; 3] = [
        QuotaDimension::Requests,
        QuotaDimension::Tokens,
        QuotaDimension::Cost,
    ];

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaDimension::Requests => "requests",
            QuotaDimension::Tokens => "tokens",
            QuotaDimension::Cost => "cost",
        }
    }
}

impl fmt::Display for QuotaDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Plan limits of an organization, as configured by an administrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaPlan {
    /// Organization
    pub organization_id: String,
    /// Monthly request limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u64>,
    /// Monthly token limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// Monthly cost limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cost: Option<Decimal>,
    /// Start of the account's billing cycle; calendar months when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_anchor: Option<DateTime<Utc>>,
    /// Percentage above each limit that is still allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overage_percent: Option<Decimal>,
    /// When false, checks report usage but never deny
    #[serde(default = "default_enforced")]
    pub enforced: bool,
}

fn default_enforced() -> bool {
    true
}

impl QuotaPlan {
    /// Create an enforced plan without limits.
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            max_requests: None,
            max_tokens: None,
            max_cost: None,
            billing_anchor: None,
            overage_percent: None,
            enforced: true,
        }
    }

    /// Set the request limit.
    pub fn with_max_requests(mut self, max: u64) -> Self {
        self.max_requests = Some(max);
        self
    }

    /// Set the token limit.
    pub fn with_max_tokens(mut self, max: u64) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Set the cost limit.
    pub fn with_max_cost(mut self, max: Decimal) -> Self {
        self.max_cost = Some(max);
        self
    }

    /// Set the billing anchor.
    pub fn with_billing_anchor(mut self, anchor: DateTime<Utc>) -> Self {
        self.billing_anchor = Some(anchor);
        self
    }

    /// Allow usage up to `percent` above each limit.
    pub fn with_overage_percent(mut self, percent: Decimal) -> Self {
        self.overage_percent = Some(percent);
        self
    }

    /// Set enforcement.
    pub fn with_enforced(mut self, enforced: bool) -> Self {
        self.enforced = enforced;
        self
    }

    /// Validate the plan.
    pub fn validate(&self) -> Result<()> {
        if self.organization_id.trim().is_empty() {
            return Err(Error::validation_field(
                "organization ID is required",
                "organization_id",
            ));
        }
        if matches!(self.max_cost, Some(c) if c < Decimal::ZERO) {
            return Err(Error::validation_field("cost limit cannot be negative", "max_cost"));
        }
        if matches!(self.overage_percent, Some(p) if p < Decimal::ZERO) {
            return Err(Error::validation_field(
                "overage percentage cannot be negative",
                "overage_percent",
            ));
        }
        Ok(())
    }

    /// Limit of a dimension.
    pub fn limit(&self, dimension: QuotaDimension) -> Option<Decimal> {
        match dimension {
            QuotaDimension::Requests => self.max_requests.map(Decimal::from),
            QuotaDimension::Tokens => self.max_tokens.map(Decimal::from),
            QuotaDimension::Cost => self.max_cost,
        }
    }
}

/// Plan limits joined with the live counters of the current period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageQuota {
    /// Limits
    pub plan: QuotaPlan,
    /// Period the counters belong to
    pub period: BillingPeriod,
    /// Requests consumed in the period
    pub used_requests: u64,
    /// Tokens consumed in the period
    pub used_tokens: u64,
    /// Cost consumed in the period
    pub used_cost: Decimal,
}

impl UsageQuota {
    /// A quota with zeroed counters for the given period.
    pub fn fresh(plan: QuotaPlan, period: BillingPeriod) -> Self {
        Self {
            plan,
            period,
            used_requests: 0,
            used_tokens: 0,
            used_cost: Decimal::ZERO,
        }
    }

    /// Counter of a dimension.
    pub fn used(&self, dimension: QuotaDimension) -> Decimal {
        match dimension {
            QuotaDimension::Requests => Decimal::from(self.used_requests),
            QuotaDimension::Tokens => Decimal::from(self.used_tokens),
            QuotaDimension::Cost => self.used_cost,
        }
    }

    /// Overwrite a counter with an authoritative value from the store.
    pub fn set_used(&mut self, dimension: QuotaDimension, value: Decimal) {
        use rust_decimal::prelude::ToPrimitive;
        match dimension {
            QuotaDimension::Requests => self.used_requests = value.to_u64().unwrap_or(u64::MAX),
            QuotaDimension::Tokens => self.used_tokens = value.to_u64().unwrap_or(u64::MAX),
            QuotaDimension::Cost => self.used_cost = value,
        }
    }

    /// Evaluate one dimension against the plan.
    pub fn dimension_status(&self, dimension: QuotaDimension) -> DimensionStatus {
        let used = self.used(dimension);
        let limit = self.plan.limit(dimension);

        let allowed = match limit {
            None => true,
            Some(_) if !self.plan.enforced => true,
            Some(limit) => {
                let overage = self.plan.overage_percent.unwrap_or(Decimal::ZERO);
                let effective = limit + limit * overage / Decimal::ONE_HUNDRED;
                used < effective
            }
        };

        DimensionStatus {
            dimension,
            used,
            limit,
            remaining: limit.map(|l| (l - used).max(Decimal::ZERO)),
            allowed,
        }
    }
}

/// Allow/deny verdict of one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionStatus {
    /// Dimension
    pub dimension: QuotaDimension,
    /// Consumed in the period
    pub used: Decimal,
    /// Limit, `None` when unlimited
    pub limit: Option<Decimal>,
    /// Headroom below the nominal limit
    pub remaining: Option<Decimal>,
    /// Whether another request may proceed
    pub allowed: bool,
}

/// Result of a quota check.
///
/// A denial is a value, not an error: callers decide whether to warn or block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Organization
    pub organization_id: String,
    /// Request dimension allowed
    pub requests_ok: bool,
    /// Token dimension allowed
    pub tokens_ok: bool,
    /// Cost dimension allowed
    pub cost_ok: bool,
    /// Per-dimension detail; empty when no plan exists or on fail-open
    pub dimensions: Vec<DimensionStatus>,
    /// Period the verdict applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<BillingPeriod>,
    /// The store could not be reached and the check allowed by default
    pub fail_open: bool,
    /// Answered from a fresh cache entry
    pub from_cache: bool,
}

impl QuotaStatus {
    /// Status of an organization without a plan.
    pub fn unlimited(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            requests_ok: true,
            tokens_ok: true,
            cost_ok: true,
            dimensions: Vec::new(),
            period: None,
            fail_open: false,
            from_cache: false,
        }
    }

    /// Status returned when the store is unavailable.
    pub fn fail_open(organization_id: impl Into<String>) -> Self {
        Self {
            fail_open: true,
            ..Self::unlimited(organization_id)
        }
    }

    /// Evaluate every dimension of a quota.
    pub fn evaluate(quota: &UsageQuota) -> Self {
        let dimensions: Vec<DimensionStatus> = QuotaDimension::ALL
            .iter()
            .map(|d| quota.dimension_status(*d))
            .collect();
        let ok = |dimension: QuotaDimension| {
            dimensions
                .iter()
                .find(|d| d.dimension == dimension)
                .map(|d| d.allowed)
                .unwrap_or(true)
        };

        Self {
            organization_id: quota.plan.organization_id.clone(),
            requests_ok: ok(QuotaDimension::Requests),
            tokens_ok: ok(QuotaDimension::Tokens),
            cost_ok: ok(QuotaDimension::Cost),
            period: Some(quota.period),
            fail_open: false,
            from_cache: false,
            dimensions,
        }
    }

    /// Whether every dimension allows another request.
    pub fn allowed(&self) -> bool {
        self.requests_ok && self.tokens_ok && self.cost_ok
    }

    /// Headroom of a dimension, `None` when unlimited.
    pub fn remaining(&self, dimension: QuotaDimension) -> Option<Decimal> {
        self.dimensions
            .iter()
            .find(|d| d.dimension == dimension)
            .and_then(|d| d.remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn period() -> BillingPeriod {
        BillingPeriod::calendar_month(Utc.with_ymd_and_hms(2026, 10, 17, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_request_limit_reached() {
        let plan = QuotaPlan::new("org").with_max_requests(10_000);
        let mut quota = UsageQuota::fresh(plan, period());
        quota.used_requests = 10_000;

        let status = QuotaStatus::evaluate(&quota);
        assert!(!status.requests_ok);
        assert!(status.tokens_ok);
        assert!(!status.allowed());
        assert_eq!(status.remaining(QuotaDimension::Requests), Some(Decimal::ZERO));
    }

    #[test]
    fn test_headroom() {
        let plan = QuotaPlan::new("org")
            .with_max_tokens(1_000)
            .with_max_cost(dec!(5));
        let mut quota = UsageQuota::fresh(plan, period());
        quota.used_tokens = 400;
        quota.used_cost = dec!(1.25);

        let status = QuotaStatus::evaluate(&quota);
        assert!(status.allowed());
        assert_eq!(status.remaining(QuotaDimension::Tokens), Some(dec!(600)));
        assert_eq!(status.remaining(QuotaDimension::Cost), Some(dec!(3.75)));
        assert_eq!(status.remaining(QuotaDimension::Requests), None);
    }

    #[test]
    fn test_overage_allowance() {
        let plan = QuotaPlan::new("org")
            .with_max_requests(100)
            .with_overage_percent(dec!(10));
        let mut quota = UsageQuota::fresh(plan, period());

        quota.used_requests = 105;
        assert!(QuotaStatus::evaluate(&quota).requests_ok);

        quota.used_requests = 110;
        assert!(!QuotaStatus::evaluate(&quota).requests_ok);
    }

    #[test]
    fn test_unenforced_plan_never_denies() {
        let plan = QuotaPlan::new("org").with_max_requests(1).with_enforced(false);
        let mut quota = UsageQuota::fresh(plan, period());
        quota.used_requests = 50;
        assert!(QuotaStatus::evaluate(&quota).allowed());
    }

    #[test]
    fn test_plan_validation() {
        assert!(QuotaPlan::new("").validate().is_err());
        assert!(QuotaPlan::new("org").with_max_cost(dec!(-1)).validate().is_err());
        assert!(QuotaPlan::new("org").validate().is_ok());
    }
}

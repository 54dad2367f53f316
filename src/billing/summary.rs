//! Period billing summaries.

use crate::discount::AppliedDiscount;
use crate::model::{BillingPeriod, CostMetric};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStatus {
    /// Computed and still open to recalculation
    Calculated,
    /// Invoiced; totals are frozen
    Sent,
    /// Settled; immutable
    Paid,
}

impl SummaryStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::Calculated => "calculated",
            SummaryStatus::Sent => "sent",
            SummaryStatus::Paid => "paid",
        }
    }

    /// Whether recalculation must return the stored summary.
    pub fn is_frozen(&self) -> bool {
        !matches!(self, SummaryStatus::Calculated)
    }
}

impl fmt::Display for SummaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Totals of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderBreakdown {
    /// Provider
    pub provider: String,
    /// Requests
    pub requests: u64,
    /// Tokens
    pub tokens: u64,
    /// Gross cost
    pub cost: Decimal,
}

/// Totals of one provider and model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBreakdown {
    /// Provider
    pub provider: String,
    /// Model
    pub model: String,
    /// Requests
    pub requests: u64,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Gross cost
    pub cost: Decimal,
}

/// Billing rollup of one organization and period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSummary {
    /// Stable ID derived from organization and period
    pub id: String,
    /// Organization
    pub organization_id: String,
    /// Period
    pub period: BillingPeriod,
    /// Currency of every amount
    pub currency: String,
    /// Ledger entries in the period
    pub total_requests: u64,
    /// Prompt tokens
    pub total_input_tokens: u64,
    /// Completion tokens
    pub total_output_tokens: u64,
    /// Gross cost before discounts
    pub total_cost: Decimal,
    /// Sum of all discounts
    pub discount_total: Decimal,
    /// Payable amount, never negative
    pub net_cost: Decimal,
    /// Gross cost by provider, sorted by name
    pub by_provider: Vec<ProviderBreakdown>,
    /// Gross cost by provider and model, sorted by name
    pub by_model: Vec<ModelBreakdown>,
    /// Discount totals by rule
    pub discounts: Vec<AppliedDiscount>,
    /// Lifecycle state
    pub status: SummaryStatus,
    /// When the totals were computed
    pub calculated_at: DateTime<Utc>,
}

impl BillingSummary {
    /// Summary ID of an organization and period.
    pub fn id_for(organization_id: &str, period: &BillingPeriod) -> String {
        format!("{}:{}", organization_id, period.key())
    }

    /// Total tokens.
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens.saturating_add(self.total_output_tokens)
    }
}

/// Gross-cost breakdowns of a set of ledger entries.
pub(crate) fn breakdowns(entries: &[CostMetric]) -> (Vec<ProviderBreakdown>, Vec<ModelBreakdown>) {
    let mut providers: BTreeMap<&str, ProviderBreakdown> = BTreeMap::new();
    let mut models: BTreeMap<(&str, &str), ModelBreakdown> = BTreeMap::new();

    for entry in entries {
        let p = providers
            .entry(entry.provider.as_str())
            .or_insert_with(|| ProviderBreakdown {
                provider: entry.provider.clone(),
                requests: 0,
                tokens: 0,
                cost: Decimal::ZERO,
            });
        p.requests += 1;
        p.tokens += entry.tokens();
        p.cost += entry.total_cost;

        let m = models
            .entry((entry.provider.as_str(), entry.model.as_str()))
            .or_insert_with(|| ModelBreakdown {
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                requests: 0,
                input_tokens: 0,
                output_tokens: 0,
                cost: Decimal::ZERO,
            });
        m.requests += 1;
        m.input_tokens += entry.input_tokens;
        m.output_tokens += entry.output_tokens;
        m.cost += entry.total_cost;
    }

    (providers.into_values().collect(), models.into_values().collect())
}

/// Merge per-entry discount contributions by rule, keeping first-seen order.
pub(crate) fn merge_discounts(applied: impl IntoIterator<Item = AppliedDiscount>) -> Vec<AppliedDiscount> {
    let mut merged: Vec<AppliedDiscount> = Vec::new();
    for discount in applied {
        match merged.iter_mut().find(|d| d.discount_id == discount.discount_id) {
            Some(existing) => existing.amount += discount.amount,
            None => merged.push(discount),
        }
    }
    merged
}

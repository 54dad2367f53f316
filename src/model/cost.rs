//! Cost facts derived from request metrics.

use super::BillingTier;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Round a monetary amount to `scale` decimal places, half away from zero.
///
/// Every monetary step in the engine goes through this function so that
/// recomputing an invoice from the same ledger reproduces it to the cent.
pub fn round_amount(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Where the billed amount of a [`CostMetric`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostSource {
    /// Computed from the pricing table
    Estimated,
    /// Reported by the upstream provider
    Reported,
    /// Served from cache; nothing billed
    CacheHit,
}

/// Immutable cost fact for one request.
///
/// `total_cost` is the billed amount. `estimated_cost` is always the
/// list-price figure so that reported and cached requests can be compared
/// against it. Discounts are resolved at bill calculation, which is why
/// `discount_applied` is zero on freshly derived facts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetric {
    /// Gateway request identifier
    pub request_id: String,
    /// Billed organization
    pub organization_id: String,
    /// Project within the organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Upstream provider
    pub provider: String,
    /// Model that served the request
    pub model: String,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// List-price cost of the prompt tokens
    pub input_cost: Decimal,
    /// List-price cost of the completion tokens
    pub output_cost: Decimal,
    /// Billed amount
    pub total_cost: Decimal,
    /// List-price amount
    pub estimated_cost: Decimal,
    /// Origin of `total_cost`
    pub source: CostSource,
    /// ISO currency code
    pub currency: String,
    /// Tier in effect for the request
    pub billing_tier: BillingTier,
    /// Discount already deducted from `total_cost`
    pub discount_applied: Decimal,
    /// Completion time of the originating request
    pub timestamp: DateTime<Utc>,
}

impl CostMetric {
    /// Whether the billed amount came from the pricing table.
    pub fn is_estimated(&self) -> bool {
        self.source == CostSource::Estimated
    }

    /// Total tokens billed by this fact.
    pub fn tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_amount_half_away_from_zero() {
        assert_eq!(round_amount(dec!(0.0000125), 6), dec!(0.000013));
        assert_eq!(round_amount(dec!(0.0000124), 6), dec!(0.000012));
        assert_eq!(round_amount(dec!(1.005), 2), dec!(1.01));
    }
}

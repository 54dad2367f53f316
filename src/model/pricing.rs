//! Model pricing and cost derivation.

use super::{round_amount, BillingTier, CostMetric, CostSource, RequestMetric};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One line of the configured price list.
///
/// An entry without `model` is the provider-wide fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    /// Provider name
    pub provider: String,
    /// Model name; `None` prices every model of the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Price per million prompt tokens
    pub input_per_million: Decimal,
    /// Price per million completion tokens
    pub output_per_million: Decimal,
}

/// Per-token prices of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Price per million prompt tokens
    pub input_per_million: Decimal,
    /// Price per million completion tokens
    pub output_per_million: Decimal,
}

impl ModelPrice {
    /// A price of zero for both directions.
    pub const FREE: ModelPrice = ModelPrice {
        input_per_million: Decimal::ZERO,
        output_per_million: Decimal::ZERO,
    };
}

/// Lookup table from provider/model to price.
///
/// Lookups are case-insensitive. Exact model prices win over the provider
/// fallback; unknown models are priced at zero and flagged by the caller.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    models: HashMap<(String, String), ModelPrice>,
    providers: HashMap<String, ModelPrice>,
}

impl PricingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configured entries. Later entries override earlier ones.
    pub fn from_entries(entries: &[PricingEntry]) -> Self {
        let mut table = Self::new();
        for entry in entries {
            let price = ModelPrice {
                input_per_million: entry.input_per_million,
                output_per_million: entry.output_per_million,
            };
            match &entry.model {
                Some(model) => table.set_model_price(&entry.provider, model, price),
                None => table.set_provider_price(&entry.provider, price),
            }
        }
        table
    }

    /// Set the price of a single model.
    pub fn set_model_price(&mut self, provider: &str, model: &str, price: ModelPrice) {
        self.models
            .insert((provider.to_lowercase(), model.to_lowercase()), price);
    }

    /// Set the fallback price of a provider.
    pub fn set_provider_price(&mut self, provider: &str, price: ModelPrice) {
        self.providers.insert(provider.to_lowercase(), price);
    }

    /// Find the price of a model.
    pub fn price_for(&self, provider: &str, model: &str) -> Option<ModelPrice> {
        let provider = provider.to_lowercase();
        self.models
            .get(&(provider.clone(), model.to_lowercase()))
            .or_else(|| self.providers.get(&provider))
            .copied()
    }

    /// Number of priced models and provider fallbacks.
    pub fn len(&self) -> usize {
        self.models.len() + self.providers.len()
    }

    /// Whether the table has no prices.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Derive the cost fact of a request.
    ///
    /// Returns the cost metric and whether a price was found.
    pub fn cost_for(
        &self,
        metric: &RequestMetric,
        currency: &str,
        scale: u32,
        default_tier: BillingTier,
    ) -> (CostMetric, bool) {
        let price = self.price_for(&metric.provider, &metric.model);
        let priced = price.is_some();
        let price = price.unwrap_or(ModelPrice::FREE);

        let million = Decimal::from(1_000_000u64);
        let input_cost = round_amount(
            Decimal::from(metric.input_tokens) * price.input_per_million / million,
            scale,
        );
        let output_cost = round_amount(
            Decimal::from(metric.output_tokens) * price.output_per_million / million,
            scale,
        );
        let estimated_cost = input_cost + output_cost;

        let (total_cost, source) = if metric.cache_hit {
            (Decimal::ZERO, CostSource::CacheHit)
        } else if let Some(reported) = metric.reported_cost {
            (round_amount(reported, scale), CostSource::Reported)
        } else {
            (estimated_cost, CostSource::Estimated)
        };

        let cost = CostMetric {
            request_id: metric.request_id.clone(),
            organization_id: metric.organization_id.clone(),
            project_id: metric.project_id.clone(),
            provider: metric.provider.clone(),
            model: metric.model.clone(),
            input_tokens: metric.input_tokens,
            output_tokens: metric.output_tokens,
            input_cost,
            output_cost,
            total_cost,
            estimated_cost,
            source,
            currency: currency.to_string(),
            billing_tier: metric.billing_tier.unwrap_or(default_tier),
            discount_applied: Decimal::ZERO,
            timestamp: metric.timestamp,
        };

        (cost, priced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn table() -> PricingTable {
        PricingTable::from_entries(&[
            PricingEntry {
                provider: "openai".to_string(),
                model: Some("gpt-4o".to_string()),
                input_per_million: dec!(2.50),
                output_per_million: dec!(10.00),
            },
            PricingEntry {
                provider: "anthropic".to_string(),
                model: None,
                input_per_million: dec!(3.00),
                output_per_million: dec!(15.00),
            },
        ])
    }

    fn request(provider: &str, model: &str) -> RequestMetric {
        RequestMetric::builder("req-1", "org-1")
            .model(provider, model)
            .tokens(1_000, 200)
            .build()
    }

    #[test]
    fn test_exact_model_price() {
        let (cost, priced) = table().cost_for(&request("OpenAI", "GPT-4o"), "USD", 6, BillingTier::Pro);
        assert!(priced);
        assert_eq!(cost.input_cost, dec!(0.0025));
        assert_eq!(cost.output_cost, dec!(0.002));
        assert_eq!(cost.total_cost, dec!(0.0045));
        assert_eq!(cost.source, CostSource::Estimated);
        assert_eq!(cost.billing_tier, BillingTier::Pro);
    }

    #[test]
    fn test_provider_fallback() {
        let (cost, priced) = table().cost_for(&request("anthropic", "claude-haiku"), "USD", 6, BillingTier::Free);
        assert!(priced);
        assert_eq!(cost.total_cost, dec!(0.006));
    }

    #[test]
    fn test_unknown_model_is_free() {
        let (cost, priced) = table().cost_for(&request("mistral", "large"), "USD", 6, BillingTier::Free);
        assert!(!priced);
        assert_eq!(cost.total_cost, Decimal::ZERO);
    }

    #[test]
    fn test_cache_hit_bills_nothing() {
        let mut metric = request("openai", "gpt-4o");
        metric.cache_hit = true;
        let (cost, _) = table().cost_for(&metric, "USD", 6, BillingTier::Free);
        assert_eq!(cost.total_cost, Decimal::ZERO);
        assert_eq!(cost.estimated_cost, dec!(0.0045));
        assert_eq!(cost.source, CostSource::CacheHit);
    }

    #[test]
    fn test_reported_cost_wins() {
        let mut metric = request("openai", "gpt-4o");
        metric.reported_cost = Some(dec!(0.004));
        let (cost, _) = table().cost_for(&metric, "USD", 6, BillingTier::Free);
        assert_eq!(cost.total_cost, dec!(0.004));
        assert_eq!(cost.estimated_cost, dec!(0.0045));
        assert!(!cost.is_estimated());
    }
}

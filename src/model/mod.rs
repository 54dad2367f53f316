//! Metric model.
//!
//! Value types describing what happened on a single gateway request
//! ([`RequestMetric`]), what it cost ([`CostMetric`]) and how much of each
//! budget dimension it consumed ([`UsageMetric`]), plus the pricing table and
//! billing-period arithmetic shared by every other component.

mod cost;
mod period;
mod pricing;
mod request;
mod usage;

pub use cost::{round_amount, CostMetric, CostSource};
pub use period::{BillingPeriod, TimeRange};
pub use pricing::{ModelPrice, PricingEntry, PricingTable};
pub use request::{RequestMetric, RequestMetricBuilder};
pub use usage::UsageMetric;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Plan tier an organization is billed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BillingTier {
    /// Free plan
    #[default]
    Free,
    /// Entry paid plan
    Starter,
    /// Professional plan
    Pro,
    /// Negotiated enterprise contract
    Enterprise,
}

impl BillingTier {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingTier::Free => "free",
            BillingTier::Starter => "starter",
            BillingTier::Pro => "pro",
            BillingTier::Enterprise => "enterprise",
        }
    }
}

impl fmt::Display for BillingTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BillingTier {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(BillingTier::Free),
            "starter" => Ok(BillingTier::Starter),
            "pro" => Ok(BillingTier::Pro),
            "enterprise" => Ok(BillingTier::Enterprise),
            _ => Err(crate::Error::validation(format!("Unknown billing tier: {}", s))),
        }
    }
}

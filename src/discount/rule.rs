//! Discount rules.

use crate::model::BillingTier;
use crate::{Error, Result};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A discount rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    /// Unique identifier, also the stacking tie-breaker
    pub id: String,
    /// Display name, used on invoices
    pub name: String,
    /// How the discount reduces cost
    pub kind: DiscountKind,
    /// Applicability
    #[serde(default)]
    pub conditions: DiscountConditions,
    /// Higher priorities apply first
    #[serde(default)]
    pub priority: i32,
    /// Inactive discounts never apply
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// How a discount reduces cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountKind {
    /// Scale the running cost down by a percentage
    Percentage {
        /// Percentage in `[0, 100]`
        percent: Decimal,
    },
    /// Subtract a flat amount from the period total
    Fixed {
        /// Amount, never taking the total below zero
        amount: Decimal,
    },
    /// Charge a volume-dependent fraction of the running cost
    Tiered {
        /// Brackets ordered by ascending `min_volume`
        brackets: Vec<TierBracket>,
    },
}

/// Volume bracket of a tiered discount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierBracket {
    /// Lowest volume the bracket applies to
    pub min_volume: u64,
    /// Fraction of the price charged, in `[0, 1]`
    pub rate: Decimal,
}

/// Conditions that must all hold for a discount to apply.
///
/// Empty lists and absent bounds match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscountConditions {
    /// Billing tiers
    pub tiers: Vec<BillingTier>,
    /// Providers, case-insensitive
    pub providers: Vec<String>,
    /// Models, case-insensitive
    pub models: Vec<String>,
    /// Inclusive start of validity
    pub valid_from: Option<DateTime<Utc>>,
    /// Exclusive end of validity
    pub valid_until: Option<DateTime<Utc>>,
    /// Minimum volume to date
    pub min_volume: Option<u64>,
    /// Maximum volume to date
    pub max_volume: Option<u64>,
    /// Only for customers younger than this many days
    pub first_time_customer_days: Option<u32>,
}

/// Facts a discount is matched against.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscountContext {
    /// Billing tier of the organization
    pub tier: BillingTier,
    /// Usage to date in the period, including the entry being priced
    pub volume: u64,
    /// Provider of the entry, absent at invoice level
    pub provider: Option<String>,
    /// Model of the entry, absent at invoice level
    pub model: Option<String>,
    /// When the usage happened
    pub at: DateTime<Utc>,
    /// When the organization became a customer
    pub customer_since: Option<DateTime<Utc>>,
}

impl DiscountContext {
    /// Context without provider, model or tenure.
    pub fn new(tier: BillingTier, volume: u64, at: DateTime<Utc>) -> Self {
        Self {
            tier,
            volume,
            provider: None,
            model: None,
            at,
            customer_since: None,
        }
    }

    /// Set provider and model.
    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    /// Set customer tenure start.
    pub fn with_customer_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.customer_since = since;
        self
    }
}

impl Discount {
    /// A percentage discount with no conditions.
    pub fn percentage(id: impl Into<String>, percent: Decimal) -> Self {
        Self::with_kind(id, DiscountKind::Percentage { percent })
    }

    /// A fixed discount with no conditions.
    pub fn fixed(id: impl Into<String>, amount: Decimal) -> Self {
        Self::with_kind(id, DiscountKind::Fixed { amount })
    }

    /// A tiered discount with no conditions.
    pub fn tiered(id: impl Into<String>, brackets: Vec<TierBracket>) -> Self {
        Self::with_kind(id, DiscountKind::Tiered { brackets })
    }

    fn with_kind(id: impl Into<String>, kind: DiscountKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            conditions: DiscountConditions::default(),
            priority: 0,
            active: true,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the conditions.
    pub fn with_conditions(mut self, conditions: DiscountConditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// Whether the discount is flat and applies to a period total.
    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, DiscountKind::Fixed { .. })
    }

    /// Validate the rule.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation_field("discount ID is required", "id"));
        }

        match &self.kind {
            DiscountKind::Percentage { percent } => {
                if *percent < Decimal::ZERO || *percent > Decimal::ONE_HUNDRED {
                    return Err(Error::validation_field(
                        format!("discount {}: percentage must be within 0..=100", self.id),
                        "percent",
                    ));
                }
            }
            DiscountKind::Fixed { amount } => {
                if *amount < Decimal::ZERO {
                    return Err(Error::validation_field(
                        format!("discount {}: fixed amount cannot be negative", self.id),
                        "amount",
                    ));
                }
                if !self.conditions.providers.is_empty() || !self.conditions.models.is_empty() {
                    return Err(Error::validation_field(
                        format!(
                            "discount {}: fixed discounts apply to period totals and cannot filter by provider or model",
                            self.id
                        ),
                        "conditions",
                    ));
                }
            }
            DiscountKind::Tiered { brackets } => validate_brackets(&self.id, brackets)?,
        }

        let c = &self.conditions;
        if let (Some(from), Some(until)) = (c.valid_from, c.valid_until) {
            if until <= from {
                return Err(Error::validation_field(
                    format!("discount {}: validity window is empty", self.id),
                    "valid_until",
                ));
            }
        }
        if let (Some(min), Some(max)) = (c.min_volume, c.max_volume) {
            if max < min {
                return Err(Error::validation_field(
                    format!("discount {}: volume bracket is empty", self.id),
                    "max_volume",
                ));
            }
        }

        Ok(())
    }

    /// Whether the discount applies in the given context.
    pub fn applies(&self, ctx: &DiscountContext) -> bool {
        if !self.active {
            return false;
        }
        let c = &self.conditions;

        if !c.tiers.is_empty() && !c.tiers.contains(&ctx.tier) {
            return false;
        }
        if !matches_name(&c.providers, ctx.provider.as_deref()) {
            return false;
        }
        if !matches_name(&c.models, ctx.model.as_deref()) {
            return false;
        }
        if matches!(c.valid_from, Some(from) if ctx.at < from) {
            return false;
        }
        if matches!(c.valid_until, Some(until) if ctx.at >= until) {
            return false;
        }
        if matches!(c.min_volume, Some(min) if ctx.volume < min) {
            return false;
        }
        if matches!(c.max_volume, Some(max) if ctx.volume > max) {
            return false;
        }
        if let Some(days) = c.first_time_customer_days {
            match ctx.customer_since {
                Some(since) if ctx.at - since < Duration::days(i64::from(days)) => {}
                _ => return false,
            }
        }

        true
    }

    /// Cost after applying this discount to `running`, before rounding.
    pub fn apply_to(&self, running: Decimal, volume: u64) -> Decimal {
        match &self.kind {
            DiscountKind::Percentage { percent } => {
                running - running * *percent / Decimal::ONE_HUNDRED
            }
            DiscountKind::Fixed { amount } => (running - *amount).max(Decimal::ZERO),
            DiscountKind::Tiered { brackets } => running * tier_rate(brackets, volume),
        }
    }
}

/// Fraction of the price charged at `volume`.
///
/// Volumes below the first bracket pay full price.
pub fn tier_rate(brackets: &[TierBracket], volume: u64) -> Decimal {
    brackets
        .iter()
        .rev()
        .find(|b| volume >= b.min_volume)
        .map(|b| b.rate)
        .unwrap_or(Decimal::ONE)
}

fn validate_brackets(id: &str, brackets: &[TierBracket]) -> Result<()> {
    if brackets.is_empty() {
        return Err(Error::validation_field(
            format!("discount {}: tiered discount needs at least one bracket", id),
            "brackets",
        ));
    }

    let mut previous: Option<&TierBracket> = None;
    for bracket in brackets {
        if bracket.rate < Decimal::ZERO || bracket.rate > Decimal::ONE {
            return Err(Error::validation_field(
                format!("discount {}: bracket rate must be within 0..=1", id),
                "brackets",
            ));
        }
        if let Some(prev) = previous {
            if bracket.min_volume <= prev.min_volume {
                return Err(Error::validation_field(
                    format!("discount {}: brackets must have ascending volumes", id),
                    "brackets",
                ));
            }
            if bracket.rate > prev.rate {
                return Err(Error::validation_field(
                    format!("discount {}: bracket rates cannot increase with volume", id),
                    "brackets",
                ));
            }
        }
        previous = Some(bracket);
    }

    Ok(())
}

fn matches_name(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(value) => allowed.iter().any(|a| a.eq_ignore_ascii_case(value)),
        None => false,
    }
}

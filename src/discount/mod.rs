//! Discount calculation.
//!
//! [`DiscountCalculator`] is a pure function over a set of rules: given a
//! cost and a [`DiscountContext`] it returns the discounted cost and every
//! rule that contributed. Rules stack in priority order (highest first, ties
//! broken by ID) and each step works on the running cost of the previous
//! one, rounded to the billing scale.
//!
//! Percentage and tiered rules price individual ledger entries. Fixed rules
//! are credits against a period total and are applied separately.

mod rule;

pub use rule::{tier_rate, Discount, DiscountConditions, DiscountContext, DiscountKind, TierBracket};

use crate::model::round_amount;
use crate::Result;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which rules a calculation considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountScope {
    /// Percentage and tiered rules, priced per ledger entry
    Entry,
    /// Fixed credits against a period total
    Period,
    /// Every rule
    All,
}

impl DiscountScope {
    fn includes(&self, discount: &Discount) -> bool {
        match self {
            DiscountScope::Entry => !discount.is_fixed(),
            DiscountScope::Period => discount.is_fixed(),
            DiscountScope::All => true,
        }
    }
}

/// One rule's contribution to a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedDiscount {
    /// Rule ID
    pub discount_id: String,
    /// Rule name
    pub name: String,
    /// Amount taken off
    pub amount: Decimal,
}

/// Result of a calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountOutcome {
    /// Cost before discounts
    pub gross: Decimal,
    /// Cost after discounts, never negative
    pub net: Decimal,
    /// Rules that took something off, in application order
    pub applied: Vec<AppliedDiscount>,
}

impl DiscountOutcome {
    /// Total amount taken off.
    pub fn discount_total(&self) -> Decimal {
        self.gross - self.net
    }
}

/// Applies discount rules in stacking order.
#[derive(Debug, Clone, Default)]
pub struct DiscountCalculator {
    discounts: Vec<Discount>,
    scale: u32,
}

impl DiscountCalculator {
    /// Validate and order a rule set.
    pub fn new(mut discounts: Vec<Discount>, scale: u32) -> Result<Self> {
        for discount in &discounts {
            discount.validate()?;
        }
        discounts.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(Self { discounts, scale })
    }

    /// Rules in stacking order.
    pub fn discounts(&self) -> &[Discount] {
        &self.discounts
    }

    /// Rules of a scope that apply in the given context, in stacking order.
    pub fn applicable<'a>(
        &'a self,
        ctx: &'a DiscountContext,
        scope: DiscountScope,
    ) -> impl Iterator<Item = &'a Discount> + 'a {
        self.discounts
            .iter()
            .filter(move |d| scope.includes(d) && d.applies(ctx))
    }

    /// Apply every applicable rule of a scope to `cost`.
    pub fn apply(&self, cost: Decimal, ctx: &DiscountContext, scope: DiscountScope) -> DiscountOutcome {
        let gross = round_amount(cost.max(Decimal::ZERO), self.scale);
        let mut running = gross;
        let mut applied = Vec::new();

        for discount in self.applicable(ctx, scope) {
            let next = round_amount(discount.apply_to(running, ctx.volume), self.scale)
                .max(Decimal::ZERO);
            let amount = running - next;
            if amount > Decimal::ZERO {
                applied.push(AppliedDiscount {
                    discount_id: discount.id.clone(),
                    name: discount.name.clone(),
                    amount,
                });
            }
            running = next;
        }

        DiscountOutcome {
            gross,
            net: running,
            applied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BillingTier;
    use chrono::Utc;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn ctx() -> DiscountContext {
        DiscountContext::new(BillingTier::Pro, 1, Utc::now()).with_model("openai", "gpt-4")
    }

    #[test]
    fn test_ten_percent() {
        let calc = DiscountCalculator::new(vec![Discount::percentage("ten", dec!(10))], 6).unwrap();

        let total: Decimal = [dec!(0.003), dec!(0.002), dec!(0.012)]
            .iter()
            .map(|c| calc.apply(*c, &ctx(), DiscountScope::Entry).discount_total())
            .sum();
        assert_eq!(total, dec!(0.0017));
    }

    #[test]
    fn test_priority_order_and_ties() {
        let calc = DiscountCalculator::new(
            vec![
                Discount::percentage("b", dec!(10)),
                Discount::fixed("credit", dec!(50)).with_priority(10),
                Discount::percentage("a", dec!(50)),
            ],
            6,
        )
        .unwrap();

        let ids: Vec<&str> = calc.discounts().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["credit", "a", "b"]);

        // 100 -> 50 (credit) -> 25 (a) -> 22.5 (b)
        let outcome = calc.apply(dec!(100), &ctx(), DiscountScope::All);
        assert_eq!(outcome.net, dec!(22.5));
        assert_eq!(outcome.applied.len(), 3);
        assert_eq!(outcome.applied[0].amount, dec!(50));
        assert_eq!(outcome.discount_total(), dec!(77.5));
    }

    #[test]
    fn test_fixed_floors_at_zero() {
        let calc = DiscountCalculator::new(vec![Discount::fixed("credit", dec!(10))], 6).unwrap();
        let outcome = calc.apply(dec!(3), &ctx(), DiscountScope::Period);
        assert_eq!(outcome.net, Decimal::ZERO);
        assert_eq!(outcome.discount_total(), dec!(3));
    }

    #[test]
    fn test_scope_filters_kinds() {
        let calc = DiscountCalculator::new(
            vec![Discount::fixed("credit", dec!(1)), Discount::percentage("p", dec!(10))],
            6,
        )
        .unwrap();

        let entry = calc.apply(dec!(10), &ctx(), DiscountScope::Entry);
        assert_eq!(entry.net, dec!(9));

        let period = calc.apply(dec!(10), &ctx(), DiscountScope::Period);
        assert_eq!(period.net, dec!(9));
        assert_eq!(period.applied[0].discount_id, "credit");
    }

    #[test]
    fn test_tiered_uses_volume() {
        let calc = DiscountCalculator::new(
            vec![Discount::tiered(
                "volume",
                vec![
                    TierBracket { min_volume: 10, rate: dec!(0.9) },
                    TierBracket { min_volume: 100, rate: dec!(0.5) },
                ],
            )],
            6,
        )
        .unwrap();

        let mut c = ctx();
        c.volume = 5;
        assert_eq!(calc.apply(dec!(1), &c, DiscountScope::Entry).net, dec!(1));
        c.volume = 10;
        assert_eq!(calc.apply(dec!(1), &c, DiscountScope::Entry).net, dec!(0.9));
        c.volume = 150;
        assert_eq!(calc.apply(dec!(1), &c, DiscountScope::Entry).net, dec!(0.5));
    }

    #[test]
    fn test_rounding_each_step() {
        let calc = DiscountCalculator::new(vec![Discount::percentage("third", dec!(33.3333))], 2).unwrap();
        let outcome = calc.apply(dec!(1), &ctx(), DiscountScope::Entry);
        assert_eq!(outcome.net, dec!(0.67));
    }

    #[test]
    fn test_invalid_rule_rejected() {
        assert!(DiscountCalculator::new(vec![Discount::percentage("", dec!(1))], 6).is_err());
    }

    fn any_discount() -> impl Strategy<Value = Discount> {
        prop_oneof![
            (0u32..=100).prop_map(|p| Discount::percentage(format!("p{}", p), Decimal::from(p))),
            (0i64..10_000).prop_map(|a| Discount::fixed(format!("f{}", a), Decimal::new(a, 2))),
            (0u32..=100).prop_map(|r| Discount::tiered(
                format!("t{}", r),
                vec![TierBracket { min_volume: 0, rate: Decimal::new(i64::from(r), 2) }],
            )),
        ]
    }

    proptest! {
        #[test]
        fn net_is_never_negative_nor_above_gross(
            discounts in prop::collection::vec(any_discount(), 0..6),
            cost in 0i64..1_000_000,
        ) {
            let calc = DiscountCalculator::new(discounts, 6).unwrap();
            let gross = Decimal::new(cost, 4);
            let outcome = calc.apply(gross, &ctx(), DiscountScope::All);
            prop_assert!(outcome.net >= Decimal::ZERO);
            prop_assert!(outcome.net <= outcome.gross);
            let applied: Decimal = outcome.applied.iter().map(|a| a.amount).sum();
            prop_assert_eq!(applied, outcome.discount_total());
        }
    }
}

//! Billing aggregation.
//!
//! The aggregator owns the only write path into the ledger: the ingestion
//! worker forwards flushed cost facts through [`BillingSink`], the aggregator
//! appends them and then feeds the quota counters and budget evaluation of
//! every affected scope. Period summaries, invoices and payment records are
//! derived from the ledger on demand.

mod invoice;
mod ledger;
mod summary;

pub use invoice::{BillingAddress, Invoice, InvoiceLineItem, InvoiceStatus, PaymentRecord, TaxInfo};
pub use ledger::{InMemoryLedgerStore, LedgerStore};
pub use summary::{BillingSummary, ModelBreakdown, ProviderBreakdown, SummaryStatus};

use crate::budget::{BudgetEngine, BudgetScope, UsageSnapshot};
use crate::config::BillingConfig;
use crate::discount::{DiscountCalculator, DiscountContext, DiscountScope};
use crate::model::{round_amount, BillingPeriod, BillingTier, CostMetric, UsageMetric};
use crate::quota::QuotaTracker;
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Downstream of the ingestion worker's cost and usage flushes.
#[async_trait]
pub trait BillingSink: Send + Sync {
    /// Record a batch of cost facts.
    async fn record_costs(&self, costs: &[CostMetric]) -> Result<()>;

    /// Record a batch of usage events.
    async fn record_usage_events(&self, _events: &[UsageMetric]) -> Result<()> {
        Ok(())
    }
}

/// Turns cost facts into ledgers, summaries and invoices.
pub struct BillingAggregator {
    ledger: Arc<dyn LedgerStore>,
    discounts: DiscountCalculator,
    quota: Option<Arc<QuotaTracker>>,
    budgets: Option<Arc<BudgetEngine>>,
    currency: String,
    scale: u32,
    default_tier: BillingTier,
    payment_terms: Duration,
}

impl BillingAggregator {
    /// Create an aggregator with the configured discount rules.
    pub fn new(ledger: Arc<dyn LedgerStore>, config: &BillingConfig) -> Result<Self> {
        Ok(Self {
            ledger,
            discounts: DiscountCalculator::new(config.discounts.clone(), config.rounding_scale)?,
            quota: None,
            budgets: None,
            currency: config.currency.clone(),
            scale: config.rounding_scale,
            default_tier: config.default_tier,
            payment_terms: Duration::days(i64::from(config.payment_terms_days)),
        })
    }

    /// Feed appended facts into quota counters.
    pub fn with_quota_tracker(mut self, quota: Arc<QuotaTracker>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Evaluate budgets after every append.
    pub fn with_budget_engine(mut self, budgets: Arc<BudgetEngine>) -> Self {
        self.budgets = Some(budgets);
        self
    }

    /// Append cost facts to the ledger and propagate them.
    ///
    /// Facts already in the ledger are ignored, so a re-submitted batch does
    /// not double count quotas or budgets.
    pub async fn record_usage(&self, costs: &[CostMetric]) -> Result<usize> {
        if costs.is_empty() {
            return Ok(0);
        }

        let appended = self.ledger.append_entries(costs).await?;
        if appended.len() < costs.len() {
            debug!(
                submitted = costs.len(),
                appended = appended.len(),
                "Skipped duplicate ledger entries"
            );
        }

        if let Some(quota) = &self.quota {
            for entry in &appended {
                if let Err(e) = quota
                    .record_consumption(
                        &entry.organization_id,
                        1,
                        entry.tokens(),
                        entry.total_cost,
                        entry.timestamp,
                    )
                    .await
                {
                    warn!(
                        organization_id = %entry.organization_id,
                        request_id = %entry.request_id,
                        error = %e,
                        "Failed to update quota counters"
                    );
                }
            }
        }

        if let Some(budgets) = &self.budgets {
            let deltas = group_by_scope(appended.iter().map(|e| {
                (
                    e.organization_id.as_str(),
                    e.project_id.as_deref(),
                    e.timestamp,
                    UsageSnapshot {
                        cost: e.total_cost,
                        ..Default::default()
                    },
                )
            }));
            for ((scope, _), (at, delta)) in deltas {
                budgets.record_usage(&scope, &delta, at).await?;
            }
        }

        Ok(appended.len())
    }

    /// Compute the summary of an organization's period.
    ///
    /// Invoiced and paid summaries are returned unchanged. Otherwise the
    /// summary is recomputed from the ledger and stored.
    ///
    /// Percentage and tiered discounts apply to each entry; fixed discounts
    /// apply once to the summed entry net afterwards. Priority orders
    /// discounts within each of these two scopes only, so a fixed discount
    /// never runs before an entry discount whatever its priority.
    pub async fn calculate_bill(&self, organization_id: &str, period: BillingPeriod) -> Result<BillingSummary> {
        if organization_id.trim().is_empty() {
            return Err(Error::validation_field(
                "organization ID is required",
                "organization_id",
            ));
        }

        let summary_id = BillingSummary::id_for(organization_id, &period);
        if let Some(existing) = self.ledger.get_summary(&summary_id).await? {
            if existing.status.is_frozen() {
                return Ok(existing);
            }
        }

        let mut entries = self.ledger.entries(organization_id, period.range()).await?;
        entries.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        let customer_since = self.ledger.first_entry_at(organization_id).await?;

        let mut total_cost = Decimal::ZERO;
        let mut entry_net = Decimal::ZERO;
        let mut applied = Vec::new();

        for (index, entry) in entries.iter().enumerate() {
            let ctx = DiscountContext::new(entry.billing_tier, index as u64 + 1, entry.timestamp)
                .with_model(&entry.provider, &entry.model)
                .with_customer_since(customer_since);
            let outcome = self.discounts.apply(entry.total_cost, &ctx, DiscountScope::Entry);

            total_cost += outcome.gross;
            entry_net += outcome.net;
            applied.extend(outcome.applied);
        }

        let tier = entries
            .last()
            .map(|e| e.billing_tier)
            .unwrap_or(self.default_tier);
        let at = entries.last().map(|e| e.timestamp).unwrap_or(period.start);
        let period_ctx = DiscountContext::new(tier, entries.len() as u64, at)
            .with_customer_since(customer_since);
        let outcome = self
            .discounts
            .apply(entry_net, &period_ctx, DiscountScope::Period);
        applied.extend(outcome.applied);

        let net_cost = outcome.net.max(Decimal::ZERO);
        let (by_provider, by_model) = summary::breakdowns(&entries);

        let summary = BillingSummary {
            id: summary_id,
            organization_id: organization_id.to_string(),
            period,
            currency: self.currency.clone(),
            total_requests: entries.len() as u64,
            total_input_tokens: entries.iter().map(|e| e.input_tokens).sum(),
            total_output_tokens: entries.iter().map(|e| e.output_tokens).sum(),
            total_cost: round_amount(total_cost, self.scale),
            discount_total: round_amount(total_cost - net_cost, self.scale),
            net_cost,
            by_provider,
            by_model,
            discounts: summary::merge_discounts(applied),
            status: SummaryStatus::Calculated,
            calculated_at: Utc::now(),
        };

        self.ledger.save_summary(&summary).await?;
        info!(
            organization_id = %organization_id,
            period = %period,
            total = %summary.total_cost,
            discounts = %summary.discount_total,
            net = %summary.net_cost,
            "Billing summary calculated"
        );
        Ok(summary)
    }

    /// Look up a stored summary.
    pub async fn get_summary(&self, organization_id: &str, period: &BillingPeriod) -> Result<BillingSummary> {
        let summary_id = BillingSummary::id_for(organization_id, period);
        self.ledger
            .get_summary(&summary_id)
            .await?
            .ok_or_else(|| Error::not_found("billing summary", summary_id))
    }

    /// Generate a draft invoice for a summary.
    ///
    /// A summary that already has a live invoice returns that invoice.
    pub async fn generate_invoice(
        &self,
        summary: &BillingSummary,
        tax: Option<TaxInfo>,
        billing_address: Option<BillingAddress>,
    ) -> Result<Invoice> {
        if matches!(&tax, Some(t) if t.rate < Decimal::ZERO) {
            return Err(Error::validation_field("tax rate cannot be negative", "tax.rate"));
        }
        if summary.status == SummaryStatus::Paid {
            return Err(Error::invalid_transition("billing summary", summary.status, "invoiced"));
        }

        let existing = self
            .ledger
            .list_invoices(&summary.organization_id)
            .await?
            .into_iter()
            .find(|i| i.summary_id == summary.id && i.status != InvoiceStatus::Void);
        if let Some(invoice) = existing {
            return Ok(invoice);
        }

        let month = summary.period.start.format("%Y%m").to_string();
        let sequence = self.ledger.next_invoice_sequence(&month).await?;
        let invoice = Invoice::draft(
            summary,
            invoice::invoice_number(&summary.period, sequence),
            tax,
            billing_address,
            self.scale,
        );
        self.ledger.save_invoice(&invoice).await?;

        info!(
            invoice_id = %invoice.id,
            number = %invoice.number,
            total = %invoice.total,
            "Invoice generated"
        );
        Ok(invoice)
    }

    /// Invoices of an organization.
    pub async fn list_invoices(&self, organization_id: &str) -> Result<Vec<Invoice>> {
        self.ledger.list_invoices(organization_id).await
    }

    /// Look up an invoice owned by `organization_id`.
    pub async fn get_invoice(&self, organization_id: &str, invoice_id: &str) -> Result<Invoice> {
        match self.ledger.get_invoice(invoice_id).await? {
            Some(invoice) if invoice.organization_id == organization_id => Ok(invoice),
            _ => Err(Error::not_found("invoice", invoice_id)),
        }
    }

    /// Send a draft invoice; due date follows the payment terms.
    pub async fn mark_invoice_sent(&self, organization_id: &str, invoice_id: &str) -> Result<Invoice> {
        let mut invoice = self.get_invoice(organization_id, invoice_id).await?;
        invoice.transition(InvoiceStatus::Sent)?;
        let now = Utc::now();
        invoice.sent_at = Some(now);
        invoice.due_at = Some(now + self.payment_terms);

        self.set_summary_status(&invoice.summary_id, SummaryStatus::Sent).await?;
        self.ledger.save_invoice(&invoice).await?;
        info!(invoice_id = %invoice.id, "Invoice sent");
        Ok(invoice)
    }

    /// Record settlement of an invoice and write a payment record.
    pub async fn mark_invoice_paid(
        &self,
        organization_id: &str,
        invoice_id: &str,
        reference: Option<String>,
    ) -> Result<Invoice> {
        let mut invoice = self.get_invoice(organization_id, invoice_id).await?;
        invoice.transition(InvoiceStatus::Paid)?;
        let now = Utc::now();
        invoice.paid_at = Some(now);

        let payment = PaymentRecord {
            id: Uuid::new_v4().to_string(),
            invoice_id: invoice.id.clone(),
            organization_id: invoice.organization_id.clone(),
            amount: invoice.total,
            currency: invoice.currency.clone(),
            reference,
            paid_at: now,
        };

        self.set_summary_status(&invoice.summary_id, SummaryStatus::Paid).await?;
        self.ledger.save_invoice(&invoice).await?;
        self.ledger.record_payment(&payment).await?;
        info!(invoice_id = %invoice.id, amount = %payment.amount, "Invoice paid");
        Ok(invoice)
    }

    /// Flag a sent invoice as past due.
    pub async fn mark_invoice_overdue(&self, organization_id: &str, invoice_id: &str) -> Result<Invoice> {
        let mut invoice = self.get_invoice(organization_id, invoice_id).await?;
        invoice.transition(InvoiceStatus::Overdue)?;
        self.ledger.save_invoice(&invoice).await?;
        warn!(invoice_id = %invoice.id, due_at = ?invoice.due_at, "Invoice overdue");
        Ok(invoice)
    }

    /// Cancel an unpaid invoice, reopening its summary.
    pub async fn void_invoice(&self, organization_id: &str, invoice_id: &str) -> Result<Invoice> {
        let mut invoice = self.get_invoice(organization_id, invoice_id).await?;
        invoice.transition(InvoiceStatus::Void)?;

        self.set_summary_status(&invoice.summary_id, SummaryStatus::Calculated)
            .await?;
        self.ledger.save_invoice(&invoice).await?;
        info!(invoice_id = %invoice.id, "Invoice voided");
        Ok(invoice)
    }

    /// Payment history of an organization.
    pub async fn payment_history(&self, organization_id: &str) -> Result<Vec<PaymentRecord>> {
        self.ledger.payments(organization_id).await
    }

    async fn set_summary_status(&self, summary_id: &str, status: SummaryStatus) -> Result<()> {
        let Some(mut summary) = self.ledger.get_summary(summary_id).await? else {
            return Err(Error::not_found("billing summary", summary_id));
        };
        if summary.status == SummaryStatus::Paid && status != SummaryStatus::Paid {
            return Err(Error::invalid_transition("billing summary", summary.status, status));
        }
        summary.status = status;
        self.ledger.save_summary(&summary).await
    }
}

#[async_trait]
impl BillingSink for BillingAggregator {
    async fn record_costs(&self, costs: &[CostMetric]) -> Result<()> {
        self.record_usage(costs).await.map(|_| ())
    }

    async fn record_usage_events(&self, events: &[UsageMetric]) -> Result<()> {
        let Some(budgets) = &self.budgets else {
            return Ok(());
        };

        let deltas = group_by_scope(events.iter().map(|e| {
            (
                e.organization_id.as_str(),
                e.project_id.as_deref(),
                e.timestamp,
                UsageSnapshot {
                    spans: e.spans,
                    bytes: e.bytes,
                    scores: e.scores,
                    cost: Decimal::ZERO,
                },
            )
        }));
        for ((scope, _), (at, delta)) in deltas {
            budgets.record_usage(&scope, &delta, at).await?;
        }
        Ok(())
    }
}

type ScopeDeltas = BTreeMap<(String, String), (BudgetScope, DateTime<Utc>, UsageSnapshot)>;

/// Sum usage per budget scope and calendar month.
///
/// Each item counts toward its organization and, when present, its project.
fn group_by_scope<'a>(
    items: impl Iterator<Item = (&'a str, Option<&'a str>, DateTime<Utc>, UsageSnapshot)>,
) -> Vec<((BudgetScope, String), (DateTime<Utc>, UsageSnapshot))> {
    let mut grouped: ScopeDeltas = BTreeMap::new();

    for (organization_id, project_id, at, delta) in items {
        let period_key = BillingPeriod::calendar_month(at).key();
        for scope in BudgetScope::affected(organization_id, project_id) {
            let entry = grouped
                .entry((scope.to_string(), period_key.clone()))
                .or_insert_with(|| (scope, at, UsageSnapshot::default()));
            entry.1 = entry.1.max(at);
            entry.2.add(&delta);
        }
    }

    grouped
        .into_iter()
        .map(|((_, period_key), (scope, at, delta))| ((scope, period_key), (at, delta)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{AlertFilter, BudgetLimits, InMemoryBudgetStore, NewBudget};
    use crate::config::{BudgetConfig, QuotaConfig, TelemetryConfig};
    use crate::discount::{Discount, DiscountConditions};
    use crate::model::{PricingTable, RequestMetric};
    use crate::quota::{InMemoryQuotaStore, QuotaDimension, QuotaPlan};
    use crate::telemetry::Telemetry;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn october() -> BillingPeriod {
        BillingPeriod::calendar_month(Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap())
    }

    fn fact(id: &str, org: &str, amount: Decimal, minute: u32) -> CostMetric {
        let metric = RequestMetric::builder(id, org)
            .model("openai", "gpt-4o")
            .tokens(100, 50)
            .reported_cost(amount)
            .timestamp(Utc.with_ymd_and_hms(2026, 10, 5, 12, minute, 0).unwrap())
            .build();
        PricingTable::new()
            .cost_for(&metric, "USD", 6, BillingTier::Pro)
            .0
    }

    fn aggregator(discounts: Vec<Discount>) -> (BillingAggregator, Arc<InMemoryLedgerStore>) {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let config = BillingConfig {
            discounts,
            ..Default::default()
        };
        (BillingAggregator::new(ledger.clone(), &config).unwrap(), ledger)
    }

    #[tokio::test]
    async fn test_ten_percent_bill() {
        let (billing, _) = aggregator(vec![Discount::percentage("ten", dec!(10))]);
        billing
            .record_usage(&[
                fact("r1", "org", dec!(0.003), 0),
                fact("r2", "org", dec!(0.002), 1),
                fact("r3", "org", dec!(0.012), 2),
            ])
            .await
            .unwrap();

        let summary = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(summary.total_requests, 3);
        assert_eq!(summary.total_cost, dec!(0.017));
        assert_eq!(summary.discount_total, dec!(0.0017));
        assert_eq!(summary.net_cost, dec!(0.0153));
        assert_eq!(summary.discounts.len(), 1);
        assert_eq!(summary.discounts[0].amount, dec!(0.0017));
        assert_eq!(summary.by_model.len(), 1);
        assert_eq!(summary.by_provider[0].tokens, 450);
    }

    #[tokio::test]
    async fn test_calculation_is_deterministic() {
        let (billing, _) = aggregator(vec![
            Discount::percentage("ten", dec!(10)),
            Discount::fixed("credit", dec!(0.001)),
        ]);
        billing
            .record_usage(&[fact("r2", "org", dec!(0.5), 1), fact("r1", "org", dec!(0.25), 0)])
            .await
            .unwrap();

        let first = billing.calculate_bill("org", october()).await.unwrap();
        let second = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(first.total_cost, second.total_cost);
        assert_eq!(first.discount_total, second.discount_total);
        assert_eq!(first.net_cost, second.net_cost);
        assert_eq!(first.id, second.id);
        // 0.75 -> 0.675 -> 0.674
        assert_eq!(first.net_cost, dec!(0.674));
    }

    #[tokio::test]
    async fn test_fixed_applies_after_entry_discounts() {
        let (billing, _) = aggregator(vec![
            Discount::percentage("half", dec!(50)),
            Discount::fixed("credit", dec!(0.4)).with_priority(10),
        ]);
        billing
            .record_usage(&[fact("r1", "org", dec!(1), 0)])
            .await
            .unwrap();

        let summary = billing.calculate_bill("org", october()).await.unwrap();
        // 1 -> 0.5 -> 0.1, not 1 -> 0.6 -> 0.3
        assert_eq!(summary.net_cost, dec!(0.1));
        assert_eq!(summary.discount_total, dec!(0.9));
    }

    #[tokio::test]
    async fn test_net_floored_at_zero() {
        let (billing, _) = aggregator(vec![Discount::fixed("credit", dec!(100))]);
        billing
            .record_usage(&[fact("r1", "org", dec!(3), 0)])
            .await
            .unwrap();

        let summary = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(summary.net_cost, Decimal::ZERO);
        assert_eq!(summary.discount_total, dec!(3));
    }

    #[tokio::test]
    async fn test_tiered_discount_by_volume() {
        let (billing, _) = aggregator(vec![Discount::tiered(
            "volume",
            vec![crate::discount::TierBracket {
                min_volume: 3,
                rate: dec!(0.5),
            }],
        )]);
        billing
            .record_usage(&[
                fact("r1", "org", dec!(1), 0),
                fact("r2", "org", dec!(1), 1),
                fact("r3", "org", dec!(1), 2),
                fact("r4", "org", dec!(1), 3),
            ])
            .await
            .unwrap();

        let summary = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(summary.net_cost, dec!(3));
    }

    #[tokio::test]
    async fn test_model_filtered_discount() {
        let discount = Discount::percentage("claude", dec!(50)).with_conditions(DiscountConditions {
            providers: vec!["anthropic".to_string()],
            ..Default::default()
        });
        let (billing, _) = aggregator(vec![discount]);
        billing
            .record_usage(&[fact("r1", "org", dec!(1), 0)])
            .await
            .unwrap();

        let summary = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(summary.discount_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_facts_ignored() {
        let (billing, ledger) = aggregator(vec![]);
        let facts = [fact("r1", "org", dec!(1), 0)];
        assert_eq!(billing.record_usage(&facts).await.unwrap(), 1);
        assert_eq!(billing.record_usage(&facts).await.unwrap(), 0);
        assert_eq!(ledger.entry_count("org"), 1);
    }

    #[tokio::test]
    async fn test_ledger_failure_propagates() {
        let (billing, ledger) = aggregator(vec![]);
        ledger.set_fail_appends(true);
        assert!(matches!(
            billing.record_costs(&[fact("r1", "org", dec!(1), 0)]).await,
            Err(Error::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn test_invoice_lifecycle() {
        let (billing, _) = aggregator(vec![Discount::percentage("ten", dec!(10))]);
        billing
            .record_usage(&[
                fact("r1", "org", dec!(10), 0),
                fact("r2", "org", dec!(20), 1),
            ])
            .await
            .unwrap();
        let summary = billing.calculate_bill("org", october()).await.unwrap();

        let tax = TaxInfo {
            rate: dec!(20),
            ..Default::default()
        };
        let invoice = billing
            .generate_invoice(&summary, Some(tax), None)
            .await
            .unwrap();
        assert_eq!(invoice.number, "INV-202610-0001");
        assert_eq!(invoice.line_items.len(), 2);
        assert_eq!(invoice.line_items[1].amount, dec!(-3));
        assert_eq!(invoice.subtotal, dec!(27));
        assert_eq!(invoice.tax_amount, dec!(5.4));
        assert_eq!(invoice.total, dec!(32.4));
        assert_eq!(invoice.status, InvoiceStatus::Draft);

        let again = billing.generate_invoice(&summary, None, None).await.unwrap();
        assert_eq!(again.id, invoice.id);

        assert!(matches!(
            billing.mark_invoice_paid("org", &invoice.id, None).await,
            Err(Error::InvalidTransition { .. })
        ));

        let sent = billing.mark_invoice_sent("org", &invoice.id).await.unwrap();
        assert!(sent.due_at.is_some());
        assert_eq!(
            billing.get_summary("org", &october()).await.unwrap().status,
            SummaryStatus::Sent
        );

        let paid = billing
            .mark_invoice_paid("org", &invoice.id, Some("txn-1".to_string()))
            .await
            .unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);

        let payments = billing.payment_history("org").await.unwrap();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].amount, dec!(32.4));

        assert!(billing.void_invoice("org", &invoice.id).await.is_err());
        assert!(billing.mark_invoice_sent("org", &invoice.id).await.is_err());
    }

    #[tokio::test]
    async fn test_paid_summary_is_frozen() {
        let (billing, _) = aggregator(vec![]);
        billing
            .record_usage(&[fact("r1", "org", dec!(1), 0)])
            .await
            .unwrap();
        let summary = billing.calculate_bill("org", october()).await.unwrap();
        let invoice = billing.generate_invoice(&summary, None, None).await.unwrap();
        billing.mark_invoice_sent("org", &invoice.id).await.unwrap();
        billing.mark_invoice_paid("org", &invoice.id, None).await.unwrap();

        billing
            .record_usage(&[fact("late", "org", dec!(5), 30)])
            .await
            .unwrap();
        let recalculated = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(recalculated.status, SummaryStatus::Paid);
        assert_eq!(recalculated.total_cost, dec!(1));
        assert_eq!(recalculated.calculated_at, summary.calculated_at);

        assert!(billing.generate_invoice(&recalculated, None, None).await.is_err());
    }

    #[tokio::test]
    async fn test_void_reopens_summary() {
        let (billing, _) = aggregator(vec![]);
        billing
            .record_usage(&[fact("r1", "org", dec!(1), 0)])
            .await
            .unwrap();
        let summary = billing.calculate_bill("org", october()).await.unwrap();
        let invoice = billing.generate_invoice(&summary, None, None).await.unwrap();
        billing.mark_invoice_sent("org", &invoice.id).await.unwrap();
        billing.void_invoice("org", &invoice.id).await.unwrap();

        billing
            .record_usage(&[fact("r2", "org", dec!(2), 1)])
            .await
            .unwrap();
        let summary = billing.calculate_bill("org", october()).await.unwrap();
        assert_eq!(summary.total_cost, dec!(3));

        let replacement = billing.generate_invoice(&summary, None, None).await.unwrap();
        assert_ne!(replacement.id, invoice.id);
        assert_eq!(replacement.number, "INV-202610-0002");
    }

    #[tokio::test]
    async fn test_invoice_of_other_org_not_found() {
        let (billing, _) = aggregator(vec![]);
        billing
            .record_usage(&[fact("r1", "org-a", dec!(1), 0)])
            .await
            .unwrap();
        let summary = billing.calculate_bill("org-a", october()).await.unwrap();
        let invoice = billing.generate_invoice(&summary, None, None).await.unwrap();

        assert!(matches!(
            billing.mark_invoice_sent("org-b", &invoice.id).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_feeds_quota_and_budgets() {
        let telemetry = Arc::new(Telemetry::new(&TelemetryConfig::default()));
        let quota = Arc::new(QuotaTracker::new(
            Arc::new(InMemoryQuotaStore::new()),
            &QuotaConfig::default(),
            telemetry.clone(),
        ));
        quota
            .set_quota(QuotaPlan::new("org").with_max_requests(2))
            .await
            .unwrap();
        let budgets = Arc::new(BudgetEngine::new(
            Arc::new(InMemoryBudgetStore::new()),
            &BudgetConfig::default(),
            None,
            telemetry.clone(),
        ));
        budgets
            .create_budget(NewBudget {
                name: "project".to_string(),
                scope: BudgetScope::project("org", "proj"),
                limits: BudgetLimits {
                    cost: Some(dec!(2)),
                    spans: Some(4),
                    ..Default::default()
                },
                thresholds: Some(vec![dec!(50)]),
            })
            .await
            .unwrap();

        let (billing, _) = aggregator(vec![]);
        let billing = billing
            .with_quota_tracker(quota.clone())
            .with_budget_engine(budgets.clone());

        let now = Utc::now();
        let mut first = fact("r1", "org", dec!(0.5), 0);
        first.project_id = Some("proj".to_string());
        first.timestamp = now;
        let mut second = fact("r2", "org", dec!(0.5), 1);
        second.project_id = Some("proj".to_string());
        second.timestamp = now;
        billing.record_costs(&[first, second]).await.unwrap();

        let status = quota.check_usage_quotas("org").await.unwrap();
        assert!(!status.requests_ok);
        assert_eq!(status.remaining(QuotaDimension::Requests), Some(Decimal::ZERO));

        let alerts = budgets.get_alerts("org", &AlertFilter::default()).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].dimension, crate::budget::BudgetDimension::Cost);

        billing
            .record_usage_events(&[UsageMetric::new("org", now).with_project("proj").with_spans(4)])
            .await
            .unwrap();
        let usage = budgets
            .get_usage(&BudgetScope::project("org", "proj"), now)
            .await
            .unwrap();
        assert_eq!(usage.spans, 4);
        assert_eq!(usage.cost, dec!(1));
    }
}

//! Invoices and payments.

use super::summary::BillingSummary;
use crate::model::{round_amount, BillingPeriod};
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Invoice lifecycle.
///
/// ```text
/// draft ──▶ sent ──▶ paid
///   │        │ ▲
///   │        ▼ │
///   │      overdue
///   ▼        │
///  void ◀────┘ (from draft or sent)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    /// Generated, not yet sent
    Draft,
    /// Sent to the customer
    Sent,
    /// Settled
    Paid,
    /// Past due
    Overdue,
    /// Cancelled
    Void,
}

impl InvoiceStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "draft",
            InvoiceStatus::Sent => "sent",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Overdue => "overdue",
            InvoiceStatus::Void => "void",
        }
    }

    /// Whether moving to `next` is allowed.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Sent)
                | (Sent, Paid)
                | (Sent, Overdue)
                | (Overdue, Paid)
                | (Draft, Void)
                | (Sent, Void)
        )
    }

    /// Whether no further transition exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvoiceStatus::Paid | InvoiceStatus::Void)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tax applied to an invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxInfo {
    /// Rate in percent
    pub rate: Decimal,
    /// Customer tax ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_id: Option<String>,
    /// Jurisdiction label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<String>,
}

/// Postal billing address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingAddress {
    /// Company or person
    pub name: String,
    /// Street lines
    pub lines: Vec<String>,
    /// City
    pub city: String,
    /// Postal code
    pub postal_code: String,
    /// ISO country code
    pub country: String,
}

/// One billable line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceLineItem {
    /// Description
    pub description: String,
    /// Provider, absent on the discount line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Model, absent on the discount line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Requests
    pub quantity: u64,
    /// Tokens
    pub tokens: u64,
    /// Amount, negative for discounts
    pub amount: Decimal,
}

/// A billable document derived from a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice ID
    pub id: String,
    /// Human-facing number, `INV-YYYYMM-NNNN`
    pub number: String,
    /// Organization
    pub organization_id: String,
    /// Summary the invoice was generated from
    pub summary_id: String,
    /// Billed period
    pub period: BillingPeriod,
    /// Currency
    pub currency: String,
    /// Lines, discount line last
    pub line_items: Vec<InvoiceLineItem>,
    /// Sum of the lines
    pub subtotal: Decimal,
    /// Tax details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax: Option<TaxInfo>,
    /// Tax amount
    pub tax_amount: Decimal,
    /// Subtotal plus tax
    pub total: Decimal,
    /// Billing address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_address: Option<BillingAddress>,
    /// Lifecycle state
    pub status: InvoiceStatus,
    /// Generation time
    pub created_at: DateTime<Utc>,
    /// When it was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    /// Payment due date, set when sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Settlement time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    /// Build a draft invoice from a summary.
    pub(crate) fn draft(
        summary: &BillingSummary,
        number: String,
        tax: Option<TaxInfo>,
        billing_address: Option<BillingAddress>,
        scale: u32,
    ) -> Self {
        let mut line_items: Vec<InvoiceLineItem> = summary
            .by_model
            .iter()
            .map(|m| InvoiceLineItem {
                description: format!("{} / {}", m.provider, m.model),
                provider: Some(m.provider.clone()),
                model: Some(m.model.clone()),
                quantity: m.requests,
                tokens: m.input_tokens.saturating_add(m.output_tokens),
                amount: m.cost,
            })
            .collect();

        if summary.discount_total > Decimal::ZERO {
            line_items.push(InvoiceLineItem {
                description: "Discounts".to_string(),
                provider: None,
                model: None,
                quantity: 0,
                tokens: 0,
                amount: -summary.discount_total,
            });
        }

        let subtotal: Decimal = line_items.iter().map(|l| l.amount).sum();
        let tax_amount = tax
            .as_ref()
            .map(|t| round_amount(subtotal * t.rate / Decimal::ONE_HUNDRED, scale))
            .unwrap_or(Decimal::ZERO);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            organization_id: summary.organization_id.clone(),
            summary_id: summary.id.clone(),
            period: summary.period,
            currency: summary.currency.clone(),
            line_items,
            subtotal,
            tax,
            tax_amount,
            total: subtotal + tax_amount,
            billing_address,
            status: InvoiceStatus::Draft,
            created_at: Utc::now(),
            sent_at: None,
            due_at: None,
            paid_at: None,
        }
    }

    /// Move to `next`, refusing backward or unknown transitions.
    pub fn transition(&mut self, next: InvoiceStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition("invoice", self.status, next));
        }
        self.status = next;
        Ok(())
    }
}

/// Payment-history entry written when an invoice is paid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Payment ID
    pub id: String,
    /// Invoice paid
    pub invoice_id: String,
    /// Organization
    pub organization_id: String,
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: String,
    /// External settlement reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Settlement time
    pub paid_at: DateTime<Utc>,
}

/// Invoice number for a period and sequence.
pub(crate) fn invoice_number(period: &BillingPeriod, sequence: u64) -> String {
    format!("INV-{}-{:04}", period.start.format("%Y%m"), sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_only_move_forward() {
        use InvoiceStatus::*;
        assert!(Draft.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Paid));
        assert!(Sent.can_transition_to(Overdue));
        assert!(Overdue.can_transition_to(Paid));
        assert!(Draft.can_transition_to(Void));
        assert!(Sent.can_transition_to(Void));

        assert!(!Sent.can_transition_to(Draft));
        assert!(!Paid.can_transition_to(Sent));
        assert!(!Paid.can_transition_to(Overdue));
        assert!(!Paid.can_transition_to(Void));
        assert!(!Overdue.can_transition_to(Void));
        assert!(!Void.can_transition_to(Draft));
        assert!(!Draft.can_transition_to(Paid));

        assert!(Paid.is_terminal());
        assert!(Void.is_terminal());
    }

    #[test]
    fn test_invoice_number() {
        let period = BillingPeriod::calendar_month("2026-10-17T00:00:00Z".parse().unwrap());
        assert_eq!(invoice_number(&period, 7), "INV-202610-0007");
    }
}

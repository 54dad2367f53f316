//! Billing persistence.

use super::invoice::{Invoice, PaymentRecord};
use super::summary::BillingSummary;
use crate::model::{CostMetric, TimeRange};
use crate::{Error, Result};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Ledger entries, summaries, invoices and payments.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append cost facts, skipping request IDs already in the ledger.
    ///
    /// Returns the entries actually appended.
    async fn append_entries(&self, entries: &[CostMetric]) -> Result<Vec<CostMetric>>;

    /// Entries of an organization within a range, in insertion order.
    async fn entries(&self, organization_id: &str, range: TimeRange) -> Result<Vec<CostMetric>>;

    /// Timestamp of the organization's earliest entry.
    async fn first_entry_at(&self, organization_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Create or replace a summary.
    async fn save_summary(&self, summary: &BillingSummary) -> Result<()>;

    /// Look up a summary by ID.
    async fn get_summary(&self, summary_id: &str) -> Result<Option<BillingSummary>>;

    /// Create or replace an invoice.
    async fn save_invoice(&self, invoice: &Invoice) -> Result<()>;

    /// Look up an invoice.
    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>>;

    /// Invoices of an organization, newest first.
    async fn list_invoices(&self, organization_id: &str) -> Result<Vec<Invoice>>;

    /// Next invoice sequence number for a `YYYYMM` key, starting at 1.
    async fn next_invoice_sequence(&self, month: &str) -> Result<u64>;

    /// Append a payment record.
    async fn record_payment(&self, payment: &PaymentRecord) -> Result<()>;

    /// Payments of an organization, oldest first.
    async fn payments(&self, organization_id: &str) -> Result<Vec<PaymentRecord>>;
}

#[derive(Default)]
struct Ledger {
    entries: HashMap<String, Vec<CostMetric>>,
    seen: HashSet<String>,
}

/// In-memory ledger store.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    ledger: RwLock<Ledger>,
    summaries: DashMap<String, BillingSummary>,
    invoices: DashMap<String, Invoice>,
    sequences: DashMap<String, u64>,
    payments: RwLock<Vec<PaymentRecord>>,
    fail_appends: AtomicBool,
}

impl InMemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make appends fail with a storage error.
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of ledger entries of an organization.
    pub fn entry_count(&self, organization_id: &str) -> usize {
        self.ledger
            .read()
            .entries
            .get(organization_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append_entries(&self, entries: &[CostMetric]) -> Result<Vec<CostMetric>> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(Error::storage("ledger unavailable"));
        }

        let mut ledger = self.ledger.write();
        let mut appended = Vec::with_capacity(entries.len());
        for entry in entries {
            if !ledger.seen.insert(entry.request_id.clone()) {
                continue;
            }
            ledger
                .entries
                .entry(entry.organization_id.clone())
                .or_default()
                .push(entry.clone());
            appended.push(entry.clone());
        }
        Ok(appended)
    }

    async fn entries(&self, organization_id: &str, range: TimeRange) -> Result<Vec<CostMetric>> {
        Ok(self
            .ledger
            .read()
            .entries
            .get(organization_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| range.contains(e.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn first_entry_at(&self, organization_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .ledger
            .read()
            .entries
            .get(organization_id)
            .and_then(|entries| entries.iter().map(|e| e.timestamp).min()))
    }

    async fn save_summary(&self, summary: &BillingSummary) -> Result<()> {
        self.summaries.insert(summary.id.clone(), summary.clone());
        Ok(())
    }

    async fn get_summary(&self, summary_id: &str) -> Result<Option<BillingSummary>> {
        Ok(self.summaries.get(summary_id).map(|s| s.clone()))
    }

    async fn save_invoice(&self, invoice: &Invoice) -> Result<()> {
        self.invoices.insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }

    async fn get_invoice(&self, invoice_id: &str) -> Result<Option<Invoice>> {
        Ok(self.invoices.get(invoice_id).map(|i| i.clone()))
    }

    async fn list_invoices(&self, organization_id: &str) -> Result<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .iter()
            .filter(|i| i.organization_id == organization_id)
            .map(|i| i.clone())
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.number.cmp(&a.number)));
        Ok(invoices)
    }

    async fn next_invoice_sequence(&self, month: &str) -> Result<u64> {
        let mut sequence = self.sequences.entry(month.to_string()).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    async fn record_payment(&self, payment: &PaymentRecord) -> Result<()> {
        self.payments.write().push(payment.clone());
        Ok(())
    }

    async fn payments(&self, organization_id: &str) -> Result<Vec<PaymentRecord>> {
        Ok(self
            .payments
            .read()
            .iter()
            .filter(|p| p.organization_id == organization_id)
            .cloned()
            .collect())
    }
}

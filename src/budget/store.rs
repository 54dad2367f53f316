//! Budget persistence.

use super::types::{AlertFilter, BudgetScope, UsageAlert, UsageBudget, UsageSnapshot};
use crate::{Error, Result};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// Budgets, alerts and per-period usage accumulators.
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// Store a new budget.
    async fn insert_budget(&self, budget: &UsageBudget) -> Result<()>;

    /// Replace an existing budget.
    async fn update_budget(&self, budget: &UsageBudget) -> Result<()>;

    /// Look up a budget, active or not.
    async fn get_budget(&self, budget_id: &str) -> Result<Option<UsageBudget>>;

    /// Budgets of an organization, including project-scoped ones.
    async fn list_budgets(&self, organization_id: &str) -> Result<Vec<UsageBudget>>;

    /// Active budgets of exactly this scope.
    async fn active_budgets(&self, scope: &BudgetScope) -> Result<Vec<UsageBudget>>;

    /// Store an alert unless one exists for the same budget, threshold and
    /// period. Returns whether the alert was stored.
    async fn insert_alert_if_absent(&self, alert: &UsageAlert) -> Result<bool>;

    /// Look up an alert.
    async fn get_alert(&self, alert_id: &str) -> Result<Option<UsageAlert>>;

    /// Replace an existing alert.
    async fn update_alert(&self, alert: &UsageAlert) -> Result<()>;

    /// Alerts of an organization, newest first.
    async fn list_alerts(&self, organization_id: &str, filter: &AlertFilter) -> Result<Vec<UsageAlert>>;

    /// Atomically add usage to a scope's period accumulator and return the total.
    async fn add_usage(
        &self,
        scope: &BudgetScope,
        period_key: &str,
        delta: &UsageSnapshot,
    ) -> Result<UsageSnapshot>;

    /// Period-to-date usage of a scope.
    async fn get_usage(&self, scope: &BudgetScope, period_key: &str) -> Result<UsageSnapshot>;
}

#[derive(Default)]
struct AlertTable {
    alerts: HashMap<String, UsageAlert>,
    fired: HashSet<(String, Decimal, String)>,
}

/// In-memory budget store.
#[derive(Default)]
pub struct InMemoryBudgetStore {
    budgets: DashMap<String, UsageBudget>,
    alerts: RwLock<AlertTable>,
    usage: DashMap<(BudgetScope, String), UsageSnapshot>,
}

impl InMemoryBudgetStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BudgetStore for InMemoryBudgetStore {
    async fn insert_budget(&self, budget: &UsageBudget) -> Result<()> {
        if self.budgets.contains_key(&budget.id) {
            return Err(Error::validation_field(
                format!("budget {} already exists", budget.id),
                "id",
            ));
        }
        self.budgets.insert(budget.id.clone(), budget.clone());
        Ok(())
    }

    async fn update_budget(&self, budget: &UsageBudget) -> Result<()> {
        match self.budgets.get_mut(&budget.id) {
            Some(mut existing) => {
                *existing = budget.clone();
                Ok(())
            }
            None => Err(Error::not_found("budget", &budget.id)),
        }
    }

    async fn get_budget(&self, budget_id: &str) -> Result<Option<UsageBudget>> {
        Ok(self.budgets.get(budget_id).map(|b| b.clone()))
    }

    async fn list_budgets(&self, organization_id: &str) -> Result<Vec<UsageBudget>> {
        let mut budgets: Vec<UsageBudget> = self
            .budgets
            .iter()
            .filter(|b| b.scope.organization_id() == organization_id)
            .map(|b| b.clone())
            .collect();
        budgets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(budgets)
    }

    async fn active_budgets(&self, scope: &BudgetScope) -> Result<Vec<UsageBudget>> {
        let mut budgets: Vec<UsageBudget> = self
            .budgets
            .iter()
            .filter(|b| b.active && b.scope == *scope)
            .map(|b| b.clone())
            .collect();
        budgets.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(budgets)
    }

    async fn insert_alert_if_absent(&self, alert: &UsageAlert) -> Result<bool> {
        let mut table = self.alerts.write();
        if !table.fired.insert(alert.dedup_key()) {
            return Ok(false);
        }
        table.alerts.insert(alert.id.clone(), alert.clone());
        Ok(true)
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<UsageAlert>> {
        Ok(self.alerts.read().alerts.get(alert_id).cloned())
    }

    async fn update_alert(&self, alert: &UsageAlert) -> Result<()> {
        let mut table = self.alerts.write();
        match table.alerts.get_mut(&alert.id) {
            Some(existing) => {
                *existing = alert.clone();
                Ok(())
            }
            None => Err(Error::not_found("alert", &alert.id)),
        }
    }

    async fn list_alerts(&self, organization_id: &str, filter: &AlertFilter) -> Result<Vec<UsageAlert>> {
        let table = self.alerts.read();
        let mut alerts: Vec<UsageAlert> = table
            .alerts
            .values()
            .filter(|a| a.organization_id() == organization_id && filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.threshold.cmp(&a.threshold))
        });
        Ok(alerts)
    }

    async fn add_usage(
        &self,
        scope: &BudgetScope,
        period_key: &str,
        delta: &UsageSnapshot,
    ) -> Result<UsageSnapshot> {
        let mut total = self
            .usage
            .entry((scope.clone(), period_key.to_string()))
            .or_default();
        total.add(delta);
        Ok(total.clone())
    }

    async fn get_usage(&self, scope: &BudgetScope, period_key: &str) -> Result<UsageSnapshot> {
        Ok(self
            .usage
            .get(&(scope.clone(), period_key.to_string()))
            .map(|u| u.clone())
            .unwrap_or_default())
    }
}

//! Budgets and threshold alerts.
//!
//! A budget caps one or more usage dimensions of an organization or a
//! project and carries ascending alert thresholds in percent. Every usage
//! update is added to the scope's period accumulator and all active budgets
//! of that scope are re-evaluated; each threshold fires at most once per
//! budget and billing period, enforced by the store.
//!
//! Budget periods are calendar months.

mod notifier;
mod store;
mod types;

pub use notifier::{AlertDispatcher, AlertNotifier, LogNotifier};
pub use store::{BudgetStore, InMemoryBudgetStore};
pub use types::{
    normalize_thresholds, AlertFilter, BudgetDimension, BudgetLimits, BudgetScope, BudgetUpdate,
    NewBudget, UsageAlert, UsageBudget, UsageSnapshot,
};

#[cfg(test)]
pub(crate) use notifier::testing::RecordingNotifier;

use crate::config::BudgetConfig;
use crate::model::BillingPeriod;
use crate::telemetry::Telemetry;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Evaluates budgets and records alerts.
pub struct BudgetEngine {
    store: Arc<dyn BudgetStore>,
    dispatcher: Option<AlertDispatcher>,
    default_thresholds: Vec<Decimal>,
    telemetry: Arc<Telemetry>,
}

impl BudgetEngine {
    /// Create an engine. Without a dispatcher, alerts are stored but not delivered.
    pub fn new(
        store: Arc<dyn BudgetStore>,
        config: &BudgetConfig,
        dispatcher: Option<AlertDispatcher>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            default_thresholds: config.default_thresholds.clone(),
            telemetry,
        }
    }

    /// Create a budget.
    pub async fn create_budget(&self, request: NewBudget) -> Result<UsageBudget> {
        require_org(request.scope.organization_id())?;
        if matches!(request.scope.project_id(), Some(p) if p.trim().is_empty()) {
            return Err(Error::validation_field("project ID cannot be empty", "scope"));
        }
        request.limits.validate()?;
        let thresholds = normalize_thresholds(
            request
                .thresholds
                .unwrap_or_else(|| self.default_thresholds.clone()),
        )?;

        let now = Utc::now();
        let budget = UsageBudget {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            scope: request.scope,
            limits: request.limits,
            thresholds,
            active: true,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_budget(&budget).await?;

        info!(budget_id = %budget.id, scope = %budget.scope, "Budget created");
        Ok(budget)
    }

    /// Update a budget owned by `organization_id`.
    pub async fn update_budget(
        &self,
        organization_id: &str,
        budget_id: &str,
        update: BudgetUpdate,
    ) -> Result<UsageBudget> {
        let mut budget = self.get_budget(organization_id, budget_id).await?;

        if let Some(name) = update.name {
            budget.name = name;
        }
        if let Some(limits) = update.limits {
            limits.validate()?;
            budget.limits = limits;
        }
        if let Some(thresholds) = update.thresholds {
            budget.thresholds = normalize_thresholds(thresholds)?;
        }
        if let Some(active) = update.active {
            budget.active = active;
        }
        budget.updated_at = Utc::now();

        self.store.update_budget(&budget).await?;
        info!(budget_id = %budget.id, active = budget.active, "Budget updated");
        Ok(budget)
    }

    /// Deactivate a budget. Alerts and history are kept.
    pub async fn delete_budget(&self, organization_id: &str, budget_id: &str) -> Result<()> {
        let mut budget = self.get_budget(organization_id, budget_id).await?;
        if !budget.active {
            return Ok(());
        }
        budget.active = false;
        budget.updated_at = Utc::now();
        self.store.update_budget(&budget).await?;
        info!(budget_id = %budget.id, "Budget deactivated");
        Ok(())
    }

    /// Look up a budget owned by `organization_id`.
    pub async fn get_budget(&self, organization_id: &str, budget_id: &str) -> Result<UsageBudget> {
        match self.store.get_budget(budget_id).await? {
            Some(budget) if budget.scope.organization_id() == organization_id => Ok(budget),
            _ => Err(Error::not_found("budget", budget_id)),
        }
    }

    /// Budgets of an organization.
    pub async fn list_budgets(&self, organization_id: &str) -> Result<Vec<UsageBudget>> {
        self.store.list_budgets(organization_id).await
    }

    /// Add usage to a scope and evaluate its budgets.
    ///
    /// Returns the alerts fired by this update.
    pub async fn record_usage(
        &self,
        scope: &BudgetScope,
        delta: &UsageSnapshot,
        at: DateTime<Utc>,
    ) -> Result<Vec<UsageAlert>> {
        if delta.is_empty() {
            return Ok(Vec::new());
        }
        let period = BillingPeriod::calendar_month(at);
        let total = self.store.add_usage(scope, &period.key(), delta).await?;
        self.evaluate(scope, &total, period).await
    }

    /// Period-to-date usage of a scope.
    pub async fn get_usage(&self, scope: &BudgetScope, at: DateTime<Utc>) -> Result<UsageSnapshot> {
        let period = BillingPeriod::calendar_month(at);
        self.store.get_usage(scope, &period.key()).await
    }

    /// Evaluate every active budget of a scope against period-to-date usage.
    pub async fn evaluate(
        &self,
        scope: &BudgetScope,
        usage: &UsageSnapshot,
        period: BillingPeriod,
    ) -> Result<Vec<UsageAlert>> {
        let mut fired = Vec::new();

        for budget in self.store.active_budgets(scope).await? {
            for alert in crossed_thresholds(&budget, usage, period) {
                if self.store.insert_alert_if_absent(&alert).await? {
                    info!(
                        budget_id = %budget.id,
                        threshold = %alert.threshold,
                        dimension = %alert.dimension,
                        percent = %alert.percent,
                        "Budget alert fired"
                    );
                    self.telemetry.record_alert();
                    if let Some(dispatcher) = &self.dispatcher {
                        dispatcher.dispatch(alert.clone());
                    }
                    fired.push(alert);
                }
            }
        }

        if !fired.is_empty() {
            debug!(scope = %scope, count = fired.len(), "Budget evaluation fired alerts");
        }
        Ok(fired)
    }

    /// Alerts of an organization.
    pub async fn get_alerts(&self, organization_id: &str, filter: &AlertFilter) -> Result<Vec<UsageAlert>> {
        self.store.list_alerts(organization_id, filter).await
    }

    /// Acknowledge an alert. Acknowledging twice returns the original record.
    pub async fn acknowledge_alert(
        &self,
        organization_id: &str,
        alert_id: &str,
        acknowledged_by: Option<&str>,
    ) -> Result<UsageAlert> {
        let mut alert = match self.store.get_alert(alert_id).await? {
            Some(alert) if alert.organization_id() == organization_id => alert,
            _ => return Err(Error::not_found("alert", alert_id)),
        };
        if alert.acknowledged {
            return Ok(alert);
        }

        alert.acknowledged = true;
        alert.acknowledged_at = Some(Utc::now());
        alert.acknowledged_by = acknowledged_by.map(str::to_string);
        self.store.update_alert(&alert).await?;

        info!(alert_id = %alert.id, "Alert acknowledged");
        Ok(alert)
    }
}

/// Alerts for every threshold the usage has reached, ascending.
///
/// When several dimensions reached a threshold, the one with the highest
/// percentage is reported.
fn crossed_thresholds(
    budget: &UsageBudget,
    usage: &UsageSnapshot,
    period: BillingPeriod,
) -> Vec<UsageAlert> {
    let percents: Vec<(BudgetDimension, Decimal, Decimal, Decimal)> = BudgetDimension::ALL
        .iter()
        .filter_map(|dimension| {
            let limit = budget.limits.limit(*dimension)?;
            if limit <= Decimal::ZERO {
                return None;
            }
            let value = usage.value(*dimension);
            Some((*dimension, value, limit, value * Decimal::ONE_HUNDRED / limit))
        })
        .collect();

    let Some(&(dimension, value, limit, percent)) = percents
        .iter()
        .max_by(|a, b| a.3.cmp(&b.3))
    else {
        return Vec::new();
    };

    let now = Utc::now();
    budget
        .thresholds
        .iter()
        .filter(|threshold| percent >= **threshold)
        .map(|threshold| UsageAlert {
            id: Uuid::new_v4().to_string(),
            budget_id: budget.id.clone(),
            budget_name: budget.name.clone(),
            scope: budget.scope.clone(),
            threshold: *threshold,
            dimension,
            usage: value,
            limit,
            percent: percent.round_dp(2),
            period,
            created_at: now,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        })
        .collect()
}

fn require_org(organization_id: &str) -> Result<()> {
    if organization_id.trim().is_empty() {
        return Err(Error::validation_field(
            "organization ID is required",
            "organization_id",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use rust_decimal_macros::dec;

    fn engine() -> BudgetEngine {
        engine_with(Arc::new(Telemetry::disabled()))
    }

    fn engine_with(telemetry: Arc<Telemetry>) -> BudgetEngine {
        BudgetEngine::new(
            Arc::new(InMemoryBudgetStore::new()),
            &BudgetConfig::default(),
            None,
            telemetry,
        )
    }

    fn cost_budget(scope: BudgetScope, limit: Decimal) -> NewBudget {
        NewBudget {
            name: "monthly".to_string(),
            scope,
            limits: BudgetLimits {
                cost: Some(limit),
                ..Default::default()
            },
            thresholds: None,
        }
    }

    fn cost(amount: Decimal) -> UsageSnapshot {
        UsageSnapshot {
            cost: amount,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_each_threshold_fires_once() {
        let engine = engine();
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(cost_budget(scope.clone(), dec!(100)))
            .await
            .unwrap();
        let now = Utc::now();

        let fired = engine.record_usage(&scope, &cost(dec!(55)), now).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].threshold, dec!(50));

        let fired = engine.record_usage(&scope, &cost(dec!(5)), now).await.unwrap();
        assert!(fired.is_empty());

        let fired = engine.record_usage(&scope, &cost(dec!(22)), now).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].threshold, dec!(80));
        assert_eq!(fired[0].usage, dec!(82));
        assert_eq!(fired[0].dimension, BudgetDimension::Cost);
    }

    #[tokio::test]
    async fn test_jump_fires_all_crossed_thresholds() {
        let engine = engine();
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(cost_budget(scope.clone(), dec!(10)))
            .await
            .unwrap();

        let fired = engine
            .record_usage(&scope, &cost(dec!(12)), Utc::now())
            .await
            .unwrap();
        let thresholds: Vec<Decimal> = fired.iter().map(|a| a.threshold).collect();
        assert_eq!(thresholds, vec![dec!(50), dec!(80), dec!(100)]);
    }

    #[tokio::test]
    async fn test_new_period_fires_again() {
        let engine = engine();
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(cost_budget(scope.clone(), dec!(100)))
            .await
            .unwrap();

        let october = "2026-10-10T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let november = "2026-11-10T00:00:00Z".parse::<DateTime<Utc>>().unwrap();

        assert_eq!(engine.record_usage(&scope, &cost(dec!(60)), october).await.unwrap().len(), 1);
        assert_eq!(engine.record_usage(&scope, &cost(dec!(60)), november).await.unwrap().len(), 1);
        assert_eq!(engine.get_usage(&scope, november).await.unwrap().cost, dec!(60));
    }

    #[tokio::test]
    async fn test_project_and_org_scopes_are_separate() {
        let engine = engine();
        let project = BudgetScope::project("org", "proj");
        engine
            .create_budget(cost_budget(project.clone(), dec!(10)))
            .await
            .unwrap();

        let fired = engine
            .record_usage(&BudgetScope::organization("org"), &cost(dec!(9)), Utc::now())
            .await
            .unwrap();
        assert!(fired.is_empty());

        let fired = engine
            .record_usage(&project, &cost(dec!(9)), Utc::now())
            .await
            .unwrap();
        assert_eq!(fired.len(), 2);
    }

    #[tokio::test]
    async fn test_highest_dimension_reported() {
        let engine = engine();
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(NewBudget {
                name: "multi".to_string(),
                scope: scope.clone(),
                limits: BudgetLimits {
                    spans: Some(100),
                    bytes: Some(1_000),
                    ..Default::default()
                },
                thresholds: Some(vec![dec!(50)]),
            })
            .await
            .unwrap();

        let usage = UsageSnapshot {
            spans: 10,
            bytes: 700,
            ..Default::default()
        };
        let fired = engine.record_usage(&scope, &usage, Utc::now()).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].dimension, BudgetDimension::Bytes);
        assert_eq!(fired[0].percent, dec!(70));
    }

    #[tokio::test]
    async fn test_soft_delete_stops_evaluation() {
        let engine = engine();
        let scope = BudgetScope::organization("org");
        let budget = engine
            .create_budget(cost_budget(scope.clone(), dec!(10)))
            .await
            .unwrap();

        engine.delete_budget("org", &budget.id).await.unwrap();
        engine.delete_budget("org", &budget.id).await.unwrap();

        let stored = engine.get_budget("org", &budget.id).await.unwrap();
        assert!(!stored.active);
        assert!(engine
            .record_usage(&scope, &cost(dec!(10)), Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_wrong_org_is_not_found() {
        let engine = engine();
        let scope = BudgetScope::organization("org-a");
        let budget = engine
            .create_budget(cost_budget(scope.clone(), dec!(10)))
            .await
            .unwrap();
        let fired = engine
            .record_usage(&scope, &cost(dec!(6)), Utc::now())
            .await
            .unwrap();

        assert!(matches!(
            engine.get_budget("org-b", &budget.id).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            engine.acknowledge_alert("org-b", &fired[0].id, None).await,
            Err(Error::NotFound { .. })
        ));
        assert!(engine
            .get_alerts("org-b", &AlertFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let engine = engine();
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(cost_budget(scope.clone(), dec!(10)))
            .await
            .unwrap();
        let fired = engine
            .record_usage(&scope, &cost(dec!(6)), Utc::now())
            .await
            .unwrap();

        let first = engine
            .acknowledge_alert("org", &fired[0].id, Some("ops"))
            .await
            .unwrap();
        let second = engine
            .acknowledge_alert("org", &fired[0].id, Some("someone-else"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(second.acknowledged_by.as_deref(), Some("ops"));

        let pending = engine
            .get_alerts(
                "org",
                &AlertFilter {
                    acknowledged: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_update_budget() {
        let engine = engine();
        let budget = engine
            .create_budget(cost_budget(BudgetScope::organization("org"), dec!(10)))
            .await
            .unwrap();

        let updated = engine
            .update_budget(
                "org",
                &budget.id,
                BudgetUpdate {
                    thresholds: Some(vec![dec!(90), dec!(25), dec!(90)]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.thresholds, vec![dec!(25), dec!(90)]);

        assert!(engine
            .update_budget(
                "org",
                &budget.id,
                BudgetUpdate {
                    limits: Some(BudgetLimits::default()),
                    ..Default::default()
                },
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_alerts_are_dispatched() {
        let notifier = Arc::new(RecordingNotifier::default());
        let (dispatcher, handle) = AlertDispatcher::spawn(notifier.clone(), 8);
        let engine = BudgetEngine::new(
            Arc::new(InMemoryBudgetStore::new()),
            &BudgetConfig::default(),
            Some(dispatcher),
            Arc::new(Telemetry::disabled()),
        );
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(cost_budget(scope.clone(), dec!(10)))
            .await
            .unwrap();
        engine
            .record_usage(&scope, &cost(dec!(10)), Utc::now())
            .await
            .unwrap();

        drop(engine);
        handle.await.unwrap();
        assert_eq!(notifier.delivered.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_fired_alerts_counted_without_dispatcher() {
        let telemetry = Arc::new(Telemetry::new(&TelemetryConfig::default()));
        let engine = engine_with(telemetry.clone());
        let scope = BudgetScope::organization("org");
        engine
            .create_budget(cost_budget(scope.clone(), dec!(10)))
            .await
            .unwrap();

        let fired = engine
            .record_usage(&scope, &cost(dec!(6)), Utc::now())
            .await
            .unwrap();
        assert_eq!(fired.len(), 1);
        engine
            .record_usage(&scope, &cost(dec!(0.1)), Utc::now())
            .await
            .unwrap();

        assert_eq!(telemetry.metrics().alerts_fired, 1);
    }

    #[tokio::test]
    async fn test_invalid_budget_rejected() {
        let engine = engine();
        let mut request = cost_budget(BudgetScope::organization(""), dec!(10));
        assert!(engine.create_budget(request.clone()).await.is_err());

        request.scope = BudgetScope::organization("org");
        request.thresholds = Some(vec![]);
        assert!(engine.create_budget(request).await.is_err());
    }
}

//! Metering engine facade.

use crate::analytics::{ExportFormat, UsageAnalytics, UsageOverview};
use crate::billing::{
    BillingAddress, BillingAggregator, BillingSummary, InMemoryLedgerStore, Invoice, LedgerStore,
    PaymentRecord, TaxInfo,
};
use crate::budget::{
    AlertDispatcher, AlertFilter, AlertNotifier, BudgetEngine, BudgetScope, BudgetStore, BudgetUpdate,
    InMemoryBudgetStore, NewBudget, UsageAlert, UsageBudget, UsageSnapshot,
};
use crate::cache::CacheStats;
use crate::config::Config;
use crate::ingestion::{AnalyticsWorker, FlushReport, WorkerHealth};
use crate::integration;
use crate::model::{BillingPeriod, RequestMetric, TimeRange, UsageMetric};
use crate::quota::{InMemoryQuotaStore, QuotaPlan, QuotaStatus, QuotaStore, QuotaTracker};
use crate::repository::{
    AnalyticsRepository, Granularity, InMemoryAnalyticsRepository, ProjectUsage, TimeSeriesPoint,
};
use crate::telemetry::Telemetry;
use crate::Result;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Health of the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    /// Whether the engine is accepting and draining records
    pub healthy: bool,
    /// Ingestion worker state
    pub worker: WorkerHealth,
    /// Quota cache statistics
    pub quota_cache: CacheStats,
}

/// The metering engine.
///
/// Owns the ingestion worker, quota tracker, budget engine, billing
/// aggregator and analytics queries, wired over shared stores. Cost facts
/// flushed by the worker reach the billing aggregator, which feeds quota
/// counters and budget evaluation.
pub struct MeteringEngine {
    config: Config,
    telemetry: Arc<Telemetry>,
    worker: AnalyticsWorker,
    quota: Arc<QuotaTracker>,
    budgets: Arc<BudgetEngine>,
    billing: Arc<BillingAggregator>,
    analytics: UsageAnalytics,
    alert_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeteringEngine {
    /// Create an engine builder.
    pub fn builder() -> MeteringEngineBuilder {
        MeteringEngineBuilder::new()
    }

    /// Start ingestion and quota cache reconciliation.
    pub fn start(&self) -> Result<()> {
        self.worker.start()?;
        self.quota.start_sync();
        info!(service = self.telemetry.service_name(), "Metering engine started");
        Ok(())
    }

    /// Stop ingestion, flushing what is buffered, and stop background tasks.
    pub async fn stop(&self) -> Result<FlushReport> {
        let report = self.worker.stop().await;
        self.quota.stop_sync().await;
        info!("Metering engine stopped");
        report
    }

    /// Record one completed gateway request.
    pub fn record_request(&self, metric: RequestMetric) -> Result<()> {
        self.worker.record_request(metric)
    }

    /// Record a usage event (spans, bytes, scores).
    pub fn record_usage_event(&self, usage: UsageMetric) -> Result<()> {
        self.worker.record_usage(usage)
    }

    /// Flush every ingestion buffer now.
    pub async fn flush(&self) -> FlushReport {
        self.worker.flush_all().await
    }

    /// Check an organization's quotas.
    pub async fn check_usage_quotas(&self, organization_id: &str) -> Result<QuotaStatus> {
        self.quota.check_usage_quotas(organization_id).await
    }

    /// Create or replace a quota plan.
    pub async fn set_quota(&self, plan: QuotaPlan) -> Result<()> {
        self.quota.set_quota(plan).await
    }

    /// Remove a quota plan.
    pub async fn remove_quota(&self, organization_id: &str) -> Result<bool> {
        self.quota.remove_quota(organization_id).await
    }

    /// Create a budget.
    pub async fn create_budget(&self, request: NewBudget) -> Result<UsageBudget> {
        self.budgets.create_budget(request).await
    }

    /// Update a budget.
    pub async fn update_budget(
        &self,
        organization_id: &str,
        budget_id: &str,
        update: BudgetUpdate,
    ) -> Result<UsageBudget> {
        self.budgets.update_budget(organization_id, budget_id, update).await
    }

    /// Deactivate a budget.
    pub async fn delete_budget(&self, organization_id: &str, budget_id: &str) -> Result<()> {
        self.budgets.delete_budget(organization_id, budget_id).await
    }

    /// Look up a budget.
    pub async fn get_budget(&self, organization_id: &str, budget_id: &str) -> Result<UsageBudget> {
        self.budgets.get_budget(organization_id, budget_id).await
    }

    /// Budgets of an organization.
    pub async fn list_budgets(&self, organization_id: &str) -> Result<Vec<UsageBudget>> {
        self.budgets.list_budgets(organization_id).await
    }

    /// Period-to-date usage of a budget scope.
    pub async fn get_budget_usage(&self, scope: &BudgetScope) -> Result<UsageSnapshot> {
        self.budgets.get_usage(scope, Utc::now()).await
    }

    /// Alerts of an organization.
    pub async fn get_alerts(&self, organization_id: &str, filter: &AlertFilter) -> Result<Vec<UsageAlert>> {
        self.budgets.get_alerts(organization_id, filter).await
    }

    /// Acknowledge an alert.
    pub async fn acknowledge_alert(
        &self,
        organization_id: &str,
        alert_id: &str,
        acknowledged_by: Option<&str>,
    ) -> Result<UsageAlert> {
        self.budgets
            .acknowledge_alert(organization_id, alert_id, acknowledged_by)
            .await
    }

    /// Compute the billing summary of a period.
    pub async fn calculate_bill(&self, organization_id: &str, period: BillingPeriod) -> Result<BillingSummary> {
        self.billing.calculate_bill(organization_id, period).await
    }

    /// Generate an invoice for a summary.
    pub async fn generate_invoice(
        &self,
        summary: &BillingSummary,
        tax: Option<TaxInfo>,
        billing_address: Option<BillingAddress>,
    ) -> Result<Invoice> {
        self.billing.generate_invoice(summary, tax, billing_address).await
    }

    /// Invoices of an organization.
    pub async fn list_invoices(&self, organization_id: &str) -> Result<Vec<Invoice>> {
        self.billing.list_invoices(organization_id).await
    }

    /// Payments of an organization.
    pub async fn payment_history(&self, organization_id: &str) -> Result<Vec<PaymentRecord>> {
        self.billing.payment_history(organization_id).await
    }

    /// Headline usage numbers.
    pub async fn get_usage_overview(&self, organization_id: &str, range: TimeRange) -> Result<UsageOverview> {
        self.analytics.get_usage_overview(organization_id, range).await
    }

    /// Bucketed usage.
    pub async fn get_usage_time_series(
        &self,
        organization_id: &str,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<TimeSeriesPoint>> {
        self.analytics
            .get_usage_time_series(organization_id, range, granularity)
            .await
    }

    /// Usage per project.
    pub async fn get_usage_by_project(&self, organization_id: &str, range: TimeRange) -> Result<Vec<ProjectUsage>> {
        self.analytics.get_usage_by_project(organization_id, range).await
    }

    /// Export a usage time series.
    pub async fn export_usage(
        &self,
        organization_id: &str,
        range: TimeRange,
        granularity: Granularity,
        format: ExportFormat,
    ) -> Result<String> {
        self.analytics
            .export_time_series(organization_id, range, granularity, format)
            .await
    }

    /// Health snapshot.
    pub fn get_health(&self) -> EngineHealth {
        let worker = self.worker.get_health();
        EngineHealth {
            healthy: worker.healthy,
            worker,
            quota_cache: self.quota.cache_stats(),
        }
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingestion worker.
    pub fn worker(&self) -> &AnalyticsWorker {
        &self.worker
    }

    /// Quota tracker.
    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Budget engine.
    pub fn budgets(&self) -> &Arc<BudgetEngine> {
        &self.budgets
    }

    /// Billing aggregator, for invoice lifecycle operations.
    pub fn billing(&self) -> &Arc<BillingAggregator> {
        &self.billing
    }

    /// Telemetry counters.
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }
}

impl Drop for MeteringEngine {
    fn drop(&mut self) {
        if let Some(task) = self.alert_task.lock().take() {
            task.abort();
        }
    }
}

/// Builder for [`MeteringEngine`]. Stores not supplied are in-memory.
#[derive(Default)]
pub struct MeteringEngineBuilder {
    config: Option<Config>,
    repository: Option<Arc<dyn AnalyticsRepository>>,
    quota_store: Option<Arc<dyn QuotaStore>>,
    budget_store: Option<Arc<dyn BudgetStore>>,
    ledger: Option<Arc<dyn LedgerStore>>,
    notifier: Option<Arc<dyn AlertNotifier>>,
    telemetry: Option<Arc<Telemetry>>,
}

impl MeteringEngineBuilder {
    /// Create a new engine builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an analytics repository.
    pub fn with_repository(mut self, repository: Arc<dyn AnalyticsRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Use a quota store.
    pub fn with_quota_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.quota_store = Some(store);
        self
    }

    /// Use a budget store.
    pub fn with_budget_store(mut self, store: Arc<dyn BudgetStore>) -> Self {
        self.budget_store = Some(store);
        self
    }

    /// Use a ledger store.
    pub fn with_ledger_store(mut self, ledger: Arc<dyn LedgerStore>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Deliver alerts through this notifier instead of the configured one.
    pub fn with_notifier(mut self, notifier: Arc<dyn AlertNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Share a telemetry instance.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Build the engine. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<MeteringEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let telemetry = self
            .telemetry
            .unwrap_or_else(|| Arc::new(Telemetry::new(&config.telemetry)));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryAnalyticsRepository::new()));
        let quota_store = self
            .quota_store
            .unwrap_or_else(|| Arc::new(InMemoryQuotaStore::new()));
        let budget_store = self
            .budget_store
            .unwrap_or_else(|| Arc::new(InMemoryBudgetStore::new()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedgerStore::new()));
        let notifier = match self.notifier {
            Some(notifier) => notifier,
            None => integration::alert_notifier(&config.integrations)?,
        };

        let (dispatcher, alert_task) =
            AlertDispatcher::spawn(notifier.clone(), config.budget.alert_queue_capacity);

        let quota = Arc::new(QuotaTracker::new(quota_store, &config.quota, telemetry.clone()));
        let budgets = Arc::new(BudgetEngine::new(
            budget_store,
            &config.budget,
            Some(dispatcher),
            telemetry.clone(),
        ));
        let billing = Arc::new(
            BillingAggregator::new(ledger, &config.billing)?
                .with_quota_tracker(quota.clone())
                .with_budget_engine(budgets.clone()),
        );
        let worker = AnalyticsWorker::new(
            repository.clone(),
            Some(billing.clone()),
            &config,
            telemetry.clone(),
        );
        let analytics = UsageAnalytics::new(repository);

        if config.billing.pricing.is_empty() {
            warn!("No pricing configured, requests without a reported cost are billed at zero");
        }
        info!(
            notifier = notifier.name(),
            batch_size = config.ingestion.batch_size,
            currency = %config.billing.currency,
            "Metering engine built"
        );

        Ok(MeteringEngine {
            config,
            telemetry,
            worker,
            quota,
            budgets,
            billing,
            analytics,
            alert_task: Mutex::new(Some(alert_task)),
        })
    }
}

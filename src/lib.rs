//! # LLM Metering Engine
//!
//! Usage metering, quota enforcement, budget alerting, discounting and
//! billing for an LLM gateway. The gateway reports one metric per completed
//! request; the engine buffers it, persists it in batches, prices it and
//! turns it into quota counters, budget alerts, period summaries and
//! invoices.
//!
//! ## Features
//!
//! - **Ingestion**: non-blocking recording with batched, size- and
//!   time-triggered flushes
//! - **Quotas**: per-organization request, token and cost limits per billing
//!   period, checked from a TTL cache
//! - **Budgets**: organization or project caps with once-per-period
//!   threshold alerts delivered asynchronously
//! - **Billing**: deterministic period summaries, discounts, invoices and
//!   payment records
//! - **Analytics**: overviews, time series, per-project usage and CSV/JSON
//!   export
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use llm_metering_engine::{MeteringEngine, RequestMetric};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = MeteringEngine::builder().build().await?;
//!     engine.start()?;
//!
//!     engine.record_request(
//!         RequestMetric::builder("req-1", "org-1")
//!             .model("openai", "gpt-4o")
//!             .tokens(1_200, 300)
//!             .build(),
//!     )?;
//!
//!     let status = engine.check_usage_quotas("org-1").await?;
//!     if !status.allowed() {
//!         println!("quota exceeded");
//!     }
//!
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod analytics;
pub mod api;
pub mod billing;
pub mod budget;
pub mod cache;
pub mod config;
pub mod discount;
pub mod error;
pub mod ingestion;
pub mod integration;
pub mod model;
pub mod quota;
pub mod repository;
pub mod telemetry;

// Re-export main types for convenience
pub use api::{EngineHealth, MeteringEngine, MeteringEngineBuilder};
pub use billing::{BillingAggregator, BillingSummary, Invoice, InvoiceStatus};
pub use budget::{BudgetEngine, BudgetScope, NewBudget, UsageAlert, UsageBudget};
pub use config::Config;
pub use discount::{Discount, DiscountCalculator};
pub use error::{Error, Result};
pub use ingestion::AnalyticsWorker;
pub use model::{BillingPeriod, BillingTier, CostMetric, RequestMetric, TimeRange, UsageMetric};
pub use quota::{QuotaPlan, QuotaStatus, QuotaTracker};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

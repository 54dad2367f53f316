//! Engine configuration.
//!
//! Configuration is layered with the `config` crate: an optional YAML file
//! first, then environment variables prefixed with `METERING__` using `__` as
//! the section separator (e.g. `METERING__INGESTION__BATCH_SIZE=500`).
//! Durations use humantime notation (`10s`, `5m`).

use crate::discount::Discount;
use crate::model::{BillingTier, PricingEntry};
use crate::{Error, Result};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "METERING";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Ingestion worker settings
    pub ingestion: IngestionConfig,
    /// Quota tracker settings
    pub quota: QuotaConfig,
    /// Billing, pricing and discount settings
    pub billing: BillingConfig,
    /// Budget and alert settings
    pub budget: BudgetConfig,
    /// Logging and metrics settings
    pub telemetry: TelemetryConfig,
    /// External integrations
    pub integrations: IntegrationsConfig,
}

impl Config {
    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from a YAML file, with environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::config_key(
                format!("Configuration file not found: {}", path.display()),
                "config_file",
            ));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.ingestion.validate()?;
        self.quota.validate()?;
        self.billing.validate()?;
        self.budget.validate()?;
        Ok(())
    }
}

/// Ingestion worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Number of buffered records that triggers an out-of-band flush
    pub batch_size: usize,
    /// Interval of the unconditional periodic flush
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Interval of the hourly rollup task
    #[serde(with = "humantime_serde")]
    pub aggregation_interval: Duration,
    /// A buffer larger than `batch_size * unhealthy_buffer_multiplier` marks the worker unhealthy
    pub unhealthy_buffer_multiplier: usize,
    /// Upper bound on the final flush performed by `stop()`
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(10),
            aggregation_interval: Duration::from_secs(300),
            unhealthy_buffer_multiplier: 5,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl IngestionConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config_key(
                "batch size must be greater than zero",
                "ingestion.batch_size",
            ));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::config_key(
                "flush interval must be greater than zero",
                "ingestion.flush_interval",
            ));
        }
        if self.aggregation_interval.is_zero() {
            return Err(Error::config_key(
                "aggregation interval must be greater than zero",
                "ingestion.aggregation_interval",
            ));
        }
        if self.unhealthy_buffer_multiplier == 0 {
            return Err(Error::config_key(
                "unhealthy buffer multiplier must be greater than zero",
                "ingestion.unhealthy_buffer_multiplier",
            ));
        }
        Ok(())
    }
}

/// Quota tracker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// How long a cached quota is served before it is refreshed from the store
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Interval of the background cache reconciliation loop
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    /// Maximum number of organizations kept in the cache
    pub cache_max_entries: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
            sync_interval: Duration::from_secs(60),
            cache_max_entries: 10_000,
        }
    }
}

impl QuotaConfig {
    fn validate(&self) -> Result<()> {
        if self.sync_interval.is_zero() {
            return Err(Error::config_key(
                "sync interval must be greater than zero",
                "quota.sync_interval",
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(Error::config_key(
                "cache must hold at least one entry",
                "quota.cache_max_entries",
            ));
        }
        Ok(())
    }
}

/// Billing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BillingConfig {
    /// ISO currency code of every amount the engine produces
    pub currency: String,
    /// Decimal places kept after every monetary step
    pub rounding_scale: u32,
    /// Tier assumed when a request does not carry one
    pub default_tier: BillingTier,
    /// Price list used to derive cost metrics
    pub pricing: Vec<PricingEntry>,
    /// Discount rules applied at bill calculation
    pub discounts: Vec<Discount>,
    /// Days after sending before an invoice is due
    pub payment_terms_days: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            rounding_scale: 6,
            default_tier: BillingTier::default(),
            pricing: Vec::new(),
            discounts: Vec::new(),
            payment_terms_days: 30,
        }
    }
}

impl BillingConfig {
    fn validate(&self) -> Result<()> {
        if self.currency.len() != 3 {
            return Err(Error::config_key(
                "currency must be a three letter ISO code",
                "billing.currency",
            ));
        }
        if self.rounding_scale > 12 {
            return Err(Error::config_key(
                "rounding scale must be at most 12",
                "billing.rounding_scale",
            ));
        }
        for entry in &self.pricing {
            if entry.input_per_million < Decimal::ZERO || entry.output_per_million < Decimal::ZERO {
                return Err(Error::config_key(
                    format!("negative price for provider {}", entry.provider),
                    "billing.pricing",
                ));
            }
        }
        for discount in &self.discounts {
            discount.validate()?;
        }
        Ok(())
    }
}

/// Budget engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Capacity of the queue between alert detection and delivery
    pub alert_queue_capacity: usize,
    /// Thresholds used when a budget is created without any
    pub default_thresholds: Vec<Decimal>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            alert_queue_capacity: 1024,
            default_thresholds: vec![Decimal::from(50), Decimal::from(80), Decimal::from(100)],
        }
    }
}

impl BudgetConfig {
    fn validate(&self) -> Result<()> {
        if self.alert_queue_capacity == 0 {
            return Err(Error::config_key(
                "alert queue capacity must be greater than zero",
                "budget.alert_queue_capacity",
            ));
        }
        Ok(())
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Whether counters are recorded
    pub enabled: bool,
    /// Service name attached to logs
    pub service_name: String,
    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit logs as JSON lines
    pub json_logs: bool,
    /// Address of the Prometheus scrape endpoint, if any
    pub metrics_address: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "llm-metering-engine".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            metrics_address: None,
        }
    }
}

/// External integrations configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationsConfig {
    /// Webhook receiving fired budget alerts
    pub alert_webhook_url: Option<String>,
    /// Request timeout for integration calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            alert_webhook_url: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl IntegrationsConfig {
    /// Request timeout for integration calls.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingestion.batch_size, 100);
        assert_eq!(config.ingestion.unhealthy_buffer_multiplier, 5);
        assert_eq!(config.quota.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.quota.sync_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
ingestion:
  batch_size: 250
  flush_interval: 2s
quota:
  cache_ttl: 1m
billing:
  currency: EUR
  pricing:
    - provider: openai
      model: gpt-4o
      input_per_million: "2.50"
      output_per_million: "10.00"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.ingestion.batch_size, 250);
        assert_eq!(config.ingestion.flush_interval, Duration::from_secs(2));
        assert_eq!(config.ingestion.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.quota.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.billing.currency, "EUR");
        assert_eq!(config.billing.pricing.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = Config::default();
        config.ingestion.batch_size = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("ingestion.batch_size"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_currency_rejected() {
        let mut config = Config::default();
        config.billing.currency = "DOLLARS".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::from_file("/nonexistent/metering.yaml").is_err());
    }
}

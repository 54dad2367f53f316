//! Per-request metric.

use super::BillingTier;
use crate::{Error, Result};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Immutable outcome of one completed gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetric {
    /// Gateway request identifier
    pub request_id: String,
    /// Billed organization
    pub organization_id: String,
    /// Project within the organization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Deployment environment (production, staging, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Upstream provider
    pub provider: String,
    /// Model that served the request
    pub model: String,
    /// Prompt tokens
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Total tokens as reported upstream (at least input + output)
    pub total_tokens: u64,
    /// End-to-end latency in milliseconds
    pub latency_ms: u64,
    /// Whether the upstream call succeeded
    pub success: bool,
    /// HTTP status returned to the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Error description for failed calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Served from the gateway response cache
    #[serde(default)]
    pub cache_hit: bool,
    /// Request payload size in bytes
    #[serde(default)]
    pub request_bytes: u64,
    /// Response payload size in bytes
    #[serde(default)]
    pub response_bytes: u64,
    /// Cost reported by the provider, when it reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_cost: Option<Decimal>,
    /// Tier the organization was on when the request ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_tier: Option<BillingTier>,
    /// Completion time
    pub timestamp: DateTime<Utc>,
}

impl RequestMetric {
    /// Create a metric builder.
    pub fn builder(
        request_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> RequestMetricBuilder {
        RequestMetricBuilder::new(request_id, organization_id)
    }

    /// Reject metrics that cannot be attributed or priced.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.trim().is_empty() {
            return Err(Error::validation_field("request ID is required", "request_id"));
        }
        if self.organization_id.trim().is_empty() {
            return Err(Error::validation_field(
                "organization ID is required",
                "organization_id",
            ));
        }
        if self.provider.trim().is_empty() {
            return Err(Error::validation_field("provider is required", "provider"));
        }
        if self.model.trim().is_empty() {
            return Err(Error::validation_field("model is required", "model"));
        }
        let Some(billed) = self.input_tokens.checked_add(self.output_tokens) else {
            return Err(Error::validation_field(
                "input + output tokens overflow",
                "output_tokens",
            ));
        };
        if self.total_tokens < billed {
            return Err(Error::validation_field(
                format!(
                    "total tokens ({}) is less than input + output ({})",
                    self.total_tokens, billed
                ),
                "total_tokens",
            ));
        }
        if let Some(cost) = self.reported_cost {
            if cost < Decimal::ZERO {
                return Err(Error::validation_field(
                    "reported cost cannot be negative",
                    "reported_cost",
                ));
            }
        }
        Ok(())
    }

    /// Payload bytes moved through the gateway.
    pub fn payload_bytes(&self) -> u64 {
        self.request_bytes.saturating_add(self.response_bytes)
    }
}

/// Builder for [`RequestMetric`].
#[derive(Debug, Clone)]
pub struct RequestMetricBuilder {
    metric: RequestMetric,
}

impl RequestMetricBuilder {
    /// Start a metric for the given request and organization.
    pub fn new(request_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            metric: RequestMetric {
                request_id: request_id.into(),
                organization_id: organization_id.into(),
                project_id: None,
                environment: None,
                provider: String::new(),
                model: String::new(),
                input_tokens: 0,
                output_tokens: 0,
                total_tokens: 0,
                latency_ms: 0,
                success: true,
                status_code: None,
                error_message: None,
                cache_hit: false,
                request_bytes: 0,
                response_bytes: 0,
                reported_cost: None,
                billing_tier: None,
                timestamp: Utc::now(),
            },
        }
    }

    /// Set the project.
    pub fn project(mut self, project_id: impl Into<String>) -> Self {
        self.metric.project_id = Some(project_id.into());
        self
    }

    /// Set the environment.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.metric.environment = Some(environment.into());
        self
    }

    /// Set provider and model.
    pub fn model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.metric.provider = provider.into();
        self.metric.model = model.into();
        self
    }

    /// Set token counts; total becomes input + output.
    pub fn tokens(mut self, input: u64, output: u64) -> Self {
        self.metric.input_tokens = input;
        self.metric.output_tokens = output;
        self.metric.total_tokens = input.saturating_add(output);
        self
    }

    /// Override the upstream-reported total.
    pub fn total_tokens(mut self, total: u64) -> Self {
        self.metric.total_tokens = total;
        self
    }

    /// Set latency.
    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.metric.latency_ms = latency_ms;
        self
    }

    /// Mark the request as failed.
    pub fn failed(mut self, status_code: u16, message: impl Into<String>) -> Self {
        self.metric.success = false;
        self.metric.status_code = Some(status_code);
        self.metric.error_message = Some(message.into());
        self
    }

    /// Set the HTTP status code.
    pub fn status_code(mut self, status_code: u16) -> Self {
        self.metric.status_code = Some(status_code);
        self
    }

    /// Set the cache-hit flag.
    pub fn cache_hit(mut self, cache_hit: bool) -> Self {
        self.metric.cache_hit = cache_hit;
        self
    }

    /// Set payload sizes.
    pub fn payload_bytes(mut self, request_bytes: u64, response_bytes: u64) -> Self {
        self.metric.request_bytes = request_bytes;
        self.metric.response_bytes = response_bytes;
        self
    }

    /// Set the provider-reported cost.
    pub fn reported_cost(mut self, cost: Decimal) -> Self {
        self.metric.reported_cost = Some(cost);
        self
    }

    /// Set the billing tier.
    pub fn billing_tier(mut self, tier: BillingTier) -> Self {
        self.metric.billing_tier = Some(tier);
        self
    }

    /// Set the completion time.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.metric.timestamp = timestamp;
        self
    }

    /// Build the metric.
    pub fn build(self) -> RequestMetric {
        self.metric
    }
}

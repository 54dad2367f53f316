//! Budget alert delivery over HTTP.

use super::client::IntegrationClient;
use crate::budget::{AlertNotifier, UsageAlert};
use crate::Result;

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "alert-webhook";

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    message: String,
    alert: &'a UsageAlert,
}

/// Posts each alert as JSON to a configured URL.
///
/// Non-2xx answers and unreachable targets are errors; the dispatcher logs
/// them and moves on.
pub struct WebhookNotifier {
    client: IntegrationClient,
}

impl WebhookNotifier {
    /// Create a notifier for a webhook URL.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: IntegrationClient::new(url, timeout)?,
        })
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        self.client.base_url()
    }
}

#[async_trait]
impl AlertNotifier for WebhookNotifier {
    async fn notify(&self, alert: &UsageAlert) -> Result<()> {
        let payload = WebhookPayload {
            event: "budget.threshold_crossed",
            message: format!(
                "Budget '{}' for {} reached {}% of its {} limit ({} of {})",
                alert.budget_name,
                alert.scope,
                alert.percent.round_dp(1).normalize(),
                alert.dimension,
                alert.usage.normalize(),
                alert.limit.normalize()
            ),
            alert,
        };

        let status = self.client.post("", &payload).await.into_result(SERVICE)?;
        debug!(alert_id = %alert.id, status, url = self.url(), "Alert webhook delivered");
        Ok(())
    }

    fn name(&self) -> &str {
        SERVICE
    }
}

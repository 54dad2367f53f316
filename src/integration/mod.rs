//! Outbound integrations.
//!
//! - **Alert webhook**: posts fired budget alerts as JSON

mod client;
mod webhook;

pub use client::{IntegrationClient, IntegrationResult};
pub use webhook::WebhookNotifier;

use crate::budget::{AlertNotifier, LogNotifier};
use crate::config::IntegrationsConfig;
use crate::Result;
use std::sync::Arc;
use tracing::info;

/// Pick the alert channel the configuration asks for.
///
/// A webhook URL selects [`WebhookNotifier`]; otherwise alerts are only
/// logged.
pub fn alert_notifier(config: &IntegrationsConfig) -> Result<Arc<dyn AlertNotifier>> {
    match &config.alert_webhook_url {
        Some(url) => {
            let notifier = WebhookNotifier::new(url.clone(), config.timeout())?;
            info!(url = notifier.url(), "Budget alerts delivered by webhook");
            Ok(Arc::new(notifier))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifier_selection() {
        let mut config = IntegrationsConfig::default();
        assert_eq!(alert_notifier(&config).unwrap().name(), "log");

        config.alert_webhook_url = Some("https://hooks.example.com/budget".to_string());
        assert_eq!(alert_notifier(&config).unwrap().name(), "alert-webhook");

        config.alert_webhook_url = Some("not a url".to_string());
        assert!(alert_notifier(&config).is_err());
    }
}

//! Alert delivery.
//!
//! Detection and persistence happen inline in the usage path; delivery is
//! decoupled through a bounded channel drained by one background task, so a
//! slow notification target never stalls billing.

use super::types::UsageAlert;
use crate::Result;

use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivers fired alerts to an external channel.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    /// Deliver one alert.
    async fn notify(&self, alert: &UsageAlert) -> Result<()>;

    /// Channel name used in logs.
    fn name(&self) -> &str;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &UsageAlert) -> Result<()> {
        info!(
            alert_id = %alert.id,
            budget_id = %alert.budget_id,
            scope = %alert.scope,
            threshold = %alert.threshold,
            dimension = %alert.dimension,
            percent = %alert.percent,
            "Budget threshold crossed"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Queue in front of an [`AlertNotifier`].
pub struct AlertDispatcher {
    sender: mpsc::Sender<UsageAlert>,
}

impl AlertDispatcher {
    /// Create the queue and spawn its delivery task.
    ///
    /// The task exits once every dispatcher clone is dropped and the queue
    /// has drained.
    pub fn spawn(notifier: Arc<dyn AlertNotifier>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_delivery(receiver, notifier));
        (Self { sender }, handle)
    }

    /// Queue an alert without waiting. A full queue drops the alert.
    pub fn dispatch(&self, alert: UsageAlert) {
        match self.sender.try_send(alert) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(alert)) => {
                counter!("metering_alert_deliveries_dropped_total").increment(1);
                warn!(alert_id = %alert.id, "Alert queue full, dropping delivery");
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                counter!("metering_alert_deliveries_dropped_total").increment(1);
                warn!(alert_id = %alert.id, "Alert delivery task stopped, dropping delivery");
            }
        }
    }
}

async fn run_delivery(mut receiver: mpsc::Receiver<UsageAlert>, notifier: Arc<dyn AlertNotifier>) {
    while let Some(alert) = receiver.recv().await {
        match notifier.notify(&alert).await {
            Ok(()) => {
                counter!("metering_alert_deliveries_total", "outcome" => "success").increment(1);
                debug!(alert_id = %alert.id, notifier = notifier.name(), "Alert delivered");
            }
            Err(e) => {
                counter!("metering_alert_deliveries_total", "outcome" => "failure").increment(1);
                warn!(
                    alert_id = %alert.id,
                    notifier = notifier.name(),
                    error = %e,
                    "Alert delivery failed"
                );
            }
        }
    }
    debug!("Alert delivery task finished");
}

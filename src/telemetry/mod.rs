//! Telemetry and observability for the metering engine.
//!
//! Counters are kept as atomics so that health endpoints can read them
//! without a metrics backend, and every increment is mirrored to the
//! `metrics` facade for the Prometheus exporter installed by the daemon.

use crate::config::TelemetryConfig;
use crate::{Error, Result};

use metrics::{counter, gauge, histogram};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Kind of buffered record, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Request metrics
    Request,
    /// Usage events
    Usage,
    /// Cost facts
    Cost,
}

impl RecordKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Request => "request",
            RecordKind::Usage => "usage",
            RecordKind::Cost => "cost",
        }
    }
}

/// Telemetry instance for recording engine counters.
pub struct Telemetry {
    enabled: bool,
    service_name: String,
    recorded: AtomicU64,
    rejected: AtomicU64,
    flushed: AtomicU64,
    dropped: AtomicU64,
    flush_failures: AtomicU64,
    alerts_fired: AtomicU64,
    quota_denials: AtomicU64,
    quota_fail_open: AtomicU64,
}

impl Telemetry {
    /// Create a new telemetry instance.
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            service_name: config.service_name.clone(),
            recorded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            flushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            alerts_fired: AtomicU64::new(0),
            quota_denials: AtomicU64::new(0),
            quota_fail_open: AtomicU64::new(0),
        }
    }

    /// Telemetry that records nothing.
    pub fn disabled() -> Self {
        Self::new(&TelemetryConfig {
            enabled: false,
            ..TelemetryConfig::default()
        })
    }

    /// Record an accepted request metric.
    pub fn record_accepted(&self) {
        if !self.enabled {
            return;
        }
        self.recorded.fetch_add(1, Ordering::Relaxed);
        counter!("metering_records_accepted_total").increment(1);
    }

    /// Record a request metric rejected by validation or lifecycle.
    pub fn record_rejected(&self, reason: &'static str) {
        if !self.enabled {
            return;
        }
        self.rejected.fetch_add(1, Ordering::Relaxed);
        counter!("metering_records_rejected_total", "reason" => reason).increment(1);
    }

    /// Record a successful flush.
    pub fn record_flush(&self, kind: RecordKind, records: usize, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.flushed.fetch_add(records as u64, Ordering::Relaxed);
        counter!("metering_records_flushed_total", "kind" => kind.as_str()).increment(records as u64);
        histogram!("metering_flush_duration_seconds", "kind" => kind.as_str())
            .record(duration.as_secs_f64());
    }

    /// Record a batch dropped after a sink failure.
    pub fn record_dropped(&self, kind: RecordKind, records: usize) {
        if !self.enabled {
            return;
        }
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(records as u64, Ordering::Relaxed);
        counter!("metering_flush_failures_total", "kind" => kind.as_str()).increment(1);
        counter!("metering_records_dropped_total", "kind" => kind.as_str()).increment(records as u64);
    }

    /// Publish the current buffer depth.
    pub fn record_buffer_depth(&self, kind: RecordKind, depth: usize) {
        if !self.enabled {
            return;
        }
        gauge!("metering_buffer_depth", "kind" => kind.as_str()).set(depth as f64);
    }

    /// Record a fired budget alert.
    pub fn record_alert(&self) {
        if !self.enabled {
            return;
        }
        self.alerts_fired.fetch_add(1, Ordering::Relaxed);
        counter!("metering_alerts_fired_total").increment(1);
    }

    /// Record a quota check that denied at least one dimension.
    pub fn record_quota_denial(&self) {
        if !self.enabled {
            return;
        }
        self.quota_denials.fetch_add(1, Ordering::Relaxed);
        counter!("metering_quota_denials_total").increment(1);
    }

    /// Record a quota check answered fail-open.
    pub fn record_quota_fail_open(&self) {
        if !self.enabled {
            return;
        }
        self.quota_fail_open.fetch_add(1, Ordering::Relaxed);
        counter!("metering_quota_fail_open_total").increment(1);
    }

    /// Get current metrics.
    pub fn metrics(&self) -> TelemetryMetrics {
        TelemetryMetrics {
            records_accepted: self.recorded.load(Ordering::Relaxed),
            records_rejected: self.rejected.load(Ordering::Relaxed),
            records_flushed: self.flushed.load(Ordering::Relaxed),
            records_dropped: self.dropped.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            alerts_fired: self.alerts_fired.load(Ordering::Relaxed),
            quota_denials: self.quota_denials.load(Ordering::Relaxed),
            quota_fail_open: self.quota_fail_open.load(Ordering::Relaxed),
        }
    }

    /// Check if telemetry is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the service name.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

/// Metrics collected by telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TelemetryMetrics {
    /// Request metrics accepted into buffers
    pub records_accepted: u64,
    /// Request metrics rejected before buffering
    pub records_rejected: u64,
    /// Records written to sinks
    pub records_flushed: u64,
    /// Records lost to sink failures
    pub records_dropped: u64,
    /// Failed flush attempts
    pub flush_failures: u64,
    /// Budget alerts fired
    pub alerts_fired: u64,
    /// Quota checks with a denied dimension
    pub quota_denials: u64,
    /// Quota checks answered fail-open
    pub quota_fail_open: u64,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config_key(e.to_string(), "telemetry.log_level"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to set logging subscriber: {}", e)))
}

/// Install the Prometheus recorder with its own scrape listener.
pub fn install_metrics_exporter(address: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| Error::internal(format!("Failed to install metrics exporter: {}", e)))
}

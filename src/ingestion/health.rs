//! Worker health reporting.

use crate::telemetry::TelemetryMetrics;

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Items waiting in each buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    /// Request metrics
    pub requests: usize,
    /// Usage events
    pub usage: usize,
    /// Cost facts
    pub costs: usize,
}

impl BufferSizes {
    /// Largest of the three buffers.
    pub fn max(&self) -> usize {
        self.requests.max(self.usage).max(self.costs)
    }

    /// Items across all buffers.
    pub fn total(&self) -> usize {
        self.requests + self.usage + self.costs
    }
}

/// Snapshot of the worker's state.
///
/// A buffer above the threshold means the sinks are not keeping up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHealth {
    /// Running and no buffer above the threshold
    pub healthy: bool,
    /// Accepting records
    pub running: bool,
    /// Current buffer depths
    pub buffers: BufferSizes,
    /// Depth above which the worker reports unhealthy
    pub threshold: usize,
    /// Buffer depth that triggers an out-of-band flush
    pub batch_size: usize,
    /// Period of the unconditional flush
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Counters since start
    pub metrics: TelemetryMetrics,
}

impl WorkerHealth {
    pub(crate) fn new(
        running: bool,
        buffers: BufferSizes,
        threshold: usize,
        batch_size: usize,
        flush_interval: Duration,
        metrics: TelemetryMetrics,
    ) -> Self {
        Self {
            healthy: running && buffers.max() <= threshold,
            running,
            buffers,
            threshold,
            batch_size,
            flush_interval,
            metrics,
        }
    }
}

//! Analytics ingestion.
//!
//! [`AnalyticsWorker`] absorbs one [`RequestMetric`] per completed gateway
//! request. Recording validates the metric, derives its cost fact and usage
//! event and appends all three to their buffers; it never waits on I/O.
//!
//! Buffers drain in three ways:
//!
//! - a buffer reaching the batch size schedules one out-of-band flush;
//! - a periodic task flushes every buffer;
//! - [`AnalyticsWorker::stop`] performs a final bounded flush after the
//!   background tasks have finished.
//!
//! A second periodic task materializes the hourly rollup of the previous
//! completed hour. Flush failures are logged and the batch is dropped.

mod buffer;
mod health;

pub use buffer::SwapBuffer;
pub use health::{BufferSizes, WorkerHealth};

use crate::billing::BillingSink;
use crate::config::Config;
use crate::model::{BillingTier, CostMetric, PricingTable, RequestMetric, UsageMetric};
use crate::repository::AnalyticsRepository;
use crate::telemetry::{RecordKind, Telemetry};
use crate::{Error, Result};

use chrono::{Duration as ChronoDuration, DurationRound, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Items taken by one flush of every buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Request metrics taken
    pub requests: usize,
    /// Usage events taken
    pub usage: usize,
    /// Cost facts taken
    pub costs: usize,
}

impl FlushReport {
    /// Items taken across all buffers.
    pub fn total(&self) -> usize {
        self.requests + self.usage + self.costs
    }
}

/// Buffered ingestion of request metrics.
pub struct AnalyticsWorker {
    inner: Arc<WorkerInner>,
    lifecycle: Mutex<Option<Lifecycle>>,
}

struct Lifecycle {
    shutdown: CancellationToken,
    flush_task: JoinHandle<()>,
    aggregation_task: JoinHandle<()>,
}

struct WorkerInner {
    repository: Arc<dyn AnalyticsRepository>,
    billing: Option<Arc<dyn BillingSink>>,
    pricing: PricingTable,
    currency: String,
    scale: u32,
    default_tier: BillingTier,
    batch_size: usize,
    flush_interval: Duration,
    aggregation_interval: Duration,
    unhealthy_threshold: usize,
    shutdown_timeout: Duration,
    telemetry: Arc<Telemetry>,
    requests: SwapBuffer<RequestMetric>,
    usage: SwapBuffer<UsageMetric>,
    costs: SwapBuffer<CostMetric>,
    // Appends hold the read side; stop() takes the write side so nothing
    // lands in a buffer after the final flush.
    running: RwLock<bool>,
    runtime: Mutex<Option<Handle>>,
    flushes: TaskTracker,
    // Items taken from a buffer whose sinks have not all answered yet.
    in_flight: AtomicUsize,
}

impl AnalyticsWorker {
    /// Create a stopped worker.
    pub fn new(
        repository: Arc<dyn AnalyticsRepository>,
        billing: Option<Arc<dyn BillingSink>>,
        config: &Config,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let ingestion = &config.ingestion;
        let batch_size = ingestion.batch_size.max(1);

        let inner = WorkerInner {
            repository,
            billing,
            pricing: PricingTable::from_entries(&config.billing.pricing),
            currency: config.billing.currency.clone(),
            scale: config.billing.rounding_scale,
            default_tier: config.billing.default_tier,
            batch_size,
            flush_interval: ingestion.flush_interval,
            aggregation_interval: ingestion.aggregation_interval,
            unhealthy_threshold: batch_size.saturating_mul(ingestion.unhealthy_buffer_multiplier),
            shutdown_timeout: ingestion.shutdown_timeout,
            telemetry,
            requests: SwapBuffer::new(batch_size),
            usage: SwapBuffer::new(batch_size),
            costs: SwapBuffer::new(batch_size),
            running: RwLock::new(false),
            runtime: Mutex::new(None),
            flushes: TaskTracker::new(),
            in_flight: AtomicUsize::new(0),
        };

        Self {
            inner: Arc::new(inner),
            lifecycle: Mutex::new(None),
        }
    }

    /// Start accepting records and spawn the periodic tasks.
    ///
    /// Must be called from within a Tokio runtime. Starting a running
    /// worker is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.is_some() {
            warn!("Analytics worker already running");
            return Ok(());
        }

        let handle = Handle::try_current()
            .map_err(|e| Error::internal(format!("Analytics worker needs a Tokio runtime: {}", e)))?;
        *self.inner.runtime.lock() = Some(handle);
        self.inner.flushes.reopen();

        let shutdown = CancellationToken::new();
        let flush_task = tokio::spawn(run_periodic_flush(self.inner.clone(), shutdown.clone()));
        let aggregation_task = tokio::spawn(run_periodic_aggregation(self.inner.clone(), shutdown.clone()));

        *self.inner.running.write() = true;
        *lifecycle = Some(Lifecycle {
            shutdown,
            flush_task,
            aggregation_task,
        });

        info!(
            batch_size = self.inner.batch_size,
            flush_interval = ?self.inner.flush_interval,
            aggregation_interval = ?self.inner.aggregation_interval,
            "Analytics worker started"
        );
        Ok(())
    }

    /// Stop the worker.
    ///
    /// Stops accepting records, halts the periodic tasks, waits for
    /// in-flight flushes and then flushes what is left, bounded by the
    /// shutdown timeout. Stopping a stopped worker is a no-op.
    pub async fn stop(&self) -> Result<FlushReport> {
        let Some(lifecycle) = self.lifecycle.lock().take() else {
            return Ok(FlushReport::default());
        };

        *self.inner.running.write() = false;

        lifecycle.shutdown.cancel();
        for (name, task) in [
            ("flush", lifecycle.flush_task),
            ("aggregation", lifecycle.aggregation_task),
        ] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Background task ended abnormally");
            }
        }

        self.inner.flushes.close();
        self.inner.flushes.wait().await;

        let timeout = self.inner.shutdown_timeout;
        let outcome = tokio::time::timeout(timeout, self.inner.flush_all()).await;
        *self.inner.runtime.lock() = None;

        let Ok(report) = outcome else {
            let abandoned = self.inner.in_flight.swap(0, Ordering::SeqCst);
            error!(
                timeout = ?timeout,
                abandoned,
                still_buffered = self.inner.buffer_sizes().total(),
                "Final flush did not complete in time, taken batches abandoned"
            );
            return Err(Error::timeout("final flush", timeout.as_millis() as u64));
        };

        info!(flushed = report.total(), "Analytics worker stopped");
        Ok(report)
    }

    /// Record one completed request.
    ///
    /// Fails only when the worker is not running or the metric is invalid.
    pub fn record_request(&self, metric: RequestMetric) -> Result<()> {
        let running = self.inner.running.read();
        if !*running {
            self.inner.telemetry.record_rejected("not_running");
            return Err(Error::NotRunning);
        }
        if let Err(e) = metric.validate() {
            self.inner.telemetry.record_rejected("validation");
            return Err(e);
        }

        let (cost, priced) = self.inner.pricing.cost_for(
            &metric,
            &self.inner.currency,
            self.inner.scale,
            self.inner.default_tier,
        );
        if !priced && metric.reported_cost.is_none() && !metric.cache_hit {
            debug!(
                provider = %metric.provider,
                model = %metric.model,
                "No price for model, recording zero cost"
            );
        }
        let usage = UsageMetric::from_request(&metric);

        let requests = self.inner.requests.push(metric);
        let usage_len = self.inner.usage.push(usage);
        let costs = self.inner.costs.push(cost);
        self.inner.telemetry.record_accepted();

        self.inner.schedule_overflow(RecordKind::Request, requests);
        self.inner.schedule_overflow(RecordKind::Usage, usage_len);
        self.inner.schedule_overflow(RecordKind::Cost, costs);
        drop(running);
        Ok(())
    }

    /// Record a usage event that did not come from a request.
    pub fn record_usage(&self, usage: UsageMetric) -> Result<()> {
        let running = self.inner.running.read();
        if !*running {
            self.inner.telemetry.record_rejected("not_running");
            return Err(Error::NotRunning);
        }
        if let Err(e) = usage.validate() {
            self.inner.telemetry.record_rejected("validation");
            return Err(e);
        }

        let len = self.inner.usage.push(usage);
        self.inner.schedule_overflow(RecordKind::Usage, len);
        drop(running);
        Ok(())
    }

    /// Flush every buffer now.
    pub async fn flush_all(&self) -> FlushReport {
        self.inner.flush_all().await
    }

    /// Current buffer depths.
    pub fn buffer_sizes(&self) -> BufferSizes {
        self.inner.buffer_sizes()
    }

    /// Whether the worker accepts records.
    pub fn is_running(&self) -> bool {
        *self.inner.running.read()
    }

    /// Health snapshot.
    pub fn get_health(&self) -> WorkerHealth {
        WorkerHealth::new(
            self.is_running(),
            self.buffer_sizes(),
            self.inner.unhealthy_threshold,
            self.inner.batch_size,
            self.inner.flush_interval,
            self.inner.telemetry.metrics(),
        )
    }
}

impl WorkerInner {
    fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes {
            requests: self.requests.len(),
            usage: self.usage.len(),
            costs: self.costs.len(),
        }
    }

    fn buffer_len(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Request => self.requests.len(),
            RecordKind::Usage => self.usage.len(),
            RecordKind::Cost => self.costs.len(),
        }
    }

    fn claim(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Request => self.requests.try_claim_flush(),
            RecordKind::Usage => self.usage.try_claim_flush(),
            RecordKind::Cost => self.costs.try_claim_flush(),
        }
    }

    fn release(&self, kind: RecordKind) {
        match kind {
            RecordKind::Request => self.requests.release_flush(),
            RecordKind::Usage => self.usage.release_flush(),
            RecordKind::Cost => self.costs.release_flush(),
        }
    }

    /// Spawn one flush of a buffer that reached the batch size.
    fn schedule_overflow(self: &Arc<Self>, kind: RecordKind, len: usize) {
        if len < self.batch_size || !self.claim(kind) {
            return;
        }

        let Some(runtime) = self.runtime.lock().clone() else {
            self.release(kind);
            return;
        };

        let inner = Arc::clone(self);
        self.flushes.spawn_on(
            async move {
                loop {
                    inner.flush(kind).await;
                    inner.release(kind);
                    if inner.buffer_len(kind) < inner.batch_size || !inner.claim(kind) {
                        break;
                    }
                }
            },
            &runtime,
        );
        debug!(kind = kind.as_str(), buffered = len, "Batch size reached, flush scheduled");
    }

    async fn flush_all(&self) -> FlushReport {
        let (requests, usage, costs) = tokio::join!(
            self.flush(RecordKind::Request),
            self.flush(RecordKind::Usage),
            self.flush(RecordKind::Cost),
        );
        FlushReport {
            requests,
            usage,
            costs,
        }
    }

    /// Drain one buffer into its sinks. Returns the number of items taken.
    async fn flush(&self, kind: RecordKind) -> usize {
        match kind {
            RecordKind::Request => {
                let batch = self.requests.take();
                if batch.is_empty() {
                    return 0;
                }
                self.in_flight.fetch_add(batch.len(), Ordering::SeqCst);
                let started = Instant::now();
                let result = self.repository.batch_insert_request_metrics(&batch).await;
                self.finish(kind, "repository", batch.len(), started, result);
                self.settle(batch.len())
            }
            RecordKind::Usage => {
                let batch = self.usage.take();
                if batch.is_empty() {
                    return 0;
                }
                self.in_flight.fetch_add(batch.len(), Ordering::SeqCst);
                let started = Instant::now();
                let result = self.repository.batch_insert_usage_metrics(&batch).await;
                self.finish(kind, "repository", batch.len(), started, result);
                if let Some(billing) = &self.billing {
                    let started = Instant::now();
                    let result = billing.record_usage_events(&batch).await;
                    self.finish(kind, "billing", batch.len(), started, result);
                }
                self.settle(batch.len())
            }
            RecordKind::Cost => {
                let batch = self.costs.take();
                if batch.is_empty() {
                    return 0;
                }
                self.in_flight.fetch_add(batch.len(), Ordering::SeqCst);
                let started = Instant::now();
                let result = self.repository.batch_insert_cost_metrics(&batch).await;
                self.finish(kind, "repository", batch.len(), started, result);
                if let Some(billing) = &self.billing {
                    let started = Instant::now();
                    let result = billing.record_costs(&batch).await;
                    self.finish(kind, "billing", batch.len(), started, result);
                }
                self.settle(batch.len())
            }
        }
    }

    fn settle(&self, count: usize) -> usize {
        self.in_flight.fetch_sub(count, Ordering::SeqCst);
        count
    }

    fn finish(&self, kind: RecordKind, sink: &'static str, count: usize, started: Instant, result: Result<()>) {
        match result {
            Ok(()) => {
                self.telemetry.record_flush(kind, count, started.elapsed());
                debug!(
                    kind = kind.as_str(),
                    sink,
                    count,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Flushed batch"
                );
            }
            Err(e) => {
                self.telemetry.record_dropped(kind, count);
                error!(
                    kind = kind.as_str(),
                    sink,
                    count,
                    error = %e,
                    "Flush failed, dropping batch"
                );
            }
        }
    }

    fn publish_depths(&self) {
        let sizes = self.buffer_sizes();
        self.telemetry.record_buffer_depth(RecordKind::Request, sizes.requests);
        self.telemetry.record_buffer_depth(RecordKind::Usage, sizes.usage);
        self.telemetry.record_buffer_depth(RecordKind::Cost, sizes.costs);
        if sizes.max() > self.unhealthy_threshold {
            warn!(
                requests = sizes.requests,
                usage = sizes.usage,
                costs = sizes.costs,
                threshold = self.unhealthy_threshold,
                "Ingestion buffers above threshold"
            );
        }
    }
}

async fn run_periodic_flush(inner: Arc<WorkerInner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.publish_depths();
                let report = inner.flush_all().await;
                if report.total() > 0 {
                    debug!(
                        requests = report.requests,
                        usage = report.usage,
                        costs = report.costs,
                        "Periodic flush"
                    );
                }
            }
        }
    }
    debug!("Periodic flush task finished");
}

async fn run_periodic_aggregation(inner: Arc<WorkerInner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.aggregation_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let now = Utc::now();
                let hour = match (now - ChronoDuration::hours(1)).duration_trunc(ChronoDuration::hours(1)) {
                    Ok(hour) => hour,
                    Err(e) => {
                        warn!(error = %e, "Could not compute aggregation hour");
                        continue;
                    }
                };
                match inner.repository.aggregate_hour(hour).await {
                    Ok(rows) => debug!(hour = %hour, rows, "Hourly rollup materialized"),
                    Err(e) => error!(hour = %hour, error = %e, "Hourly rollup failed"),
                }
            }
        }
    }
    debug!("Periodic aggregation task finished");
}

//! Metrics for the incremental sync
//!
//! Records through the `metrics` facade; installing an exporter is left to
//! the embedding application.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Orchestrator metrics
    pub const SYNC_STRATEGY_TOTAL: &str = "es_sync_strategy_total";
    pub const SYNC_PHASE_DURATION: &str = "es_sync_phase_duration_seconds";
    pub const SYNC_TASK_POLLS: &str = "es_sync_task_polls_total";
    pub const SYNC_WRITES_REJECTED: &str = "es_sync_writes_rejected_total";

    // Channel metrics
    pub const CHANNEL_DOCS_INDEXED: &str = "es_channel_docs_indexed_total";
    pub const CHANNEL_DOCS_FAILED: &str = "es_channel_docs_failed_total";
    pub const CHANNEL_BULK_REQUESTS: &str = "es_channel_bulk_requests_total";
    pub const CHANNEL_BULK_LATENCY: &str = "es_channel_bulk_latency_seconds";
    pub const CHANNEL_RETRY_COUNT: &str = "es_channel_retry_count_total";
    pub const CHANNEL_BUFFER_SIZE: &str = "es_channel_buffer_size";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const INDEX: &str = "index";
    pub const PHASE: &str = "phase";
    pub const STRATEGY: &str = "strategy";
    pub const TARGET: &str = "target";
    pub const STATUS: &str = "status";
}

/// Orchestrator metrics
#[derive(Clone)]
pub struct SyncMetrics {
    component: String,
}

impl SyncMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record the strategy resolved at start
    pub fn record_strategy(&self, strategy: &str) {
        counter!(
            names::SYNC_STRATEGY_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::STRATEGY => strategy.to_string(),
        )
        .increment(1);
    }

    /// Record how long a completion phase took
    pub fn record_phase_duration(&self, phase: &str, duration: Duration) {
        histogram!(
            names::SYNC_PHASE_DURATION,
            labels::COMPONENT => self.component.clone(),
            labels::PHASE => phase.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record a task-status poll
    pub fn record_task_poll(&self) {
        counter!(
            names::SYNC_TASK_POLLS,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record a write the channel refused
    pub fn record_write_rejected(&self, target: &str) {
        counter!(
            names::SYNC_WRITES_REJECTED,
            labels::COMPONENT => self.component.clone(),
            labels::TARGET => target.to_string(),
        )
        .increment(1);
    }
}

/// Ingest channel metrics
#[derive(Clone)]
pub struct ChannelMetrics {
    component: String,
}

impl ChannelMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    /// Record bulk request
    pub fn record_bulk_request(&self, status: &str) {
        counter!(
            names::CHANNEL_BULK_REQUESTS,
            labels::COMPONENT => self.component.clone(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Record documents indexed
    pub fn record_docs_indexed(&self, count: u64, index: &str) {
        counter!(
            names::CHANNEL_DOCS_INDEXED,
            labels::COMPONENT => self.component.clone(),
            labels::INDEX => index.to_string(),
        )
        .increment(count);
    }

    /// Record documents failed
    pub fn record_docs_failed(&self, count: u64, index: &str) {
        counter!(
            names::CHANNEL_DOCS_FAILED,
            labels::COMPONENT => self.component.clone(),
            labels::INDEX => index.to_string(),
        )
        .increment(count);
    }

    /// Record bulk latency
    pub fn record_bulk_latency(&self, duration: Duration) {
        histogram!(
            names::CHANNEL_BULK_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    /// Record retry
    pub fn record_retry(&self) {
        counter!(
            names::CHANNEL_RETRY_COUNT,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Set buffer size
    pub fn set_buffer_size(&self, size: u64) {
        gauge!(
            names::CHANNEL_BUFFER_SIZE,
            labels::COMPONENT => self.component.clone(),
        )
        .set(size as f64);
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Get elapsed time without stopping
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric. Stage metrics carry a `stage` label ("prepare",
//! "upload"); ingest metrics are unlabelled because bucket identities are
//! unbounded.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Ingest
// ============================================================================

/// Event emitted when items are accepted by the ingest manager.
pub struct ItemsRecorded {
    pub count: u64,
}

impl InternalEvent for ItemsRecorded {
    fn emit(self) {
        trace!(count = self.count, "Items recorded");
        counter!("spillway_items_recorded_total").increment(self.count);
    }
}

/// Event emitted when serialized items are written to a bucket file.
pub struct BytesWritten {
    pub bytes: u64,
}

impl InternalEvent for BytesWritten {
    fn emit(self) {
        trace!(bytes = self.bytes, "Bytes written");
        counter!("spillway_bytes_written_total").increment(self.bytes);
    }
}

/// How an ingest worker's file ended up.
#[derive(Debug, Clone, Copy)]
pub enum FileOutcome {
    Written,
    WriteError,
    Recovered,
}

impl FileOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            FileOutcome::Written => "written",
            FileOutcome::WriteError => "write_error",
            FileOutcome::Recovered => "recovered",
        }
    }
}

/// Event emitted when an ingest worker closes (or fails to open) its file.
pub struct FileClosed {
    pub outcome: FileOutcome,
}

impl InternalEvent for FileClosed {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), "File closed");
        counter!("spillway_files_closed_total", "outcome" => self.outcome.as_str()).increment(1);
    }
}

/// Gauge of live ingest workers across all buckets.
pub struct IngestWorkers {
    pub count: usize,
}

impl InternalEvent for IngestWorkers {
    fn emit(self) {
        gauge!("spillway_ingest_workers").set(self.count as f64);
    }
}

/// Gauge of items waiting in bucket queues.
pub struct IngestQueueDepth {
    pub depth: usize,
    pub buckets: usize,
}

impl InternalEvent for IngestQueueDepth {
    fn emit(self) {
        trace!(depth = self.depth, buckets = self.buckets, "Ingest queue depth");
        gauge!("spillway_ingest_queue_depth").set(self.depth as f64);
        gauge!("spillway_ingest_buckets").set(self.buckets as f64);
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Event emitted when a record transition is persisted.
pub struct RecordTransitioned {
    pub state: &'static str,
}

impl InternalEvent for RecordTransitioned {
    fn emit(self) {
        trace!(state = self.state, "Record transitioned");
        counter!("spillway_record_transitions_total", "state" => self.state).increment(1);
    }
}

/// Kind of conditional-update anomaly seen by the tracker.
#[derive(Debug, Clone, Copy)]
pub enum AnomalyKind {
    /// Zero rows matched: ownership changed or the record moved on.
    NotOwned,
    /// More than one row matched a unique key.
    Corruption,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::NotOwned => "not_owned",
            AnomalyKind::Corruption => "corruption",
        }
    }
}

/// Event emitted when a conditional update did not affect exactly one record.
pub struct TrackerAnomaly {
    pub kind: AnomalyKind,
}

impl InternalEvent for TrackerAnomaly {
    fn emit(self) {
        counter!("spillway_tracker_anomalies_total", "kind" => self.kind.as_str()).increment(1);
    }
}

/// Event emitted when serial allocation lost a race and retried.
pub struct SerialConflict;

impl InternalEvent for SerialConflict {
    fn emit(self) {
        counter!("spillway_serial_conflicts_total").increment(1);
    }
}

// ============================================================================
// Stages
// ============================================================================

/// Result of one stage worker attempt.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome {
    Success,
    Failure,
}

impl AttemptOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failure => "failure",
        }
    }
}

/// Event emitted after a stage worker finishes with a record.
pub struct StageAttempt {
    pub stage: &'static str,
    pub outcome: AttemptOutcome,
    pub duration: Duration,
}

impl InternalEvent for StageAttempt {
    fn emit(self) {
        trace!(
            stage = self.stage,
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Stage attempt"
        );
        counter!(
            "spillway_stage_attempts_total",
            "stage" => self.stage,
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
        histogram!("spillway_stage_attempt_duration_seconds", "stage" => self.stage)
            .record(self.duration.as_secs_f64());
    }
}

/// Gauge of records submitted to a stage pool and not yet finished.
pub struct StageQueueDepth {
    pub stage: &'static str,
    pub depth: usize,
    pub healthy: bool,
}

impl InternalEvent for StageQueueDepth {
    fn emit(self) {
        gauge!("spillway_stage_queue_depth", "stage" => self.stage).set(self.depth as f64);
        gauge!("spillway_stage_healthy", "stage" => self.stage)
            .set(if self.healthy { 1.0 } else { 0.0 });
    }
}

/// Event emitted after each retry sweep tick.
pub struct SweepCompleted {
    pub stage: &'static str,
    pub outcome: &'static str,
    pub dispatched: usize,
}

impl InternalEvent for SweepCompleted {
    fn emit(self) {
        trace!(
            stage = self.stage,
            outcome = self.outcome,
            dispatched = self.dispatched,
            "Sweep completed"
        );
        counter!(
            "spillway_sweeps_total",
            "stage" => self.stage,
            "outcome" => self.outcome
        )
        .increment(1);
        counter!("spillway_sweep_dispatched_total", "stage" => self.stage)
            .increment(self.dispatched as u64);
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Event emitted when a scheduled job callback returns an error.
pub struct JobFailed {
    pub job: &'static str,
}

impl InternalEvent for JobFailed {
    fn emit(self) {
        counter!("spillway_job_failures_total", "job" => self.job).increment(1);
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Storage operation type.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
        }
    }
}

/// Event emitted for each storage request with its latency.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub success: bool,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        let status = if self.success { "success" } else { "error" };
        trace!(
            operation = self.operation.as_str(),
            status,
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "spillway_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "spillway_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

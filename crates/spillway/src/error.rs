//! Error types for the spillway pipeline.

use snafu::prelude::*;
use std::sync::Arc;

// Re-export common errors
pub use spillway_core::error::{ConfigError, MetricsError, StorageError};

use crate::record::RecordId;

/// Errors raised while building a rolling scheme.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RollingError {
    /// Granularity is not a divisor of an hour, a whole hour count, or a whole day count.
    #[snafu(display(
        "Invalid rolling granularity {value}: must divide 60 minutes, or be whole hours or whole days"
    ))]
    InvalidGranularity { value: String },

    /// Output path template does not carry exactly one serial slot.
    #[snafu(display("Path pattern '{template}' must contain exactly one {{serial}} slot"))]
    InvalidPattern { template: String },
}

/// Errors surfaced by the tracker and its backends.
///
/// Losing a conditional-update race is not an error: those operations report
/// an affected count of zero instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TrackerError {
    /// Serial allocation kept colliding with other writers.
    #[snafu(display(
        "Could not allocate a serial for cohort {cohort} after {attempts} attempts"
    ))]
    SerialContention { cohort: String, attempts: usize },

    /// The persistence layer failed (connectivity, IO, ...).
    #[snafu(display("Tracker backend failure: {message}"))]
    Backend { message: String },
}

/// Errors produced by item serializers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SerializeError {
    /// JSON encoding failed.
    #[snafu(display("Failed to encode item as JSON: {source}"))]
    Json { source: serde_json::Error },
}

/// Errors reported by the ingest manager to producers.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    /// The manager is draining and accepts no new items.
    #[snafu(display("Ingest manager is shutting down"))]
    ShuttingDown,

    /// A writer could not open a record; queued items have nowhere to go.
    #[snafu(display("Ingest halted: {source}"))]
    Halted { source: Arc<TrackerError> },
}

/// Errors produced by stage workers (prepare, upload).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StageError {
    /// The record is owned by another node or already moved past this stage.
    #[snafu(display("Record {id} is not ours to advance"))]
    NotOwned { id: RecordId },

    /// A tracker call failed.
    #[snafu(display("Tracker error: {source}"))]
    Tracker { source: TrackerError },

    /// Reading or writing a local file failed.
    #[snafu(display("IO error on {path}: {source}"))]
    FileIo {
        path: String,
        source: std::io::Error,
    },

    /// A blocking transform task panicked or was cancelled.
    #[snafu(display("Transform task failed: {source}"))]
    TaskJoin { source: tokio::task::JoinError },

    /// Remote storage rejected the operation.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Worker-specific failure.
    #[snafu(display("{message}"))]
    Worker { message: String },
}

impl StageError {
    /// True when the failure only means another owner holds the record.
    pub fn is_not_owned(&self) -> bool {
        matches!(self, StageError::NotOwned { .. })
    }
}

impl From<TrackerError> for StageError {
    fn from(source: TrackerError) -> Self {
        StageError::Tracker { source }
    }
}

/// Top-level pipeline errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Rolling scheme error.
    #[snafu(display("Rolling scheme error: {source}"))]
    Rolling { source: RollingError },

    /// Tracker error.
    #[snafu(display("Tracker error: {source}"), context(name(PipelineTrackerSnafu)))]
    Tracker { source: TrackerError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"), context(name(PipelineStorageSnafu)))]
    Storage { source: StorageError },

    /// Ingest stopped accepting or writing items.
    #[snafu(display("Ingest error: {source}"))]
    Ingest { source: IngestError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },

    /// Reading producer input failed.
    #[snafu(display("Input error: {source}"))]
    Input { source: std::io::Error },
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<RollingError> for PipelineError {
    fn from(source: RollingError) -> Self {
        PipelineError::Rolling { source }
    }
}

impl From<TrackerError> for PipelineError {
    fn from(source: TrackerError) -> Self {
        PipelineError::Tracker { source }
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<IngestError> for PipelineError {
    fn from(source: IngestError) -> Self {
        PipelineError::Ingest { source }
    }
}

impl From<MetricsError> for PipelineError {
    fn from(source: MetricsError) -> Self {
        PipelineError::Metrics { source }
    }
}

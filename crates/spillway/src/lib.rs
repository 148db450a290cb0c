//! spillway: capture record streams into time-bucketed local files and ship
//! them to remote storage through a durable, multi-stage pipeline.
//!
//! ```text
//! record() → bucket queue → writer → WRITTEN → prepare → PREPARED → upload → UPLOADED
//! ```
//!
//! Every step is tracked as a [`Record`] whose state changes go through the
//! [`Tracker`], so a restarted or cooperating node can pick work back up.

pub mod clock;
pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod record;
pub mod rolling;
pub mod scheduler;
pub mod stage;
pub mod tracker;
pub mod workers;

pub use clock::{Clock, ClockRef, ManualClock, SystemClock};
pub use config::Config;
pub use error::{IngestError, PipelineError, RollingError, StageError, TrackerError};
pub use ingest::{IngestManager, IngestSettings, RequestContext};
pub use pipeline::{Pipeline, PipelineHealth};
pub use record::{Record, RecordId, State};
pub use rolling::{Granularity, PathPattern, RollingScheme};
pub use scheduler::Scheduler;
pub use stage::{Stage, StageManager, StageWorker, SweepOutcome};
pub use tracker::{Fields, MemoryBackend, Tracker, TrackerBackend, TransitionListener};
pub use workers::{JsonLines, PrepareWorker, Serializer, StorageClient, Transform, UploadWorker};

// Re-export from spillway-core
pub use spillway_core::{CliArgs, init_tracing, shutdown_signal};

//! spillway-core: shared plumbing for the spillway pipeline.
//!
//! - `config/` - YAML loading with environment variable interpolation, CLI args
//! - `metrics/` - Prometheus metrics events and HTTP endpoint
//! - `storage/` - Object storage provider (local, memory, S3, GCS, Azure)
//! - `signal` - Signal handling for graceful shutdown
//! - `logging` - Tracing subscriber initialization
//! - `error` - Common error types

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod signal;
pub mod storage;

pub use config::{CliArgs, MetricsConfig, interpolate, load_yaml, parse_yaml};
pub use error::{ConfigError, MetricsError, StorageError};
pub use logging::init_tracing;
pub use metrics::{
    DEFAULT_METRICS_ADDR, HealthCheck, MetricsController, init_global as init_metrics,
    init_test as init_metrics_test,
};
pub use signal::shutdown_signal;
pub use storage::StorageProvider;

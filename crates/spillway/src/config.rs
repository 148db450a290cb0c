//! Configuration for the spillway pipeline.
//!
//! ```yaml
//! node:
//!   data_dir: /var/spool/spillway
//! rolling:
//!   granularity: 15m
//! prepare:
//!   transform: { codec: gzip, level: 6 }
//! upload:
//!   destination: s3://archive/events
//!   storage_options:
//!     AWS_REGION: ${AWS_REGION:-us-east-1}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use spillway_core::{MetricsConfig, load_yaml, parse_yaml};

use crate::error::ConfigError;
use crate::ingest::IngestSettings;
use crate::rolling::{Granularity, RollingScheme};
use crate::stage::StageSettings;
use crate::workers::Transform;

/// Node identity and local layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Owner URI recorded on every record. Defaults to `node://{hostname}`.
    /// Must be stable across restarts for recovery to find this node's work.
    #[serde(default)]
    pub owner_uri: Option<String>,
    /// Directory bucket files are written to.
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn owner_uri(&self) -> String {
        self.owner_uri.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            format!("node://{host}")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RollingConfig {
    #[serde(default = "default_granularity")]
    pub granularity: Granularity,
    /// Extra time after a bucket ends during which late items still land in it.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for RollingConfig {
    fn default() -> Self {
        Self {
            granularity: default_granularity(),
            grace_period_secs: default_grace_period(),
            file_prefix: default_file_prefix(),
            extension: default_extension(),
        }
    }
}

fn default_granularity() -> Granularity {
    Granularity::Hours(1)
}

fn default_grace_period() -> u64 {
    60
}

fn default_file_prefix() -> String {
    "records".to_string()
}

fn default_extension() -> String {
    "ndjson".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_spawn_threshold")]
    pub spawn_threshold: usize,
    /// Defaults to the number of available CPUs.
    #[serde(default)]
    pub max_workers_per_bucket: Option<usize>,
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval(),
            spawn_threshold: default_spawn_threshold(),
            max_workers_per_bucket: None,
            prune_interval_secs: default_prune_interval(),
        }
    }
}

fn default_flush_interval() -> u64 {
    1_000
}

fn default_spawn_threshold() -> usize {
    10_000
}

fn default_prune_interval() -> u64 {
    5
}

/// Worker pool settings shared by the prepare and upload stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_peek_window")]
    pub peek_window: usize,
    #[serde(default = "default_health_threshold")]
    pub health_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            retry_interval_secs: default_retry_interval(),
            peek_window: default_peek_window(),
            health_threshold: default_health_threshold(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_retry_interval() -> u64 {
    60
}

fn default_peek_window() -> usize {
    50
}

fn default_health_threshold() -> usize {
    1_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrepareConfig {
    #[serde(default)]
    pub transform: Transform,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadConfig {
    /// Root URL artifacts are uploaded under (S3, GCS, Azure, local, memory).
    pub destination: String,
    /// Remote grouping recorded with each upload.
    #[serde(default)]
    pub group: Option<String>,
    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub rolling: RollingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub prepare: PrepareConfig,
    pub upload: UploadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a YAML file, with `${VAR}` interpolation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = parse_yaml(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<(String, &str)> = Vec::new();
        let mut require = |ok: bool, field: &str, message: &'static str| {
            if !ok {
                errors.push((field.to_string(), message));
            }
        };

        require(
            !self.node.data_dir.as_os_str().is_empty(),
            "node.data_dir",
            "must not be empty",
        );
        require(
            !self.upload.destination.trim().is_empty(),
            "upload.destination",
            "must not be empty",
        );
        require(
            self.ingest.flush_interval_ms > 0,
            "ingest.flush_interval_ms",
            "must be positive",
        );
        require(
            self.ingest.spawn_threshold > 0,
            "ingest.spawn_threshold",
            "must be positive",
        );
        require(
            self.ingest.max_workers_per_bucket != Some(0),
            "ingest.max_workers_per_bucket",
            "must be positive",
        );
        require(
            self.ingest.prune_interval_secs > 0,
            "ingest.prune_interval_secs",
            "must be positive",
        );
        for (name, pool) in [("prepare", &self.prepare.pool), ("upload", &self.upload.pool)] {
            require(
                pool.concurrency > 0,
                &format!("{name}.pool.concurrency"),
                "must be positive",
            );
            require(
                pool.peek_window > 0,
                &format!("{name}.pool.peek_window"),
                "must be positive",
            );
            require(
                pool.retry_interval_secs > 0,
                &format!("{name}.pool.retry_interval_secs"),
                "must be positive",
            );
        }

        match errors.as_slice() {
            [] => Ok(()),
            [(field, message)] => Err(ConfigError::InvalidField {
                field: field.clone(),
                message: message.to_string(),
            }),
            _ => Err(ConfigError::MultipleErrors {
                errors: errors
                    .iter()
                    .map(|(field, message)| format!("{field}: {message}"))
                    .collect(),
            }),
        }
    }

    pub fn rolling_scheme(&self) -> RollingScheme {
        RollingScheme::new(
            self.rolling.granularity,
            Duration::from_secs(self.rolling.grace_period_secs),
            &self.node.data_dir,
            &self.rolling.file_prefix,
            &self.rolling.extension,
        )
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        let mut settings = IngestSettings {
            flush_interval: Duration::from_millis(self.ingest.flush_interval_ms),
            spawn_threshold: self.ingest.spawn_threshold,
            ..IngestSettings::default()
        };
        if let Some(max) = self.ingest.max_workers_per_bucket {
            settings.max_workers_per_bucket = max;
        }
        settings
    }
}

impl PoolConfig {
    pub fn stage_settings(&self) -> StageSettings {
        StageSettings {
            concurrency: self.concurrency,
            peek_window: self.peek_window,
            health_threshold: self.health_threshold,
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
node:
  data_dir: /var/spool/spillway
upload:
  destination: memory://archive
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::parse(MINIMAL).unwrap();
        assert_eq!(config.rolling.granularity, Granularity::Hours(1));
        assert_eq!(config.rolling.grace_period_secs, 60);
        assert_eq!(config.prepare.transform, Transform::PassThrough);
        assert_eq!(config.prepare.pool.peek_window, 50);
        assert_eq!(config.upload.pool.concurrency, 4);
        assert!(config.upload.group.is_none());
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
node:
  owner_uri: node://ingest-7
  data_dir: /data/spool
rolling:
  granularity: 15m
  grace_period_secs: 30
  file_prefix: clicks
  extension: log
ingest:
  flush_interval_ms: 250
  spawn_threshold: 500
  max_workers_per_bucket: 3
prepare:
  transform:
    codec: zstd
    level: 7
  pool:
    concurrency: 2
upload:
  destination: s3://archive/clicks
  group: tenant-a
  storage_options:
    AWS_REGION: eu-west-1
  pool:
    retry_interval_secs: 120
metrics:
  enabled: false
"#;
        let config = Config::parse(yaml).unwrap();
        assert_eq!(config.node.owner_uri(), "node://ingest-7");
        assert_eq!(config.rolling.granularity, Granularity::Minutes(15));
        assert_eq!(config.prepare.transform, Transform::Zstd { level: 7 });
        assert_eq!(config.upload.pool.retry_interval(), Duration::from_secs(120));
        assert_eq!(config.upload.storage_options["AWS_REGION"], "eu-west-1");

        let settings = config.ingest_settings();
        assert_eq!(settings.flush_interval, Duration::from_millis(250));
        assert_eq!(settings.max_workers_per_bucket, 3);

        let scheme = config.rolling_scheme();
        assert_eq!(scheme.base_dir(), Path::new("/data/spool"));
    }

    #[test]
    fn test_invalid_granularity_fails_at_load() {
        let yaml = format!("{MINIMAL}rolling:\n  granularity: 7m\n");
        let err = Config::parse(&yaml).unwrap_err();
        assert!(err.to_string().contains("7m"), "{err}");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = format!("{MINIMAL}ingest:\n  flush_ms: 5\n");
        assert!(Config::parse(&yaml).is_err());
    }

    #[test]
    fn test_validation_collects_errors() {
        let yaml = r#"
node:
  data_dir: /x
upload:
  destination: ""
  pool:
    concurrency: 0
"#;
        match Config::parse(yaml).unwrap_err() {
            ConfigError::MultipleErrors { errors } => {
                assert_eq!(
                    errors,
                    [
                        "upload.destination: must not be empty",
                        "upload.pool.concurrency: must be positive",
                    ]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_single_validation_error_names_field() {
        let yaml = format!("{MINIMAL}ingest:\n  spawn_threshold: 0\n");
        match Config::parse(&yaml).unwrap_err() {
            ConfigError::InvalidField { field, message } => {
                assert_eq!(field, "ingest.spawn_threshold");
                assert_eq!(message, "must be positive");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

//! Common configuration plumbing: YAML loading, env interpolation, CLI args.

mod path;
mod vars;

pub use path::{CliArgs, is_yaml_file};
pub use vars::{InterpolationResult, interpolate};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::Path;

use crate::error::{ConfigError, ReadFileSnafu, YamlParseSnafu};

/// Metrics configuration for the Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
    /// Start the HTTP endpoint at all.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: default_metrics_address(),
            enabled: default_metrics_enabled(),
        }
    }
}

fn default_metrics_address() -> String {
    crate::metrics::DEFAULT_METRICS_ADDR.to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

/// Parse a YAML document after interpolating environment variables.
pub fn parse_yaml<T: DeserializeOwned>(contents: &str) -> Result<T, ConfigError> {
    let result = interpolate(contents);
    if !result.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: result.errors.join("\n"),
        });
    }
    serde_yaml::from_str(&result.text).context(YamlParseSnafu)
}

/// Load and parse a YAML config file.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
    parse_yaml(&contents)
}

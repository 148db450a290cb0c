//! Time bucketing and output file naming.
//!
//! A rolling scheme maps an item timestamp to the start of its bucket,
//! renders the bucket as a cohort string, and decides when a bucket is old
//! enough to close. Buckets are aligned to the Unix epoch in UTC, so every
//! node computes identical boundaries.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{InvalidGranularitySnafu, InvalidPatternSnafu, RollingError};

const SERIAL_SLOT: &str = "{serial}";

/// Bucket width.
///
/// Minutes must divide an hour evenly; hours and days may be any positive
/// count. Parsed from strings like `15m`, `1h`, `1d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Granularity {
    Minutes(u32),
    Hours(u32),
    Days(u32),
}

impl Granularity {
    /// Normalize a duration into a granularity, rejecting widths that would
    /// not tile the day.
    pub fn from_duration(duration: std::time::Duration) -> Result<Self, RollingError> {
        let secs = duration.as_secs();
        let invalid = || {
            InvalidGranularitySnafu {
                value: format!("{secs}s"),
            }
            .build()
        };
        if secs == 0 || secs % 60 != 0 || duration.subsec_nanos() != 0 {
            return Err(invalid());
        }

        let minutes = u32::try_from(secs / 60).map_err(|_| invalid())?;
        if minutes < 60 {
            ensure!(60 % minutes == 0, InvalidGranularitySnafu {
                value: format!("{minutes}m")
            });
            Ok(Granularity::Minutes(minutes))
        } else if minutes % (24 * 60) == 0 {
            Ok(Granularity::Days(minutes / (24 * 60)))
        } else if minutes % 60 == 0 {
            Ok(Granularity::Hours(minutes / 60))
        } else {
            Err(invalid())
        }
    }

    pub fn width(&self) -> TimeDelta {
        TimeDelta::seconds(self.seconds())
    }

    fn seconds(&self) -> i64 {
        match *self {
            Granularity::Minutes(n) => i64::from(n) * 60,
            Granularity::Hours(n) => i64::from(n) * 3_600,
            Granularity::Days(n) => i64::from(n) * 86_400,
        }
    }

    fn format(&self) -> &'static str {
        match self {
            Granularity::Minutes(_) => "%Y-%m-%dT%H-%M",
            Granularity::Hours(_) => "%Y-%m-%dT%H",
            Granularity::Days(_) => "%Y-%m-%d",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Minutes(n) => write!(f, "{n}m"),
            Granularity::Hours(n) => write!(f, "{n}h"),
            Granularity::Days(n) => write!(f, "{n}d"),
        }
    }
}

impl FromStr for Granularity {
    type Err = RollingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || InvalidGranularitySnafu { value: s }.build();

        let unit = s.chars().last().ok_or_else(invalid)?;
        let count: u64 = s[..s.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        let secs = match unit {
            'm' => count.checked_mul(60),
            'h' => count.checked_mul(3_600),
            'd' => count.checked_mul(86_400),
            _ => None,
        }
        .ok_or_else(invalid)?;

        Self::from_duration(std::time::Duration::from_secs(secs))
    }
}

impl TryFrom<String> for Granularity {
    type Error = RollingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Granularity> for String {
    fn from(value: Granularity) -> Self {
        value.to_string()
    }
}

/// Output file template with a single `{serial}` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    template: String,
}

impl PathPattern {
    pub fn new(template: impl Into<String>) -> Result<Self, RollingError> {
        let template = template.into();
        ensure!(
            template.matches(SERIAL_SLOT).count() == 1,
            InvalidPatternSnafu { template }
        );
        Ok(Self { template })
    }

    pub fn render(&self, serial: u64) -> PathBuf {
        PathBuf::from(self.template.replace(SERIAL_SLOT, &serial.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }
}

/// Bucketing policy plus the local layout of bucket files.
#[derive(Debug, Clone)]
pub struct RollingScheme {
    granularity: Granularity,
    grace: TimeDelta,
    base_dir: PathBuf,
    file_prefix: String,
    extension: String,
}

impl RollingScheme {
    pub fn new(
        granularity: Granularity,
        grace: std::time::Duration,
        base_dir: impl Into<PathBuf>,
        file_prefix: impl Into<String>,
        extension: impl Into<String>,
    ) -> Self {
        Self {
            granularity,
            grace: TimeDelta::from_std(grace).unwrap_or(TimeDelta::days(366)),
            base_dir: base_dir.into(),
            file_prefix: file_prefix.into(),
            extension: extension.into(),
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Floor `timestamp` to its bucket. A timestamp exactly on a boundary
    /// starts the new bucket.
    pub fn bucket_start(&self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.granularity.seconds();
        let floored = timestamp.timestamp().div_euclid(width) * width;
        DateTime::from_timestamp(floored, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn bucket_end(&self, bucket: DateTime<Utc>) -> DateTime<Utc> {
        bucket + self.granularity.width()
    }

    /// Cohort string for a bucket.
    pub fn representation(&self, bucket: DateTime<Utc>) -> String {
        bucket.format(self.granularity.format()).to_string()
    }

    /// Template of the local files for a bucket.
    pub fn output_path_pattern(&self, bucket: DateTime<Utc>) -> PathPattern {
        let name = format!(
            "{}-{}.{SERIAL_SLOT}.{}",
            self.file_prefix,
            self.representation(bucket),
            self.extension
        );
        PathPattern {
            template: self.base_dir.join(name).to_string_lossy().into_owned(),
        }
    }

    /// True once the bucket ended and the grace period for late items passed.
    pub fn is_time_to_close(&self, bucket: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now >= self.bucket_end(bucket) + self.grace
    }
}

//! Persistence seam for records.
//!
//! Backends only need compare-and-set semantics on a single row: `insert`
//! must fail on a duplicate `(cohort, serial)`, and `update` must apply only
//! when owner and current state still match. Everything else (serial retry,
//! anomaly handling, listener fan-out) lives in [`Tracker`](super::Tracker).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::ops::Range;
use std::path::PathBuf;

use crate::error::TrackerError;
use crate::record::{Record, RecordId, State};

/// Result of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    Created,
    /// Another writer already holds this `(cohort, serial)`.
    Conflict,
}

/// Optional field changes applied alongside (or instead of) a state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields {
    pub byte_size: Option<u64>,
    pub prepared_path: Option<PathBuf>,
    pub archive_key: Option<String>,
    pub archive_uri: Option<String>,
    pub archive_group: Option<String>,
}

impl Fields {
    pub fn byte_size(mut self, size: u64) -> Self {
        self.byte_size = Some(size);
        self
    }

    pub fn prepared_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.prepared_path = Some(path.into());
        self
    }

    pub fn archive_key(mut self, key: impl Into<String>) -> Self {
        self.archive_key = Some(key.into());
        self
    }

    pub fn archive_location(mut self, uri: impl Into<String>, group: Option<String>) -> Self {
        self.archive_uri = Some(uri.into());
        self.archive_group = group;
        self
    }

    /// Copy every set field onto `record`.
    pub fn apply_to(&self, record: &mut Record) {
        if let Some(size) = self.byte_size {
            record.byte_size = Some(size);
        }
        if let Some(path) = &self.prepared_path {
            record.prepared_path = Some(path.clone());
        }
        if let Some(key) = &self.archive_key {
            record.archive_key = Some(key.clone());
        }
        if let Some(uri) = &self.archive_uri {
            record.archive_uri = Some(uri.clone());
            record.archive_group = self.archive_group.clone();
        }
    }
}

/// A conditional update.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// New state, or `None` to leave the state alone.
    pub state: Option<State>,
    pub fields: Fields,
    /// Required current states. Empty means any state.
    pub allowed_from: &'static [State],
}

impl Update {
    pub fn transition(state: State, fields: Fields) -> Self {
        Self {
            state: Some(state),
            fields,
            allowed_from: state.legal_predecessors(),
        }
    }

    pub fn fields(fields: Fields) -> Self {
        Self {
            state: None,
            fields,
            allowed_from: &[],
        }
    }

    /// Whether a row currently in `state` satisfies the precondition.
    pub fn admits(&self, state: State) -> bool {
        self.allowed_from.is_empty() || self.allowed_from.contains(&state)
    }
}

/// Rows touched by a conditional update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOutcome {
    pub affected: usize,
    /// The row as persisted after the update, when exactly one row changed.
    pub record: Option<Record>,
}

/// Storage operations the tracker is built on.
#[async_trait]
pub trait TrackerBackend: Send + Sync + 'static {
    /// Highest serial used in `cohort`, plus one. Starts at 1.
    async fn next_serial(&self, cohort: &str) -> Result<u64, TrackerError>;

    /// Insert a new row, reporting a conflict on duplicate identity.
    async fn insert(&self, record: &Record) -> Result<Inserted, TrackerError>;

    /// Apply `update` to the row matching `id` and `owner` whose current
    /// state satisfies the update's precondition. Bumps `updated_at` to `now`.
    async fn update(
        &self,
        id: &RecordId,
        owner: &str,
        update: &Update,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, TrackerError>;

    /// Rows owned by `owner` in any of `states`, optionally restricted to a
    /// bucket start range, ordered by bucket then identity.
    fn find(
        &self,
        owner: &str,
        states: &[State],
        range: Option<Range<DateTime<Utc>>>,
    ) -> BoxStream<'static, Result<Record, TrackerError>>;

    /// Number of rows owned by `owner` in any of `states`.
    async fn count(&self, owner: &str, states: &[State]) -> Result<usize, TrackerError>;

    async fn get(&self, id: &RecordId) -> Result<Option<Record>, TrackerError>;
}

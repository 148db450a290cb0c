//! In-process tracker backend.
//!
//! Clones share one table, so several `Tracker`s with different owners over
//! the same `MemoryBackend` behave like cooperating nodes on a shared store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::backend::{Inserted, TrackerBackend, Update, UpdateOutcome};
use crate::error::TrackerError;
use crate::record::{Record, RecordId, State};

#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    rows: Arc<Mutex<BTreeMap<RecordId, Record>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, BTreeMap<RecordId, Record>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of every row, in identity order.
    pub fn snapshot(&self) -> Vec<Record> {
        self.rows().values().cloned().collect()
    }

    /// Reassign a row to another owner, as an operator handing work over would.
    pub fn reassign(&self, id: &RecordId, owner: &str) -> bool {
        match self.rows().get_mut(id) {
            Some(record) => {
                record.owner_uri = owner.to_string();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TrackerBackend for MemoryBackend {
    async fn next_serial(&self, cohort: &str) -> Result<u64, TrackerError> {
        let rows = self.rows();
        let range = RecordId::new(cohort, 0)..=RecordId::new(cohort, u64::MAX);
        let highest = rows.range(range).next_back().map(|(id, _)| id.serial);
        Ok(highest.map_or(1, |serial| serial + 1))
    }

    async fn insert(&self, record: &Record) -> Result<Inserted, TrackerError> {
        match self.rows().entry(record.id()) {
            Entry::Occupied(_) => Ok(Inserted::Conflict),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(Inserted::Created)
            }
        }
    }

    async fn update(
        &self,
        id: &RecordId,
        owner: &str,
        update: &Update,
        now: DateTime<Utc>,
    ) -> Result<UpdateOutcome, TrackerError> {
        let mut rows = self.rows();
        let Some(record) = rows.get_mut(id) else {
            return Ok(UpdateOutcome::default());
        };
        if record.owner_uri != owner || !update.admits(record.state) {
            return Ok(UpdateOutcome::default());
        }

        if let Some(state) = update.state {
            record.state = state;
        }
        update.fields.apply_to(record);
        record.updated_at = now;

        Ok(UpdateOutcome {
            affected: 1,
            record: Some(record.clone()),
        })
    }

    fn find(
        &self,
        owner: &str,
        states: &[State],
        range: Option<Range<DateTime<Utc>>>,
    ) -> BoxStream<'static, Result<Record, TrackerError>> {
        let mut matches: Vec<Record> = self
            .rows()
            .values()
            .filter(|r| r.owner_uri == owner && states.contains(&r.state))
            .filter(|r| range.as_ref().is_none_or(|range| range.contains(&r.start_time)))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.cohort.cmp(&b.cohort))
                .then_with(|| a.serial.cmp(&b.serial))
        });
        stream::iter(matches.into_iter().map(Ok)).boxed()
    }

    async fn count(&self, owner: &str, states: &[State]) -> Result<usize, TrackerError> {
        Ok(self
            .rows()
            .values()
            .filter(|r| r.owner_uri == owner && states.contains(&r.state))
            .count())
    }

    async fn get(&self, id: &RecordId) -> Result<Option<Record>, TrackerError> {
        Ok(self.rows().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::backend::Fields;
    use futures::TryStreamExt;
    use std::path::PathBuf;

    fn record(cohort: &str, serial: u64, owner: &str) -> Record {
        let now = Utc::now();
        Record::writing(
            RecordId::new(cohort, serial),
            now,
            PathBuf::from(format!("/tmp/{cohort}.{serial}")),
            owner,
            now,
        )
    }

    #[tokio::test]
    async fn test_next_serial_per_cohort() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.next_serial("a").await.unwrap(), 1);

        backend.insert(&record("a", 1, "n1")).await.unwrap();
        backend.insert(&record("a", 2, "n1")).await.unwrap();
        backend.insert(&record("b", 9, "n1")).await.unwrap();

        assert_eq!(backend.next_serial("a").await.unwrap(), 3);
        assert_eq!(backend.next_serial("b").await.unwrap(), 10);
        assert_eq!(backend.next_serial("ab").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.insert(&record("a", 1, "n1")).await.unwrap(),
            Inserted::Created
        );
        assert_eq!(
            backend.insert(&record("a", 1, "n2")).await.unwrap(),
            Inserted::Conflict
        );
        assert_eq!(backend.snapshot()[0].owner_uri, "n1");
    }

    #[tokio::test]
    async fn test_update_checks_owner_and_state() {
        let backend = MemoryBackend::new();
        let r = record("a", 1, "n1");
        backend.insert(&r).await.unwrap();

        let to_written = Update::transition(State::Written, Fields::default().byte_size(12));
        let foreign = backend.update(&r.id(), "n2", &to_written, Utc::now()).await.unwrap();
        assert_eq!(foreign.affected, 0);

        let ours = backend.update(&r.id(), "n1", &to_written, Utc::now()).await.unwrap();
        assert_eq!(ours.affected, 1);
        let updated = ours.record.unwrap();
        assert_eq!(updated.state, State::Written);
        assert_eq!(updated.byte_size, Some(12));

        // WRITTEN is not a legal predecessor of WRITTEN
        let again = backend.update(&r.id(), "n1", &to_written, Utc::now()).await.unwrap();
        assert_eq!(again.affected, 0);
    }

    #[tokio::test]
    async fn test_find_filters_and_orders() {
        let backend = MemoryBackend::new();
        backend.insert(&record("b", 1, "n1")).await.unwrap();
        backend.insert(&record("a", 2, "n1")).await.unwrap();
        backend.insert(&record("a", 1, "n1")).await.unwrap();
        backend.insert(&record("a", 3, "n2")).await.unwrap();

        let found: Vec<Record> = backend
            .find("n1", &[State::Writing], None)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|r| r.owner_uri == "n1"));

        assert_eq!(backend.count("n1", &[State::Writing]).await.unwrap(), 3);
        assert_eq!(backend.count("n1", &[State::Written]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reassign_moves_ownership() {
        let backend = MemoryBackend::new();
        let r = record("a", 1, "n1");
        backend.insert(&r).await.unwrap();
        assert!(backend.reassign(&r.id(), "n2"));
        assert_eq!(backend.get(&r.id()).await.unwrap().unwrap().owner_uri, "n2");
        assert!(!backend.reassign(&RecordId::new("zz", 1), "n2"));
    }
}

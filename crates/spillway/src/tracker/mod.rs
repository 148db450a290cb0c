//! Record tracker: the single chokepoint for record mutations.
//!
//! Every update is conditional on record identity, the tracker's owner URI,
//! and a legal current state. A conditional update that matches no row means
//! another node owns the record (or it already moved on) and is reported as
//! an affected count of zero. Matching more than one row means the store is
//! corrupt and is logged as a critical anomaly.
//!
//! State transitions that affect exactly one row are fanned out to
//! registered [`TransitionListener`]s, synchronously, in registration order.

mod backend;
mod memory;

pub use backend::{Fields, Inserted, TrackerBackend, Update, UpdateOutcome};
pub use memory::MemoryBackend;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

use spillway_core::emit;
use spillway_core::metrics::events::{
    AnomalyKind, RecordTransitioned, SerialConflict, TrackerAnomaly,
};

use crate::clock::ClockRef;
use crate::error::TrackerError;
use crate::record::{Record, RecordId, State};
use crate::rolling::PathPattern;

/// Attempts at allocating a serial before giving up.
pub const MAX_OPEN_ATTEMPTS: usize = 100;

/// Observer of successful state transitions.
///
/// Called on the task that performed the transition; implementations should
/// hand work off rather than block.
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, record: &Record);
}

/// Owner-scoped handle over a tracker backend.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    backend: Arc<dyn TrackerBackend>,
    owner_uri: String,
    clock: ClockRef,
    listeners: RwLock<Vec<Arc<dyn TransitionListener>>>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("owner_uri", &self.inner.owner_uri)
            .finish_non_exhaustive()
    }
}

impl Tracker {
    pub fn new(
        backend: Arc<dyn TrackerBackend>,
        owner_uri: impl Into<String>,
        clock: ClockRef,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                backend,
                owner_uri: owner_uri.into(),
                clock,
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn owner_uri(&self) -> &str {
        &self.inner.owner_uri
    }

    pub fn clock(&self) -> &ClockRef {
        &self.inner.clock
    }

    /// Create a new WRITING record for `cohort`, owned by this tracker.
    ///
    /// Serials are allocated as max+1 and retried on insert conflict, so
    /// concurrent openers on any node end up with distinct serials.
    pub async fn open(
        &self,
        cohort: &str,
        pattern: &PathPattern,
        start_time: DateTime<Utc>,
    ) -> Result<Record, TrackerError> {
        let backend = &self.inner.backend;
        for attempt in 1..=MAX_OPEN_ATTEMPTS {
            let serial = backend.next_serial(cohort).await?;
            let record = Record::writing(
                RecordId::new(cohort, serial),
                start_time,
                pattern.render(serial),
                self.inner.owner_uri.clone(),
                self.inner.clock.now(),
            );

            match backend.insert(&record).await? {
                Inserted::Created => {
                    debug!(record = %record.id(), path = %record.origin_path.display(), "Opened record");
                    emit!(RecordTransitioned {
                        state: State::Writing.as_str(),
                    });
                    return Ok(record);
                }
                Inserted::Conflict => {
                    emit!(SerialConflict);
                    debug!(cohort, serial, attempt, "Serial already taken, retrying");
                }
            }
        }

        Err(TrackerError::SerialContention {
            cohort: cohort.to_string(),
            attempts: MAX_OPEN_ATTEMPTS,
        })
    }

    /// Move `record` to `state`, applying `fields` in the same update.
    ///
    /// Returns the number of rows affected. Listeners are notified only when
    /// that number is exactly one.
    pub async fn transition(
        &self,
        record: &Record,
        state: State,
        fields: Fields,
    ) -> Result<usize, TrackerError> {
        let update = Update::transition(state, fields);
        let outcome = self.apply(record, &update, state.as_str()).await?;

        if outcome.affected == 1
            && let Some(updated) = outcome.record
        {
            emit!(RecordTransitioned {
                state: state.as_str(),
            });
            debug!(record = %updated.id(), from = %record.state, to = %state, "Record transitioned");
            self.notify(&updated);
        }
        Ok(outcome.affected)
    }

    pub async fn update_size(&self, record: &Record, size: u64) -> Result<usize, TrackerError> {
        self.update_fields(record, Fields::default().byte_size(size), "update_size")
            .await
    }

    pub async fn update_prepared_path(
        &self,
        record: &Record,
        path: &Path,
    ) -> Result<usize, TrackerError> {
        self.update_fields(
            record,
            Fields::default().prepared_path(path),
            "update_prepared_path",
        )
        .await
    }

    pub async fn update_archive_key(
        &self,
        record: &Record,
        key: &str,
    ) -> Result<usize, TrackerError> {
        self.update_fields(record, Fields::default().archive_key(key), "update_archive_key")
            .await
    }

    pub async fn update_archive_location(
        &self,
        record: &Record,
        uri: &str,
        group: Option<&str>,
    ) -> Result<usize, TrackerError> {
        self.update_fields(
            record,
            Fields::default().archive_location(uri, group.map(str::to_string)),
            "update_archive_location",
        )
        .await
    }

    async fn update_fields(
        &self,
        record: &Record,
        fields: Fields,
        operation: &'static str,
    ) -> Result<usize, TrackerError> {
        let outcome = self.apply(record, &Update::fields(fields), operation).await?;
        Ok(outcome.affected)
    }

    async fn apply(
        &self,
        record: &Record,
        update: &Update,
        operation: &'static str,
    ) -> Result<UpdateOutcome, TrackerError> {
        let id = record.id();
        let outcome = self
            .inner
            .backend
            .update(&id, &self.inner.owner_uri, update, self.inner.clock.now())
            .await?;

        match outcome.affected {
            1 => {}
            0 => {
                warn!(
                    record = %id,
                    owner = %self.inner.owner_uri,
                    operation,
                    "Conditional update matched nothing; record is owned elsewhere or already moved on"
                );
                emit!(TrackerAnomaly {
                    kind: AnomalyKind::NotOwned,
                });
            }
            n => {
                error!(
                    record = %id,
                    owner = %self.inner.owner_uri,
                    operation,
                    affected = n,
                    "Critical anomaly: conditional update matched multiple records"
                );
                emit!(TrackerAnomaly {
                    kind: AnomalyKind::Corruption,
                });
            }
        }
        Ok(outcome)
    }

    /// Stream this owner's records in any of `states`, optionally limited to
    /// buckets starting in `range`.
    pub fn find_mine(
        &self,
        states: &[State],
        range: Option<Range<DateTime<Utc>>>,
    ) -> BoxStream<'static, Result<Record, TrackerError>> {
        self.inner
            .backend
            .find(&self.inner.owner_uri, states, range)
    }

    pub async fn get_count(&self, states: &[State]) -> Result<usize, TrackerError> {
        self.inner
            .backend
            .count(&self.inner.owner_uri, states)
            .await
    }

    /// Current persisted copy of a record, whoever owns it.
    pub async fn get(&self, id: &RecordId) -> Result<Option<Record>, TrackerError> {
        self.inner.backend.get(id).await
    }

    /// Register a listener. Adding the same listener twice is a no-op.
    pub fn add_listener(&self, listener: Arc<dyn TransitionListener>) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TransitionListener>) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    fn notify(&self, record: &Record) {
        let listeners = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_transition(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use futures::TryStreamExt;
    use futures::stream;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recording {
        seen: Mutex<Vec<(RecordId, State)>>,
    }

    impl Recording {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<(RecordId, State)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl TransitionListener for Recording {
        fn on_transition(&self, record: &Record) {
            self.seen.lock().unwrap().push((record.id(), record.state));
        }
    }

    fn pattern() -> PathPattern {
        PathPattern::new("/tmp/spill/events-c.{serial}.log").unwrap()
    }

    fn tracker(backend: &MemoryBackend, owner: &str) -> Tracker {
        Tracker::new(Arc::new(backend.clone()), owner, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_open_allocates_increasing_serials() {
        let backend = MemoryBackend::new();
        let t = tracker(&backend, "node://a");
        let start = Utc::now();

        let first = t.open("c", &pattern(), start).await.unwrap();
        let second = t.open("c", &pattern(), start).await.unwrap();

        assert_eq!(first.serial, 1);
        assert_eq!(second.serial, 2);
        assert_eq!(first.state, State::Writing);
        assert_eq!(first.owner_uri, "node://a");
        assert_eq!(
            first.origin_path,
            std::path::PathBuf::from("/tmp/spill/events-c.1.log")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_open_yields_distinct_serials() {
        let backend = MemoryBackend::new();
        let nodes: Vec<Tracker> = (0..4)
            .map(|i| tracker(&backend, &format!("node://{i}")))
            .collect();

        let mut handles = Vec::new();
        for i in 0..40 {
            let t = nodes[i % nodes.len()].clone();
            handles.push(tokio::spawn(async move {
                t.open("c", &pattern(), Utc::now()).await.unwrap().serial
            }));
        }

        let mut serials = Vec::new();
        for handle in handles {
            serials.push(handle.await.unwrap());
        }
        serials.sort_unstable();
        assert_eq!(serials, (1..=40).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_transition_notifies_listeners_once() {
        let backend = MemoryBackend::new();
        let t = tracker(&backend, "node://a");
        let listener = Recording::new();
        let as_dyn: Arc<dyn TransitionListener> = listener.clone();
        assert!(t.add_listener(as_dyn.clone()));
        assert!(!t.add_listener(as_dyn.clone()));

        let record = t.open("c", &pattern(), Utc::now()).await.unwrap();
        let affected = t
            .transition(&record, State::Written, Fields::default().byte_size(3))
            .await
            .unwrap();

        assert_eq!(affected, 1);
        assert_eq!(listener.seen(), vec![(record.id(), State::Written)]);

        let stored = t.get(&record.id()).await.unwrap().unwrap();
        assert_eq!(stored.byte_size, Some(3));

        assert!(t.remove_listener(&as_dyn));
        assert!(!t.remove_listener(&as_dyn));
    }

    #[tokio::test]
    async fn test_foreign_owner_cannot_transition() {
        let backend = MemoryBackend::new();
        let a = tracker(&backend, "node://a");
        let b = tracker(&backend, "node://b");
        let listener = Recording::new();
        b.add_listener(listener.clone());

        let record = a.open("c", &pattern(), Utc::now()).await.unwrap();
        let affected = b
            .transition(&record, State::Written, Fields::default())
            .await
            .unwrap();

        assert_eq!(affected, 0);
        assert!(listener.seen().is_empty());
        let stored = a.get(&record.id()).await.unwrap().unwrap();
        assert_eq!(stored.state, State::Writing);
    }

    #[tokio::test]
    async fn test_illegal_transition_affects_nothing() {
        let backend = MemoryBackend::new();
        let t = tracker(&backend, "node://a");
        let record = t.open("c", &pattern(), Utc::now()).await.unwrap();

        let affected = t
            .transition(&record, State::Uploaded, Fields::default())
            .await
            .unwrap();
        assert_eq!(affected, 0);
    }

    #[tokio::test]
    async fn test_field_updates_do_not_notify() {
        let backend = MemoryBackend::new();
        let t = tracker(&backend, "node://a");
        let listener = Recording::new();
        t.add_listener(listener.clone());

        let record = t.open("c", &pattern(), Utc::now()).await.unwrap();
        assert_eq!(t.update_size(&record, 10).await.unwrap(), 1);
        assert_eq!(
            t.update_archive_location(&record, "s3://b/c/x", Some("tenant"))
                .await
                .unwrap(),
            1
        );
        assert!(listener.seen().is_empty());

        let stored = t.get(&record.id()).await.unwrap().unwrap();
        assert_eq!(stored.byte_size, Some(10));
        assert_eq!(stored.archive_uri.as_deref(), Some("s3://b/c/x"));
        assert_eq!(stored.archive_group.as_deref(), Some("tenant"));
    }

    #[tokio::test]
    async fn test_find_mine_and_count_scope_to_owner() {
        let backend = MemoryBackend::new();
        let a = tracker(&backend, "node://a");
        let b = tracker(&backend, "node://b");
        let start = DateTime::from_timestamp(1_577_847_600, 0).unwrap();

        a.open("c", &pattern(), start).await.unwrap();
        a.open("c", &pattern(), start + TimeDelta::hours(1)).await.unwrap();
        b.open("c", &pattern(), start).await.unwrap();

        assert_eq!(a.get_count(&[State::Writing]).await.unwrap(), 2);
        assert_eq!(b.get_count(&[State::Writing]).await.unwrap(), 1);

        let in_range: Vec<Record> = a
            .find_mine(&[State::Writing], Some(start..start + TimeDelta::minutes(30)))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].start_time, start);
    }

    #[tokio::test]
    async fn test_timestamps_follow_clock() {
        let backend = MemoryBackend::new();
        let start = DateTime::from_timestamp(1_577_847_600, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let t = Tracker::new(Arc::new(backend), "node://a", clock.clone());

        let record = t.open("c", &pattern(), start).await.unwrap();
        clock.advance(TimeDelta::seconds(42));
        t.transition(&record, State::Written, Fields::default())
            .await
            .unwrap();

        let stored = t.get(&record.id()).await.unwrap().unwrap();
        assert_eq!(stored.created_at, start);
        assert_eq!(stored.updated_at, start + TimeDelta::seconds(42));
    }

    /// Backend that claims every update touched two rows.
    struct Duplicated {
        inner: MemoryBackend,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl TrackerBackend for Duplicated {
        async fn next_serial(&self, cohort: &str) -> Result<u64, TrackerError> {
            self.inner.next_serial(cohort).await
        }

        async fn insert(&self, record: &Record) -> Result<Inserted, TrackerError> {
            self.inner.insert(record).await
        }

        async fn update(
            &self,
            _id: &RecordId,
            _owner: &str,
            _update: &Update,
            _now: DateTime<Utc>,
        ) -> Result<UpdateOutcome, TrackerError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateOutcome {
                affected: 2,
                record: None,
            })
        }

        fn find(
            &self,
            _owner: &str,
            _states: &[State],
            _range: Option<Range<DateTime<Utc>>>,
        ) -> BoxStream<'static, Result<Record, TrackerError>> {
            Box::pin(stream::empty())
        }

        async fn count(&self, _owner: &str, _states: &[State]) -> Result<usize, TrackerError> {
            Ok(0)
        }

        async fn get(&self, id: &RecordId) -> Result<Option<Record>, TrackerError> {
            self.inner.get(id).await
        }
    }

    #[tokio::test]
    async fn test_multi_row_update_is_reported_not_notified() {
        let backend = Arc::new(Duplicated {
            inner: MemoryBackend::new(),
            updates: AtomicUsize::new(0),
        });
        let t = Tracker::new(backend.clone(), "node://a", Arc::new(SystemClock));
        let listener = Recording::new();
        t.add_listener(listener.clone());

        let record = t.open("c", &pattern(), Utc::now()).await.unwrap();
        let affected = t
            .transition(&record, State::Written, Fields::default())
            .await
            .unwrap();

        assert_eq!(affected, 2);
        assert_eq!(backend.updates.load(Ordering::SeqCst), 1);
        assert!(listener.seen().is_empty());
    }

    /// Backend whose inserts always collide.
    struct AlwaysTaken(MemoryBackend);

    #[async_trait]
    impl TrackerBackend for AlwaysTaken {
        async fn next_serial(&self, _cohort: &str) -> Result<u64, TrackerError> {
            Ok(1)
        }

        async fn insert(&self, _record: &Record) -> Result<Inserted, TrackerError> {
            Ok(Inserted::Conflict)
        }

        async fn update(
            &self,
            id: &RecordId,
            owner: &str,
            update: &Update,
            now: DateTime<Utc>,
        ) -> Result<UpdateOutcome, TrackerError> {
            self.0.update(id, owner, update, now).await
        }

        fn find(
            &self,
            owner: &str,
            states: &[State],
            range: Option<Range<DateTime<Utc>>>,
        ) -> BoxStream<'static, Result<Record, TrackerError>> {
            self.0.find(owner, states, range)
        }

        async fn count(&self, owner: &str, states: &[State]) -> Result<usize, TrackerError> {
            self.0.count(owner, states).await
        }

        async fn get(&self, id: &RecordId) -> Result<Option<Record>, TrackerError> {
            self.0.get(id).await
        }
    }

    #[tokio::test]
    async fn test_open_gives_up_after_max_attempts() {
        let t = Tracker::new(
            Arc::new(AlwaysTaken(MemoryBackend::new())),
            "node://a",
            Arc::new(SystemClock),
        );
        let err = t.open("c", &pattern(), Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            TrackerError::SerialContention { attempts, .. } if attempts == MAX_OPEN_ATTEMPTS
        ));
    }
}

//! Ingest manager: routes items into time buckets and runs bucket writers.
//!
//! `record` is cheap and never blocks on IO. Each bucket has a FIFO queue and
//! one or more writer tasks. Periodic `prune` calls scale writers with queue
//! depth, rotate files once a bucket's close window passes, and drop state
//! for closed, drained buckets.
//!
//! The queue map and the worker map are guarded by separate locks and are
//! never held at the same time. The closed flag is set under the queue lock
//! and read under the worker lock, so no item or writer slips past shutdown.
//!
//! A writer that cannot allocate a serial halts ingest: `record` rejects
//! items from then on and [`IngestManager::halted`] resolves with the cause.

mod queue;
mod worker;

pub use queue::BucketQueue;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use spillway_core::emit;
use spillway_core::metrics::events::{
    FileClosed, FileOutcome, IngestQueueDepth, IngestWorkers, ItemsRecorded,
};

use crate::error::{IngestError, TrackerError};
use crate::record::State;
use crate::rolling::RollingScheme;
use crate::tracker::{Fields, Tracker};
use crate::workers::Serializer;
use worker::{Assignment, Halt, WorkerContext};

const SHUTDOWN_BACKOFF_START: Duration = Duration::from_millis(10);
const SHUTDOWN_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Tuning for bucket writers.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Idle time after which a writer flushes its file.
    pub flush_interval: Duration,
    /// Queue depth at which a bucket gets an additional writer.
    pub spawn_threshold: usize,
    pub max_workers_per_bucket: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            spawn_threshold: 10_000,
            max_workers_per_bucket: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

/// Per-request data handed to item extraction.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    pub fn new(received_at: DateTime<Utc>) -> Self {
        Self {
            request_id: None,
            received_at,
        }
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Snapshot of one bucket, for inspection and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketStatus {
    pub bucket: DateTime<Utc>,
    pub queued: usize,
    pub workers: usize,
    pub interrupted: usize,
}

/// What one prune pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Buckets whose queue and workers were dropped.
    pub closed: usize,
    /// Buckets past their close window that still had items.
    pub draining: usize,
    pub workers_started: usize,
}

/// Outcome of startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub written: usize,
    pub failed: usize,
}

struct WorkerHandle {
    interrupt: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Entry point for producers.
pub struct IngestManager<T> {
    inner: Arc<IngestInner<T>>,
}

impl<T> Clone for IngestManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct IngestInner<T> {
    scheme: RollingScheme,
    settings: IngestSettings,
    context: WorkerContext<T>,
    queues: Mutex<BTreeMap<DateTime<Utc>, Arc<BucketQueue<T>>>>,
    workers: Mutex<BTreeMap<DateTime<Utc>, Vec<WorkerHandle>>>,
    tasks: TaskTracker,
    closed: AtomicBool,
}

fn locked<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send + 'static> IngestManager<T> {
    pub fn new(
        scheme: RollingScheme,
        tracker: Tracker,
        serializer: Arc<dyn Serializer<T>>,
        settings: IngestSettings,
    ) -> Self {
        let context = WorkerContext {
            tracker,
            serializer,
            flush_interval: settings.flush_interval,
            halt: Arc::new(Halt::default()),
        };
        Self {
            inner: Arc::new(IngestInner {
                scheme,
                settings,
                context,
                queues: Mutex::new(BTreeMap::new()),
                workers: Mutex::new(BTreeMap::new()),
                tasks: TaskTracker::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn scheme(&self) -> &RollingScheme {
        &self.inner.scheme
    }

    /// Queue `item` in the bucket for `timestamp`. The first item of a bucket
    /// starts its writer.
    pub fn record(&self, timestamp: DateTime<Utc>, item: T) -> Result<(), IngestError> {
        let bucket = self.inner.scheme.bucket_start(timestamp);
        let created = {
            let mut queues = locked(&self.inner.queues);
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(IngestError::ShuttingDown);
            }
            if let Some(err) = self.inner.context.halt.error() {
                return Err(err);
            }
            let mut created = None;
            let queue = queues.entry(bucket).or_insert_with(|| {
                let queue = Arc::new(BucketQueue::new());
                created = Some(queue.clone());
                queue
            });
            queue.push(item);
            created
        };

        if let Some(queue) = created {
            debug!(bucket = %bucket, "New bucket");
            self.inner.launch_worker(bucket, queue, false);
        }
        emit!(ItemsRecorded { count: 1 });
        Ok(())
    }

    /// Build an item from request context and queue it by the request's
    /// receive time.
    pub fn record_with_context<F>(&self, ctx: &RequestContext, extract: F) -> Result<(), IngestError>
    where
        F: FnOnce(&RequestContext) -> T,
    {
        self.record(ctx.received_at, extract(ctx))
    }

    /// Rebalance writers and rotate buckets whose close window passed.
    ///
    /// Never awaits, so it can run from any scheduler tick.
    pub fn prune(&self) -> PruneReport {
        let inner = &self.inner;
        let now = inner.context.tracker.clock().now();
        let mut report = PruneReport::default();

        locked(&inner.workers).retain(|_, handles| {
            handles.retain(WorkerHandle::is_live);
            !handles.is_empty()
        });

        let snapshot: Vec<(DateTime<Utc>, Arc<BucketQueue<T>>)> = locked(&inner.queues)
            .iter()
            .map(|(bucket, queue)| (*bucket, queue.clone()))
            .collect();

        for (bucket, queue) in snapshot {
            if inner.scheme.is_time_to_close(bucket, now) {
                if queue.is_empty() && inner.remove_if_drained(bucket, &queue) {
                    report.closed += 1;
                    continue;
                }
                report.draining += 1;
                if inner.interrupt_bucket(bucket) == 0 {
                    // Nobody left to drain it: start a writer that drains and exits.
                    if inner.launch_worker(bucket, queue, true) {
                        report.workers_started += 1;
                    }
                }
                continue;
            }

            let depth = queue.len();
            if depth == 0 {
                continue;
            }
            let live = inner.live_workers(bucket);
            let wanted = live == 0
                || (depth >= inner.settings.spawn_threshold
                    && live < inner.settings.max_workers_per_bucket);
            if wanted {
                debug!(bucket = %bucket, depth, live, "Starting additional writer");
                if inner.launch_worker(bucket, queue, false) {
                    report.workers_started += 1;
                }
            }
        }

        inner.emit_gauges();
        if report.closed > 0 || report.draining > 0 {
            debug!(
                closed = report.closed,
                draining = report.draining,
                started = report.workers_started,
                "Prune pass"
            );
        }
        report
    }

    /// Close out records left in WRITING by a previous run of this owner.
    pub async fn recover(&self) -> Result<RecoveryReport, TrackerError> {
        let tracker = &self.inner.context.tracker;
        let mut report = RecoveryReport::default();
        let mut stale = tracker.find_mine(&[State::Writing], None);

        while let Some(record) = stale.try_next().await? {
            match tokio::fs::metadata(&record.origin_path).await {
                Ok(meta) => {
                    tracker.update_size(&record, meta.len()).await?;
                    if tracker
                        .transition(&record, State::Written, Fields::default())
                        .await?
                        == 1
                    {
                        emit!(FileClosed {
                            outcome: FileOutcome::Recovered,
                        });
                        report.written += 1;
                    }
                }
                Err(e) => {
                    warn!(record = %record.id(), error = %e, "Recovered record has no file");
                    if tracker
                        .transition(&record, State::WriteError, Fields::default())
                        .await?
                        == 1
                    {
                        emit!(FileClosed {
                            outcome: FileOutcome::WriteError,
                        });
                        report.failed += 1;
                    }
                }
            }
        }

        if report != RecoveryReport::default() {
            info!(
                written = report.written,
                failed = report.failed,
                "Recovered records from previous run"
            );
        }
        Ok(report)
    }

    /// Stop accepting items, wait for every queue to drain, then stop all
    /// writers and wait for them to close their files.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        {
            let _queues = locked(&inner.queues);
            inner.closed.store(true, Ordering::Release);
        }

        let mut backoff = SHUTDOWN_BACKOFF_START;
        loop {
            let pending = inner.queued();
            if pending == 0 {
                break;
            }
            if let Some(err) = inner.context.halt.error() {
                warn!(pending, error = %err, "Ingest halted; abandoning queued items");
                break;
            }
            inner.ensure_writers();
            debug!(pending, "Waiting for ingest queues to drain");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(SHUTDOWN_BACKOFF_MAX);
        }

        for handles in locked(&inner.workers).values() {
            for handle in handles {
                handle.interrupt.cancel();
            }
        }
        inner.tasks.close();
        inner.tasks.wait().await;
        inner.emit_gauges();
        info!("Ingest manager stopped");
    }

    pub fn buckets(&self) -> Vec<BucketStatus> {
        let inner = &self.inner;
        let queues: Vec<(DateTime<Utc>, usize)> = locked(&inner.queues)
            .iter()
            .map(|(bucket, queue)| (*bucket, queue.len()))
            .collect();
        let workers = locked(&inner.workers);

        queues
            .into_iter()
            .map(|(bucket, queued)| {
                let handles = workers.get(&bucket);
                let live = handles.into_iter().flatten().filter(|h| h.is_live());
                let (workers, interrupted) = live.fold((0, 0), |(w, i), h| {
                    (w + 1, i + usize::from(h.interrupt.is_cancelled()))
                });
                BucketStatus {
                    bucket,
                    queued,
                    workers,
                    interrupted,
                }
            })
            .collect()
    }

    /// Items waiting across all buckets.
    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    /// Resolves once a writer failed to allocate a record.
    pub async fn halted(&self) -> IngestError {
        self.inner.context.halt.wait().await
    }

    pub fn halt_error(&self) -> Option<IngestError> {
        self.inner.context.halt.error()
    }
}

impl<T: Send + 'static> IngestInner<T> {
    fn launch_worker(
        self: &Arc<Self>,
        bucket: DateTime<Utc>,
        queue: Arc<BucketQueue<T>>,
        interrupted: bool,
    ) -> bool {
        if self.context.halt.error().is_some() {
            return false;
        }
        let mut workers = locked(&self.workers);
        let interrupt = CancellationToken::new();
        if interrupted || self.closed.load(Ordering::Acquire) {
            interrupt.cancel();
        }
        let job = Assignment {
            bucket,
            cohort: self.scheme.representation(bucket),
            pattern: self.scheme.output_path_pattern(bucket),
            queue,
            interrupt: interrupt.clone(),
        };
        let handle = self.tasks.spawn(worker::run(self.context.clone(), job));
        workers
            .entry(bucket)
            .or_default()
            .push(WorkerHandle { interrupt, handle });
        true
    }

    fn live_workers(&self, bucket: DateTime<Utc>) -> usize {
        locked(&self.workers)
            .get(&bucket)
            .map_or(0, |handles| handles.iter().filter(|h| h.is_live()).count())
    }

    /// Interrupt every writer of `bucket`; returns how many were still running.
    fn interrupt_bucket(&self, bucket: DateTime<Utc>) -> usize {
        let workers = locked(&self.workers);
        let Some(handles) = workers.get(&bucket) else {
            return 0;
        };
        let mut live = 0;
        for handle in handles.iter().filter(|h| h.is_live()) {
            handle.interrupt.cancel();
            live += 1;
        }
        live
    }

    /// Drop a closed bucket if its queue is still the registered one and
    /// still empty.
    fn remove_if_drained(&self, bucket: DateTime<Utc>, queue: &Arc<BucketQueue<T>>) -> bool {
        {
            let mut queues = locked(&self.queues);
            match queues.get(&bucket) {
                Some(current) if Arc::ptr_eq(current, queue) && current.is_empty() => {
                    queues.remove(&bucket);
                }
                _ => return false,
            }
        }

        if let Some(handles) = locked(&self.workers).remove(&bucket) {
            for handle in &handles {
                handle.interrupt.cancel();
            }
        }
        debug!(bucket = %bucket, "Closed bucket");
        true
    }

    /// Start a writer for any non-empty queue that has none.
    fn ensure_writers(self: &Arc<Self>) {
        let snapshot: Vec<(DateTime<Utc>, Arc<BucketQueue<T>>)> = locked(&self.queues)
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(bucket, queue)| (*bucket, queue.clone()))
            .collect();
        for (bucket, queue) in snapshot {
            if self.live_workers(bucket) == 0 {
                self.launch_worker(bucket, queue, false);
            }
        }
    }

    fn queued(&self) -> usize {
        locked(&self.queues).values().map(|q| q.len()).sum()
    }

    fn emit_gauges(&self) {
        let (depth, buckets) = {
            let queues = locked(&self.queues);
            (queues.values().map(|q| q.len()).sum(), queues.len())
        };
        let workers = locked(&self.workers)
            .values()
            .flatten()
            .filter(|h| h.is_live())
            .count();
        emit!(IngestQueueDepth { depth, buckets });
        emit!(IngestWorkers { count: workers });
    }
}

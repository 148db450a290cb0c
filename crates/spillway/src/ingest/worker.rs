//! Bucket writer task.
//!
//! A worker opens a fresh tracker record, appends items from its bucket
//! queue as newline-terminated lines, and flushes whenever the queue has
//! been idle for one flush interval. When interrupted it drains what is
//! already queued, then closes its file as WRITTEN.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spillway_core::emit;
use spillway_core::metrics::events::{BytesWritten, FileClosed, FileOutcome};

use super::queue::BucketQueue;
use crate::error::{IngestError, TrackerError};
use crate::record::{Record, State};
use crate::rolling::PathPattern;
use crate::tracker::{Fields, Tracker};
use crate::workers::Serializer;

/// Unflushed items kept for requeue before forcing a flush.
const FLUSH_BATCH: usize = 1024;

/// Tripped once when a writer cannot allocate a record. Ingest stops
/// accepting items from then on.
#[derive(Default)]
pub(super) struct Halt {
    cause: OnceLock<Arc<TrackerError>>,
    token: CancellationToken,
}

impl Halt {
    /// Record the first cause and wake waiters. Later causes are ignored.
    pub fn trip(&self, cause: TrackerError) {
        if self.cause.set(Arc::new(cause)).is_ok() {
            self.token.cancel();
        }
    }

    pub fn error(&self) -> Option<IngestError> {
        self.cause
            .get()
            .map(|cause| IngestError::Halted {
                source: cause.clone(),
            })
    }

    pub async fn wait(&self) -> IngestError {
        loop {
            if let Some(err) = self.error() {
                return err;
            }
            self.token.cancelled().await;
        }
    }
}

/// Shared dependencies of every ingest worker.
pub(super) struct WorkerContext<T> {
    pub tracker: Tracker,
    pub serializer: Arc<dyn Serializer<T>>,
    pub flush_interval: Duration,
    pub halt: Arc<Halt>,
}

impl<T> Clone for WorkerContext<T> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            serializer: self.serializer.clone(),
            flush_interval: self.flush_interval,
            halt: self.halt.clone(),
        }
    }
}

/// What one worker is responsible for.
pub(super) struct Assignment<T> {
    pub bucket: DateTime<Utc>,
    pub cohort: String,
    pub pattern: PathPattern,
    pub queue: Arc<BucketQueue<T>>,
    pub interrupt: CancellationToken,
}

enum Exit {
    Interrupted,
    WriteFailed,
}

/// Open file plus the items written since the last successful flush.
///
/// Items are only dropped once flushed, so a failed write or flush hands
/// them back to the queue. Delivery is at-least-once: a partial write may
/// leave a duplicate line behind.
struct BucketFile<T> {
    path: PathBuf,
    out: BufWriter<File>,
    unflushed: Vec<T>,
}

impl<T> BucketFile<T> {
    async fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            unflushed: Vec::new(),
        })
    }

    async fn append(
        &mut self,
        serializer: &dyn Serializer<T>,
        item: T,
        queue: &BucketQueue<T>,
    ) -> io::Result<()> {
        let mut line = match serializer.serialize(&item) {
            Ok(line) => line,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Dropping item that cannot be serialized");
                return Ok(());
            }
        };
        line.push(b'\n');

        if let Err(e) = self.out.write_all(&line).await {
            self.requeue_unflushed(queue);
            queue.requeue(item);
            return Err(e);
        }
        self.unflushed.push(item);
        emit!(BytesWritten {
            bytes: line.len() as u64,
        });

        if self.unflushed.len() >= FLUSH_BATCH {
            self.flush(queue).await?;
        }
        Ok(())
    }

    async fn flush(&mut self, queue: &BucketQueue<T>) -> io::Result<()> {
        if let Err(e) = self.out.flush().await {
            self.requeue_unflushed(queue);
            return Err(e);
        }
        self.unflushed.clear();
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        !self.unflushed.is_empty()
    }

    fn requeue_unflushed(&mut self, queue: &BucketQueue<T>) {
        for item in self.unflushed.drain(..) {
            queue.requeue(item);
        }
    }
}

pub(super) async fn run<T: Send + 'static>(ctx: WorkerContext<T>, job: Assignment<T>) {
    let record = match ctx.tracker.open(&job.cohort, &job.pattern, job.bucket).await {
        Ok(record) => record,
        Err(e @ TrackerError::SerialContention { .. }) => {
            error!(cohort = %job.cohort, error = %e, "Serial allocation exhausted; halting ingest");
            ctx.halt.trip(e);
            return;
        }
        Err(e) => {
            error!(cohort = %job.cohort, error = %e, "Failed to open record; items stay queued");
            return;
        }
    };

    let mut file = match BucketFile::open(&record.origin_path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(
                record = %record.id(),
                path = %record.origin_path.display(),
                error = %e,
                "Failed to open bucket file"
            );
            close_failed(&ctx.tracker, &record).await;
            return;
        }
    };

    debug!(record = %record.id(), "Ingest worker started");
    let serializer = ctx.serializer.as_ref();

    let exit = loop {
        let next = tokio::select! {
            biased;
            _ = job.interrupt.cancelled() => None,
            item = job.queue.pop_timeout(ctx.flush_interval) => Some(item),
        };
        let Some(next) = next else {
            break Exit::Interrupted;
        };

        let written = match next {
            Some(item) => file.append(serializer, item, &job.queue).await,
            None if file.is_dirty() => file.flush(&job.queue).await,
            None => Ok(()),
        };
        if let Err(e) = written {
            warn!(record = %record.id(), error = %e, "Write failed; items returned to queue");
            break Exit::WriteFailed;
        }
    };

    if let Exit::Interrupted = exit {
        // Only what was queued at interrupt time; later arrivals go to another file.
        let pending = job.queue.len();
        for _ in 0..pending {
            let Some(item) = job.queue.try_pop() else {
                break;
            };
            if let Err(e) = file.append(serializer, item, &job.queue).await {
                warn!(record = %record.id(), error = %e, "Write failed while draining");
                break;
            }
        }
    }

    if let Err(e) = file.flush(&job.queue).await {
        warn!(record = %record.id(), error = %e, "Final flush failed; items returned to queue");
    }
    drop(file);

    close_written(&ctx.tracker, &record).await;
}

/// Record the file size and move the record to WRITTEN.
async fn close_written(tracker: &Tracker, record: &Record) {
    let size = match tokio::fs::metadata(&record.origin_path).await {
        Ok(meta) => meta.len(),
        Err(e) => {
            warn!(record = %record.id(), error = %e, "Could not stat closed bucket file");
            0
        }
    };

    let result = match tracker.update_size(record, size).await {
        Ok(_) => {
            tracker
                .transition(record, State::Written, Fields::default())
                .await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(1) => {
            emit!(FileClosed {
                outcome: FileOutcome::Written,
            });
            info!(record = %record.id(), bytes = size, "Closed bucket file");
        }
        Ok(_) => {}
        Err(e) => error!(record = %record.id(), error = %e, "Failed to mark record written"),
    }
}

async fn close_failed(tracker: &Tracker, record: &Record) {
    emit!(FileClosed {
        outcome: FileOutcome::WriteError,
    });
    if let Err(e) = tracker
        .transition(record, State::WriteError, Fields::default())
        .await
    {
        error!(record = %record.id(), error = %e, "Failed to mark record as write error");
    }
}

//! Stage manager: a bounded worker pool for one pipeline stage.
//!
//! Records reach a stage two ways. The fast path is a transition
//! notification: when a record enters the stage's predecessor state it is
//! dispatched to the pool immediately. The slow path is the periodic
//! retry-one-then-retry-all sweep, which picks up whatever the fast path
//! missed (failures, crashes, records recovered on startup).
//!
//! A claim set keeps the two paths from running the same record twice on
//! this node. Claims are released only after the worker finishes.

mod claims;

pub use claims::{ClaimGuard, ClaimSet};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use spillway_core::emit;
use spillway_core::metrics::events::{
    AttemptOutcome, StageAttempt, StageQueueDepth, SweepCompleted,
};

use crate::error::{StageError, TrackerError};
use crate::record::{Record, State};
use crate::tracker::{Tracker, TransitionListener};

/// The four states that define a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    /// State a record must reach to become eligible.
    pub predecessor: State,
    pub processing: State,
    pub success: State,
    pub error: State,
}

impl Stage {
    pub const PREPARE: Stage = Stage {
        name: "prepare",
        predecessor: State::Written,
        processing: State::Preparing,
        success: State::Prepared,
        error: State::PrepError,
    };

    pub const UPLOAD: Stage = Stage {
        name: "upload",
        predecessor: State::Prepared,
        processing: State::Uploading,
        success: State::Uploaded,
        error: State::UploadError,
    };

    /// States a sweep considers: abandoned, fresh, and failed records.
    pub fn retry_states(&self) -> [State; 3] {
        [self.processing, self.predecessor, self.error]
    }
}

/// Work done on one record by one stage.
///
/// Implementations move the record into the stage's processing state first
/// and treat zero affected rows as "not ours". They must leave the record in
/// the success or error state when they return.
#[async_trait]
pub trait StageWorker: Send + Sync + 'static {
    async fn process(&self, record: Record, tracker: &Tracker) -> Result<(), StageError>;
}

#[derive(Debug, Clone)]
pub struct StageSettings {
    /// Workers allowed to run at once.
    pub concurrency: usize,
    /// Records a sweep looks at.
    pub peek_window: usize,
    /// Queue depth at or above which the stage reports unhealthy.
    pub health_threshold: usize,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            peek_window: 50,
            health_threshold: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub healthy: bool,
    pub queue_depth: usize,
}

/// Result of one retry sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Nothing to retry.
    Idle,
    /// The trial record was already claimed here.
    Skipped,
    /// The trial record got claimed between selection and processing.
    Raced,
    /// The trial failed, so the rest were left alone.
    TrialFailed,
    /// The trial succeeded and this many more were queued.
    Dispatched(usize),
}

impl SweepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepOutcome::Idle => "idle",
            SweepOutcome::Skipped => "skipped",
            SweepOutcome::Raced => "raced",
            SweepOutcome::TrialFailed => "trial_failed",
            SweepOutcome::Dispatched(_) => "dispatched",
        }
    }
}

#[derive(Clone)]
pub struct StageManager {
    inner: Arc<StageInner>,
}

struct StageInner {
    stage: Stage,
    tracker: Tracker,
    worker: Arc<dyn StageWorker>,
    settings: StageSettings,
    pool: Semaphore,
    tasks: TaskTracker,
    claims: Arc<ClaimSet>,
    depth: AtomicUsize,
    listener: Arc<StageListener>,
}

/// Transition hook; weak so the tracker does not keep a stopped stage alive.
struct StageListener {
    inner: Weak<StageInner>,
}

impl TransitionListener for StageListener {
    fn on_transition(&self, record: &Record) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if record.state == inner.stage.predecessor {
            inner.dispatch(record.clone());
        }
    }
}

/// Counts a record in the stage queue until dropped, then releases its claim.
struct InFlight {
    inner: Arc<StageInner>,
    _claim: ClaimGuard,
}

impl InFlight {
    fn enter(inner: &Arc<StageInner>, claim: ClaimGuard) -> Self {
        inner.depth.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: inner.clone(),
            _claim: claim,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

impl StageManager {
    pub fn new(
        stage: Stage,
        tracker: Tracker,
        worker: Arc<dyn StageWorker>,
        settings: StageSettings,
    ) -> Self {
        let permits = settings.concurrency.max(1);
        let inner = Arc::new_cyclic(|weak| StageInner {
            stage,
            tracker,
            worker,
            settings,
            pool: Semaphore::new(permits),
            tasks: TaskTracker::new(),
            claims: Arc::new(ClaimSet::default()),
            depth: AtomicUsize::new(0),
            listener: Arc::new(StageListener {
                inner: weak.clone(),
            }),
        });
        Self { inner }
    }

    pub fn stage(&self) -> &Stage {
        &self.inner.stage
    }

    /// Listener to register with the tracker. Always the same instance.
    pub fn listener(&self) -> Arc<dyn TransitionListener> {
        self.inner.listener.clone()
    }

    pub fn claims(&self) -> &ClaimSet {
        &self.inner.claims
    }

    /// Queue `record` on the pool unless it is already claimed here.
    pub fn process_async(&self, record: Record) -> bool {
        self.inner.dispatch(record)
    }

    /// Run `record` on the pool and wait for it. `None` if it was already
    /// claimed or the stage is shut down, otherwise whether the worker
    /// succeeded.
    pub async fn process_sync(&self, record: Record) -> Option<bool> {
        if self.inner.tasks.is_closed() {
            return None;
        }
        let claim = self.inner.claims.try_claim(&record.id())?;
        let _in_flight = InFlight::enter(&self.inner, claim);
        Some(self.inner.run(record).await)
    }

    /// Retry one random eligible record; if it succeeds, queue the rest.
    ///
    /// A failing trial usually means a shared dependency (disk, remote store)
    /// is down, so the remaining records are not thrown at it.
    pub async fn retry_one_then_retry_all(&self) -> Result<SweepOutcome, TrackerError> {
        let inner = &self.inner;
        if inner.tasks.is_closed() {
            return Ok(SweepOutcome::Idle);
        }

        let mut candidates: Vec<Record> = inner
            .tracker
            .find_mine(&inner.stage.retry_states(), None)
            .take(inner.settings.peek_window)
            .try_collect()
            .await?;

        let outcome = if candidates.is_empty() {
            SweepOutcome::Idle
        } else {
            let trial = candidates.swap_remove(rand::rng().random_range(0..candidates.len()));
            if inner.claims.is_claimed(&trial.id()) {
                trace!(stage = inner.stage.name, record = %trial.id(), "Trial record already claimed");
                SweepOutcome::Skipped
            } else {
                match self.process_sync(trial).await {
                    None => SweepOutcome::Raced,
                    Some(false) => SweepOutcome::TrialFailed,
                    Some(true) => {
                        let queued = candidates
                            .into_iter()
                            .filter(|record| inner.dispatch(record.clone()))
                            .count();
                        SweepOutcome::Dispatched(queued)
                    }
                }
            }
        };

        let dispatched = match outcome {
            SweepOutcome::Dispatched(n) => n,
            _ => 0,
        };
        emit!(SweepCompleted {
            stage: inner.stage.name,
            outcome: outcome.as_str(),
            dispatched,
        });
        if dispatched > 0 {
            info!(stage = inner.stage.name, dispatched, "Retry sweep queued records");
        } else {
            debug!(stage = inner.stage.name, outcome = outcome.as_str(), "Retry sweep finished");
        }
        Ok(outcome)
    }

    /// Records queued or running on this stage.
    pub fn queue_depth(&self) -> usize {
        self.inner.depth.load(Ordering::Acquire)
    }

    pub fn health(&self) -> Health {
        let queue_depth = self.queue_depth();
        Health {
            healthy: queue_depth < self.inner.settings.health_threshold,
            queue_depth,
        }
    }

    /// Publish queue depth and health as gauges.
    pub fn report_health(&self) -> Health {
        let health = self.health();
        emit!(StageQueueDepth {
            stage: self.inner.stage.name,
            depth: health.queue_depth,
            healthy: health.healthy,
        });
        if !health.healthy {
            warn!(
                stage = self.inner.stage.name,
                depth = health.queue_depth,
                threshold = self.inner.settings.health_threshold,
                "Stage queue above health threshold"
            );
        }
        health
    }

    /// Stop taking new work and wait for queued and running records.
    pub async fn shutdown(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!(stage = self.inner.stage.name, "Stage stopped");
    }
}

impl StageInner {
    fn dispatch(self: &Arc<Self>, record: Record) -> bool {
        if self.tasks.is_closed() {
            debug!(stage = self.stage.name, record = %record.id(), "Stage stopped; not dispatching");
            return false;
        }
        let Some(claim) = self.claims.try_claim(&record.id()) else {
            trace!(stage = self.stage.name, record = %record.id(), "Already claimed");
            return false;
        };

        let in_flight = InFlight::enter(self, claim);
        let inner = self.clone();
        self.tasks.spawn(async move {
            let _in_flight = in_flight;
            inner.run(record).await;
        });
        true
    }

    async fn run(&self, record: Record) -> bool {
        let Ok(_permit) = self.pool.acquire().await else {
            return false;
        };

        let id = record.id();
        let started = Instant::now();
        let result = self.worker.process(record, &self.tracker).await;
        emit!(StageAttempt {
            stage: self.stage.name,
            outcome: if result.is_ok() {
                AttemptOutcome::Success
            } else {
                AttemptOutcome::Failure
            },
            duration: started.elapsed(),
        });

        match result {
            Ok(()) => {
                debug!(stage = self.stage.name, record = %id, "Stage complete");
                true
            }
            Err(e) if e.is_not_owned() => {
                debug!(stage = self.stage.name, record = %id, "Record not ours, skipping");
                false
            }
            Err(e) => {
                warn!(stage = self.stage.name, record = %id, error = %e, "Stage attempt failed");
                false
            }
        }
    }
}

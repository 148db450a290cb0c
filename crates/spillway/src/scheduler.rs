//! Periodic job runner.
//!
//! Each job gets its own task and interval. A job's next run starts only
//! after the previous run returned; ticks missed while it was running are
//! skipped, so runs of one job never overlap.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use spillway_core::emit;
use spillway_core::metrics::events::JobFailed;

#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    shutdown: CancellationToken,
    tasks: TaskTracker,
    jobs: Mutex<HashSet<&'static str>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `interval`, starting now.
    ///
    /// Returns false if a job with this name is already scheduled or the
    /// scheduler is shut down. Failures are logged and counted; the job keeps
    /// its schedule.
    pub fn schedule<F, Fut, E>(&self, name: &'static str, interval: Duration, mut job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }
        if !self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name)
        {
            warn!(job = name, "Job already scheduled");
            return false;
        }

        let shutdown = self.inner.shutdown.clone();
        self.inner.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = job().await {
                    warn!(job = name, error = %e, "Scheduled job failed");
                    emit!(JobFailed { job: name });
                }
            }
            debug!(job = name, "Job stopped");
        });
        debug!(job = name, ?interval, "Job scheduled");
        true
    }

    /// Stop every job and wait for in-progress runs to return.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_job_runs_on_interval() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        assert!(scheduler.schedule("count", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        }));

        tokio::time::sleep(Duration::from_secs(35)).await;
        scheduler.shutdown().await;
        // t = 0, 10, 20, 30
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_keep_the_schedule() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        scheduler.schedule("flaky", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            }
        });

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        scheduler.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_job_never_overlaps() {
        let scheduler = Scheduler::new();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (r, m) = (running.clone(), max_seen.clone());
        scheduler.schedule("slow", Duration::from_secs(1), move || {
            let (r, m) = (r.clone(), m.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), String>(())
            }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.shutdown().await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_names_and_post_shutdown_rejected() {
        let scheduler = Scheduler::new();
        let noop = || async { Ok::<(), String>(()) };
        assert!(scheduler.schedule("job", Duration::from_secs(60), noop));
        assert!(!scheduler.schedule("job", Duration::from_secs(60), noop));

        scheduler.shutdown().await;
        assert!(!scheduler.schedule("other", Duration::from_secs(60), noop));
    }
}

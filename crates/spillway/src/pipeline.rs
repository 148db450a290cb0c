//! Wires ingest, stages, tracker and scheduler into one running pipeline.
//!
//! Start order: transition listeners, recovery of this owner's WRITING
//! records, then periodic jobs. Shutdown order: ingest (drain and close
//! files), prepare and upload pools, then the scheduler.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use spillway_core::StorageProvider;

use crate::config::Config;
use crate::error::PipelineError;
use crate::ingest::{IngestManager, RecoveryReport};
use crate::scheduler::Scheduler;
use crate::stage::{Health, Stage, StageManager};
use crate::tracker::Tracker;
use crate::workers::{PrepareWorker, Serializer, StorageClient, UploadWorker};

const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHealth {
    pub healthy: bool,
    /// Ingest stopped after failing to allocate a record.
    pub ingest_halted: bool,
    pub prepare: Health,
    pub upload: Health,
}

#[derive(Debug, Clone, Copy)]
struct Intervals {
    prune: Duration,
    prepare_retry: Duration,
    upload_retry: Duration,
}

pub struct Pipeline<T> {
    tracker: Tracker,
    ingest: IngestManager<T>,
    prepare: StageManager,
    upload: StageManager,
    scheduler: Scheduler,
    intervals: Intervals,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            tracker: self.tracker.clone(),
            ingest: self.ingest.clone(),
            prepare: self.prepare.clone(),
            upload: self.upload.clone(),
            scheduler: self.scheduler.clone(),
            intervals: self.intervals,
        }
    }
}

impl<T: Send + 'static> Pipeline<T> {
    /// Assemble a pipeline over an existing storage client.
    pub fn new(
        config: &Config,
        tracker: Tracker,
        storage: Arc<dyn StorageClient>,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        let ingest = IngestManager::new(
            config.rolling_scheme(),
            tracker.clone(),
            serializer,
            config.ingest_settings(),
        );
        let prepare = StageManager::new(
            Stage::PREPARE,
            tracker.clone(),
            Arc::new(PrepareWorker::new(config.prepare.transform)),
            config.prepare.pool.stage_settings(),
        );
        let upload = StageManager::new(
            Stage::UPLOAD,
            tracker.clone(),
            Arc::new(UploadWorker::new(storage, config.upload.group.clone())),
            config.upload.pool.stage_settings(),
        );

        Self {
            tracker,
            ingest,
            prepare,
            upload,
            scheduler: Scheduler::new(),
            intervals: Intervals {
                prune: Duration::from_secs(config.ingest.prune_interval_secs),
                prepare_retry: config.prepare.pool.retry_interval(),
                upload_retry: config.upload.pool.retry_interval(),
            },
        }
    }

    /// Assemble a pipeline uploading to the configured destination.
    pub async fn from_config(
        config: &Config,
        tracker: Tracker,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Result<Self, PipelineError> {
        let storage = StorageProvider::for_url_with_options(
            &config.upload.destination,
            config.upload.storage_options.clone(),
        )
        .await?;
        Ok(Self::new(config, tracker, Arc::new(storage), serializer))
    }

    pub fn ingest(&self) -> &IngestManager<T> {
        &self.ingest
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn prepare(&self) -> &StageManager {
        &self.prepare
    }

    pub fn upload(&self) -> &StageManager {
        &self.upload
    }

    pub async fn start(&self) -> Result<RecoveryReport, PipelineError> {
        self.tracker.add_listener(self.prepare.listener());
        self.tracker.add_listener(self.upload.listener());

        let recovered = self.ingest.recover().await?;

        let ingest = self.ingest.clone();
        self.scheduler
            .schedule("ingest-prune", self.intervals.prune, move || {
                ingest.prune();
                async { Ok::<(), Infallible>(()) }
            });

        for (name, stage, interval) in [
            ("prepare-retry", &self.prepare, self.intervals.prepare_retry),
            ("upload-retry", &self.upload, self.intervals.upload_retry),
        ] {
            let stage = stage.clone();
            self.scheduler.schedule(name, interval, move || {
                let stage = stage.clone();
                async move { stage.retry_one_then_retry_all().await.map(|_| ()) }
            });
        }

        let (prepare, upload) = (self.prepare.clone(), self.upload.clone());
        self.scheduler
            .schedule("health-report", HEALTH_REPORT_INTERVAL, move || {
                prepare.report_health();
                upload.report_health();
                async { Ok::<(), Infallible>(()) }
            });

        info!(owner = %self.tracker.owner_uri(), "Pipeline started");
        Ok(recovered)
    }

    pub fn health(&self) -> PipelineHealth {
        let prepare = self.prepare.health();
        let upload = self.upload.health();
        let ingest_halted = self.ingest.halt_error().is_some();
        PipelineHealth {
            healthy: !ingest_halted && prepare.healthy && upload.healthy,
            ingest_halted,
            prepare,
            upload,
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.ingest.shutdown().await;
        self.prepare.shutdown().await;
        self.upload.shutdown().await;
        self.scheduler.shutdown().await;
        self.tracker.remove_listener(&self.prepare.listener());
        self.tracker.remove_listener(&self.upload.listener());
        info!("Pipeline stopped");
    }
}

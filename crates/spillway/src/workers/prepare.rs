//! PREPARE stage worker.

use async_trait::async_trait;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use super::Transform;
use crate::error::{FileIoSnafu, NotOwnedSnafu, StageError, TaskJoinSnafu};
use crate::record::{Record, State};
use crate::stage::StageWorker;
use crate::tracker::{Fields, Tracker};

/// Runs the configured transform over a WRITTEN file.
#[derive(Debug, Clone, Copy)]
pub struct PrepareWorker {
    transform: Transform,
}

impl PrepareWorker {
    pub fn new(transform: Transform) -> Self {
        Self { transform }
    }

    /// Produce the artifact and register it. Returns the origin file to
    /// delete once the record is PREPARED.
    async fn prepare(
        &self,
        record: &Record,
        tracker: &Tracker,
    ) -> Result<Option<PathBuf>, StageError> {
        let src = record.origin_path.clone();
        let dst = self.transform.output_path(&src);
        let transform = self.transform;

        if transform.extension().is_some() && artifact_outlived_origin(&src, &dst).await {
            debug!(record = %record.id(), artifact = %dst.display(), "Resuming from existing artifact");
        } else {
            let (src_for_task, dst_for_task) = (src.clone(), dst.clone());
            let size =
                tokio::task::spawn_blocking(move || transform.apply(&src_for_task, &dst_for_task))
                    .await
                    .context(TaskJoinSnafu)?
                    .context(FileIoSnafu {
                        path: src.display().to_string(),
                    })?;
            debug!(record = %record.id(), artifact = %dst.display(), bytes = size, "Prepared file");
        }

        tracker.update_prepared_path(record, &dst).await?;
        tracker
            .update_archive_key(record, &self.transform.descriptor())
            .await?;

        Ok(transform.extension().map(|_| src))
    }
}

/// True when a previous attempt finished the artifact and removed the origin.
///
/// Artifacts are renamed into place only when complete, so an artifact
/// without its origin is whole.
async fn artifact_outlived_origin(src: &Path, dst: &Path) -> bool {
    let origin_gone = matches!(tokio::fs::try_exists(src).await, Ok(false));
    origin_gone && matches!(tokio::fs::try_exists(dst).await, Ok(true))
}

/// The origin is redundant once the artifact exists; keep it if removal fails.
async fn remove_origin(path: PathBuf) {
    if let Err(e) = tokio::fs::remove_file(&path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %e, "Could not remove origin file");
    }
}

#[async_trait]
impl StageWorker for PrepareWorker {
    async fn process(&self, record: Record, tracker: &Tracker) -> Result<(), StageError> {
        if tracker
            .transition(&record, State::Preparing, Fields::default())
            .await?
            != 1
        {
            return NotOwnedSnafu { id: record.id() }.fail();
        }

        match self.prepare(&record, tracker).await {
            Ok(origin) => {
                let moved = tracker
                    .transition(&record, State::Prepared, Fields::default())
                    .await?;
                if moved == 1
                    && let Some(origin) = origin
                {
                    remove_origin(origin).await;
                }
                Ok(())
            }
            Err(e) => {
                if let Err(mark) = tracker
                    .transition(&record, State::PrepError, Fields::default())
                    .await
                {
                    error!(record = %record.id(), error = %mark, "Failed to mark prepare error");
                }
                Err(e)
            }
        }
    }
}

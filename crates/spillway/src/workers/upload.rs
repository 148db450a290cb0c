//! UPLOAD stage worker and the remote storage seam it writes through.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use spillway_core::StorageProvider;

use crate::error::{NotOwnedSnafu, StageError, StorageError, WorkerSnafu};
use crate::record::{Record, State};
use crate::stage::StageWorker;
use crate::tracker::{Fields, Tracker};

/// Remote object storage, addressed by fully qualified URIs.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// URI under which `key` is stored.
    fn uri_for(&self, key: &str) -> String;

    async fn put(&self, uri: &str, local: &Path) -> Result<(), StorageError>;

    async fn get(&self, uri: &str, local: &Path) -> Result<(), StorageError>;
}

#[async_trait]
impl StorageClient for StorageProvider {
    fn uri_for(&self, key: &str) -> String {
        self.uri(key)
    }

    async fn put(&self, uri: &str, local: &Path) -> Result<(), StorageError> {
        let key = self.key_for_uri(uri)?;
        self.put_file(key, local).await
    }

    async fn get(&self, uri: &str, local: &Path) -> Result<(), StorageError> {
        let key = self.key_for_uri(uri)?;
        self.get_file(key, local).await
    }
}

/// Copies PREPARED artifacts to remote storage under `{cohort}/{file name}`.
pub struct UploadWorker {
    storage: Arc<dyn StorageClient>,
    group: Option<String>,
}

impl UploadWorker {
    pub fn new(storage: Arc<dyn StorageClient>, group: Option<String>) -> Self {
        Self { storage, group }
    }

    async fn upload(&self, record: &Record, tracker: &Tracker) -> Result<String, StageError> {
        let local = record.payload_path();
        let Some(name) = local.file_name() else {
            return WorkerSnafu {
                message: format!("artifact path {} has no file name", local.display()),
            }
            .fail();
        };
        let uri = self
            .storage
            .uri_for(&format!("{}/{}", record.cohort, name.to_string_lossy()));

        self.storage
            .put(&uri, local)
            .await
            .map_err(|source| StageError::Storage { source })?;
        tracker
            .update_archive_location(record, &uri, self.group.as_deref())
            .await?;
        Ok(uri)
    }
}

#[async_trait]
impl StageWorker for UploadWorker {
    async fn process(&self, record: Record, tracker: &Tracker) -> Result<(), StageError> {
        if tracker
            .transition(&record, State::Uploading, Fields::default())
            .await?
            != 1
        {
            return NotOwnedSnafu { id: record.id() }.fail();
        }

        match self.upload(&record, tracker).await {
            Ok(uri) => {
                tracker
                    .transition(&record, State::Uploaded, Fields::default())
                    .await?;
                info!(record = %record.id(), %uri, "Uploaded");
                Ok(())
            }
            Err(e) => {
                if let Err(mark) = tracker
                    .transition(&record, State::UploadError, Fields::default())
                    .await
                {
                    error!(record = %record.id(), error = %mark, "Failed to mark upload error");
                }
                Err(e)
            }
        }
    }
}

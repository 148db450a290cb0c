//! Object storage abstraction.
//!
//! Wraps an `object_store` backend rooted at a URL. Supported roots:
//! - `memory://` - in-process store, useful for tests
//! - `file:///abs/dir` or a bare path - local filesystem
//! - `s3://`, `gs://`, `az://`, `abfss://`, `https://` - cloud stores,
//!   configured through `storage_options` (credentials, region, ...)
//!
//! Objects are addressed by keys relative to the root; `uri(key)` gives the
//! fully qualified location recorded as an archive URI.

use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use url::Url;

use crate::emit;
use crate::error::{InvalidUrlSnafu, LocalIoSnafu, ObjectStoreSnafu, StorageError};
use crate::metrics::events::{StorageOperation, StorageRequest};

/// Storage provider rooted at a single URL.
#[derive(Clone)]
pub struct StorageProvider {
    object_store: Arc<dyn ObjectStore>,
    /// Key prefix inside the store that corresponds to the root URL.
    prefix: Path,
    canonical_url: String,
}

impl std::fmt::Debug for StorageProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

impl StorageProvider {
    /// Create a storage provider for the given URL with storage options.
    pub async fn for_url_with_options(
        url: &str,
        options: HashMap<String, String>,
    ) -> Result<Self, StorageError> {
        let url = url.trim_end_matches('/');

        if url == "memory:" || url == "memory://" || url.starts_with("memory://") {
            return Ok(Self {
                object_store: Arc::new(InMemory::new()),
                prefix: Path::from(url.trim_start_matches("memory:").trim_start_matches('/')),
                canonical_url: url.to_string(),
            });
        }

        if !url.contains("://") || url.starts_with("file://") {
            return Self::construct_local(url.trim_start_matches("file://")).await;
        }

        let parsed = Url::parse(url).map_err(|e| StorageError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let (store, prefix) =
            object_store::parse_url_opts(&parsed, options).context(ObjectStoreSnafu)?;

        Ok(Self {
            object_store: Arc::from(store),
            prefix,
            canonical_url: url.to_string(),
        })
    }

    async fn construct_local(dir: &str) -> Result<Self, StorageError> {
        ensure!(
            !dir.is_empty(),
            InvalidUrlSnafu {
                url: dir,
                message: "empty local path",
            }
        );
        tokio::fs::create_dir_all(dir)
            .await
            .context(LocalIoSnafu { path: dir })?;

        let store = LocalFileSystem::new_with_prefix(dir).context(ObjectStoreSnafu)?;

        Ok(Self {
            object_store: Arc::new(store),
            prefix: Path::default(),
            canonical_url: format!("file://{dir}"),
        })
    }

    /// Fully qualified URI for a key relative to the root.
    pub fn uri(&self, key: &str) -> String {
        format!("{}/{}", self.canonical_url, key.trim_start_matches('/'))
    }

    /// Key relative to the root for a URI previously produced by `uri`.
    pub fn key_for_uri<'a>(&self, uri: &'a str) -> Result<&'a str, StorageError> {
        uri.strip_prefix(self.canonical_url.as_str())
            .map(|rest| rest.trim_start_matches('/'))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| StorageError::OutsideRoot {
                url: uri.to_string(),
                root: self.canonical_url.clone(),
            })
    }

    fn qualify(&self, key: &str) -> Path {
        let key = Path::from(key);
        if self.prefix.as_ref().is_empty() {
            key
        } else {
            self.prefix.parts().chain(key.parts()).collect()
        }
    }

    /// Upload bytes under `key`, overwriting any previous object.
    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.qualify(key);
        let start = Instant::now();
        let result = self.object_store.put(&path, PutPayload::from(bytes)).await;

        emit!(StorageRequest {
            operation: StorageOperation::Put,
            success: result.is_ok(),
            duration: start.elapsed(),
        });
        result.context(ObjectStoreSnafu)?;
        debug!(%path, "Stored object");
        Ok(())
    }

    /// Fetch the object stored under `key`.
    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.qualify(key);
        let start = Instant::now();
        let result = match self.object_store.get(&path).await {
            Ok(response) => response.bytes().await,
            Err(e) => Err(e),
        };

        emit!(StorageRequest {
            operation: StorageOperation::Get,
            success: result.is_ok(),
            duration: start.elapsed(),
        });
        result.context(ObjectStoreSnafu)
    }

    /// Upload a local file under `key`.
    pub async fn put_file(&self, key: &str, local: &std::path::Path) -> Result<(), StorageError> {
        let data = tokio::fs::read(local).await.context(LocalIoSnafu {
            path: local.display().to_string(),
        })?;
        self.put_bytes(key, Bytes::from(data)).await
    }

    /// Download `key` into a local file, creating parent directories.
    pub async fn get_file(&self, key: &str, local: &std::path::Path) -> Result<(), StorageError> {
        let data = self.get_bytes(key).await?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(LocalIoSnafu {
                    path: parent.display().to_string(),
                })?;
        }
        tokio::fs::write(local, &data).await.context(LocalIoSnafu {
            path: local.display().to_string(),
        })
    }
}

//! Application state and the crash-only startup sequence.
//!
//! The same construction path runs on first boot and after a crash: open
//! the metadata engine (WAL recovery is implicit), seed credentials,
//! build the storage backend (which sweeps its temp area), reap expired
//! multipart uploads and prime the gauges. Only then does the server
//! accept requests.

use std::sync::Arc;

use log::{info, warn};

use crate::config::{AppConfig, StorageBackendKind};
use crate::errors::S3Error;
use crate::metadata::sqlite_store::SqliteMetadataStore;
use crate::metadata::{CredentialRecord, MetadataStore};
use crate::metrics::Metrics;
use crate::s3::auth::{derive_owner_id, Authenticator};
use crate::storage::aws_store::AwsStorageBackend;
use crate::storage::azure_store::AzureStorageBackend;
use crate::storage::gcp_store::GcpStorageBackend;
use crate::storage::local_store::LocalStorageBackend;
use crate::storage::memory_store::MemoryStorageBackend;
use crate::storage::sqlite_store::SqliteStorageBackend;
use crate::storage::StorageBackend;

/// Shared, immutable-after-startup state handed to every handler.
pub struct AppState {
    pub config: AppConfig,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: Arc<dyn StorageBackend>,
    pub authenticator: Authenticator,
    pub metrics: Metrics,
}

impl AppState {
    /// Run the startup sequence against the given configuration.
    pub async fn from_config(config: AppConfig) -> Result<Self, S3Error> {
        let metadata: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::open(
            std::path::Path::new(&config.metadata.sqlite.path),
        )?);

        if !config.auth.access_key.is_empty() {
            metadata.seed_credential(&CredentialRecord {
                access_key_id: config.auth.access_key.clone(),
                secret_key: config.auth.secret_key.clone(),
                owner_id: derive_owner_id(&config.auth.access_key),
                active: true,
            })?;
        }

        let storage = build_storage(&config).await?;

        // Reap uploads whose TTL lapsed while the process was down, and
        // release their staged parts.
        let expired = metadata.reap_expired_uploads(config.multipart.upload_expiry_seconds)?;
        for upload in &expired {
            if let Err(e) = storage
                .delete_parts(&upload.bucket, &upload.key, &upload.upload_id)
                .await
            {
                warn!(
                    "failed to release parts of expired upload {}: {}",
                    upload.upload_id, e
                );
            }
        }

        let metrics = Metrics::new(config.observability.metrics);
        metrics.prime(metadata.count_buckets()?, metadata.count_objects()?);

        let authenticator = Authenticator::new(
            &config.server.region,
            config.auth.enabled,
            &config.auth.access_key,
        );

        info!(
            "state ready: {} backend, metadata at {}",
            backend_name(config.storage.backend),
            config.metadata.sqlite.path
        );
        Ok(AppState {
            config,
            metadata,
            storage,
            authenticator,
            metrics,
        })
    }

    /// In-memory state for tests: memory storage, in-memory metadata,
    /// authentication disabled.
    pub fn new_for_testing() -> Self {
        let mut config = AppConfig::default();
        config.auth.enabled = false;
        config.storage.backend = StorageBackendKind::Memory;
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteMetadataStore::from_connection(
                rusqlite::Connection::open_in_memory().expect("in-memory sqlite"),
            )
            .expect("in-memory schema"),
        );
        let authenticator = Authenticator::new(
            &config.server.region,
            config.auth.enabled,
            &config.auth.access_key,
        );
        AppState {
            metrics: Metrics::new(config.observability.metrics),
            metadata,
            storage: Arc::new(MemoryStorageBackend::new()),
            authenticator,
            config,
        }
    }
}

fn backend_name(kind: StorageBackendKind) -> &'static str {
    match kind {
        StorageBackendKind::Local => "local",
        StorageBackendKind::Memory => "memory",
        StorageBackendKind::Sqlite => "sqlite",
        StorageBackendKind::Aws => "aws",
        StorageBackendKind::Gcp => "gcp",
        StorageBackendKind::Azure => "azure",
    }
}

async fn build_storage(config: &AppConfig) -> Result<Arc<dyn StorageBackend>, S3Error> {
    Ok(match config.storage.backend {
        StorageBackendKind::Local => {
            Arc::new(LocalStorageBackend::new(&config.storage.local.root)?)
        }
        StorageBackendKind::Memory => Arc::new(MemoryStorageBackend::new()),
        StorageBackendKind::Sqlite => Arc::new(SqliteStorageBackend::open(
            std::path::Path::new(&config.storage.sqlite.path),
        )?),
        StorageBackendKind::Aws => Arc::new(AwsStorageBackend::new(&config.storage.aws).await?),
        StorageBackendKind::Gcp => Arc::new(GcpStorageBackend::new(&config.storage.gcp)?),
        StorageBackendKind::Azure => Arc::new(AzureStorageBackend::new(&config.storage.azure)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::UploadRecord;
    use std::collections::HashMap;

    #[actix_web::test]
    async fn test_startup_reaps_expired_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.metadata.sqlite.path = dir
            .path()
            .join("meta.sqlite")
            .to_string_lossy()
            .into_owned();
        config.storage.backend = StorageBackendKind::Memory;

        // Plant an expired upload before the server "starts".
        {
            let store = SqliteMetadataStore::open(std::path::Path::new(
                &config.metadata.sqlite.path,
            ))
            .unwrap();
            store
                .create_upload(&UploadRecord {
                    upload_id: "stale".to_string(),
                    bucket: "b".to_string(),
                    key: "k".to_string(),
                    initiated: "2020-01-01T00:00:00.000Z".to_string(),
                    content_type: "application/octet-stream".to_string(),
                    user_metadata: HashMap::new(),
                    acl_json: "{}".to_string(),
                    owner_id: "o".to_string(),
                    owner_display: "o".to_string(),
                    storage_class: "STANDARD".to_string(),
                    content_encoding: None,
                    content_language: None,
                    content_disposition: None,
                    cache_control: None,
                    expires: None,
                })
                .unwrap();
        }

        let state = AppState::from_config(config).await.unwrap();
        assert!(state.metadata.get_upload("stale").unwrap().is_none());
    }

    #[actix_web::test]
    async fn test_credential_seeding_is_idempotent_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.metadata.sqlite.path = dir
            .path()
            .join("meta.sqlite")
            .to_string_lossy()
            .into_owned();
        config.storage.backend = StorageBackendKind::Memory;
        config.auth.access_key = "AKIATEST".to_string();
        config.auth.secret_key = "first-secret".to_string();

        let state = AppState::from_config(config.clone()).await.unwrap();
        drop(state);

        // A restart with a changed config secret does not clobber the row.
        config.auth.secret_key = "second-secret".to_string();
        let state = AppState::from_config(config).await.unwrap();
        let credential = state.metadata.get_credential("AKIATEST").unwrap().unwrap();
        assert_eq!(credential.secret_key, "first-secret");
    }
}
